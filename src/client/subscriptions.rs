//! Subscription records, grouped readiness, and replay bookkeeping.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;

use crate::core::ordered_map::OrderedMap;
use crate::protocol::ClientMessage;

/// Invoked whenever this subscription's `ready` arrives (again after each
/// reconnect replay).
pub type ReadyCallback = Box<dyn FnMut() + Send>;
/// Fires exactly once, when every member of a group is ready.
pub type GroupReadyCallback = Box<dyn FnOnce() + Send>;

pub struct Subscription {
    pub id: String,
    pub name: String,
    pub params: Option<Vec<Value>>,
    pub ready: bool,
    on_ready: Option<ReadyCallback>,
}

struct Group {
    members: Vec<String>,
    fired: bool,
    on_ready: Option<GroupReadyCallback>,
}

pub enum UnsubscribeTarget {
    /// A plain subscription; send one `unsub`.
    Single,
    /// A group; send `unsub` for each member id.
    Group(Vec<String>),
    Unknown,
}

#[derive(Default)]
pub struct SubscriptionManager {
    // Insertion order is replay order.
    subs: OrderedMap<String, Subscription>,
    groups: HashMap<String, Group>,
}

impl SubscriptionManager {
    pub fn add(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        params: Option<Vec<Value>>,
        on_ready: Option<ReadyCallback>,
    ) {
        let id = id.into();
        self.subs.insert(
            id.clone(),
            Subscription {
                id,
                name: name.into(),
                params,
                ready: false,
                on_ready,
            },
        );
    }

    pub fn add_group(
        &mut self,
        group_id: impl Into<String>,
        members: Vec<String>,
        on_ready: Option<GroupReadyCallback>,
    ) {
        self.groups.insert(
            group_id.into(),
            Group {
                members,
                fired: false,
                on_ready,
            },
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subs.contains_key(id)
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.subs.get(id).is_some_and(|sub| sub.ready)
    }

    /// Active (name, params) pairs in registration order.
    pub fn active(&self) -> Vec<(String, Option<Vec<Value>>)> {
        self.subs
            .values()
            .map(|sub| (sub.name.clone(), sub.params.clone()))
            .collect()
    }

    /// `ready {subs}`: mark each listed id ready, run its callback, then
    /// fire any group whose members are now all ready.
    pub fn handle_ready(&mut self, ids: &[String]) {
        for id in ids {
            let Some(sub) = self.subs.get_mut(id.as_str()) else {
                continue;
            };
            sub.ready = true;
            if let Some(callback) = sub.on_ready.as_mut()
                && catch_unwind(AssertUnwindSafe(|| callback())).is_err()
            {
                tracing::warn!(sub = %id, "ready callback panicked");
            }
        }

        let subs = &self.subs;
        for (group_id, group) in self.groups.iter_mut() {
            if group.fired {
                continue;
            }
            let all_ready = group
                .members
                .iter()
                .all(|member| subs.get(member.as_str()).is_some_and(|sub| sub.ready));
            if !all_ready {
                continue;
            }
            group.fired = true;
            if let Some(callback) = group.on_ready.take()
                && catch_unwind(AssertUnwindSafe(callback)).is_err()
            {
                tracing::warn!(group = %group_id, "group ready callback panicked");
            }
        }
    }

    /// `nosub`: drop the record. A server error also dooms any group that
    /// was still waiting on this member; its readiness can never arrive.
    pub fn handle_nosub(&mut self, id: &str, error: Option<&Value>) {
        if let Some(sub) = self.subs.remove(id) {
            if let Some(error) = error {
                tracing::warn!(sub = %id, name = %sub.name, %error, "subscription refused");
            }
        }
        if error.is_some() {
            self.groups.retain(|group_id, group| {
                let doomed = !group.fired && group.members.iter().any(|m| m == id);
                if doomed {
                    tracing::warn!(group = %group_id, member = %id, "dropping group; member subscription failed");
                }
                !doomed
            });
        }
    }

    pub fn unsubscribe_target(&mut self, id: &str) -> UnsubscribeTarget {
        if let Some(group) = self.groups.remove(id) {
            for member in &group.members {
                self.subs.remove(member.as_str());
            }
            return UnsubscribeTarget::Group(group.members);
        }
        if self.subs.remove(id).is_some() {
            return UnsubscribeTarget::Single;
        }
        UnsubscribeTarget::Unknown
    }

    /// Frames re-issuing every subscription after (re)connect. Readiness is
    /// cleared; groups that already fired stay fired.
    pub fn replay_frames(&mut self) -> Vec<ClientMessage> {
        let mut frames = Vec::with_capacity(self.subs.len());
        let ids: Vec<String> = self.subs.keys().cloned().collect();
        for id in ids {
            let sub = self.subs.get_mut(id.as_str()).expect("sub exists during replay");
            sub.ready = false;
            frames.push(ClientMessage::Sub {
                id: sub.id.clone(),
                name: sub.name.clone(),
                params: sub.params.clone(),
            });
        }
        frames
    }
}
