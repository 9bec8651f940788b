//! Connection session state machine.
//!
//! Pure: consumes lifecycle inputs (caller intents, transport edges, the
//! handful of session-level frames) and emits actions for the worker loop to
//! execute. Owns no IO and no tables; stores, subscriptions, and methods stay
//! with the worker so this machine can be driven exhaustively in tests.

pub mod backoff;

use std::time::Duration;

use crate::config::BackoffPolicy;
use crate::protocol::ProtocolVersion;
use backoff::Backoff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    /// Socket open, `connect` sent, waiting for the server's `connected`.
    AwaitingConnected,
    Connected,
    Reconnecting,
}

/// Instructions for the worker loop. Order within one returned batch is the
/// execution order.
#[derive(Debug, PartialEq)]
pub enum SessionAction {
    /// Tear down any existing transport (failing outstanding methods) and
    /// open a fresh one under a new generation.
    OpenTransport,
    /// Ask the current transport to close.
    CloseTransport,
    SendConnect {
        version: &'static str,
        support: Vec<String>,
    },
    /// Drop server-sourced documents, keeping offline-restored entries.
    ResetCollections,
    /// Queue `sub` frames for every recorded subscription.
    ReplaySubscriptions,
    /// DDP session established: notify readiness, resume a held login token,
    /// re-issue subscriptions.
    SessionEstablished {
        session: String,
    },
    SendPong {
        id: Option<String>,
    },
    /// Fail every outstanding method with the disconnect error. Must run
    /// before `NotifyDisconnected`.
    FailOutstandingMethods,
    NotifyDisconnected,
    ScheduleReconnect {
        delay: Duration,
    },
}

#[derive(Debug)]
pub struct Session {
    phase: Phase,
    version: ProtocolVersion,
    backoff: Backoff,
    disconnect_requested: bool,
}

impl Session {
    pub fn new(version: ProtocolVersion, policy: BackoffPolicy) -> Self {
        Self {
            phase: Phase::Disconnected,
            version,
            backoff: Backoff::new(policy),
            disconnect_requested: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    pub fn tries(&self) -> u32 {
        self.backoff.tries()
    }

    /// Caller intent to (re)connect. Valid from any state; an existing
    /// transport is dropped and replaced.
    pub fn connect(&mut self) -> Vec<SessionAction> {
        self.disconnect_requested = false;
        self.phase = Phase::Disconnected;
        vec![SessionAction::OpenTransport]
    }

    /// Caller intent to disconnect and stay down. While reconnecting there
    /// is no transport to close; the pending retry is abandoned instead.
    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        if self.phase == Phase::Reconnecting {
            self.phase = Phase::Disconnected;
            self.disconnect_requested = false;
        } else {
            self.disconnect_requested = true;
        }
        vec![SessionAction::CloseTransport]
    }

    pub fn on_transport_open(&mut self) -> Vec<SessionAction> {
        self.phase = Phase::AwaitingConnected;
        self.backoff.reset();
        vec![
            SessionAction::SendConnect {
                version: self.version.wire_name(),
                support: self.version.support(),
            },
            SessionAction::ResetCollections,
            SessionAction::ReplaySubscriptions,
        ]
    }

    pub fn on_connected_frame(&mut self, session: String) -> Vec<SessionAction> {
        self.phase = Phase::Connected;
        vec![SessionAction::SessionEstablished { session }]
    }

    pub fn on_server_ping(&self, id: Option<String>) -> Vec<SessionAction> {
        vec![SessionAction::SendPong { id }]
    }

    pub fn on_transport_closed(&mut self) -> Vec<SessionAction> {
        let mut actions = vec![
            SessionAction::FailOutstandingMethods,
            SessionAction::NotifyDisconnected,
        ];
        if self.disconnect_requested {
            self.disconnect_requested = false;
            self.phase = Phase::Disconnected;
        } else {
            self.phase = Phase::Reconnecting;
            actions.push(SessionAction::ScheduleReconnect {
                delay: self.backoff.next_delay(),
            });
        }
        actions
    }

    /// Reconnect timer fired. Idempotent: a session that connected in the
    /// meantime (or was intentionally disconnected) ignores the tick.
    pub fn on_reconnect_timer(&mut self) -> Vec<SessionAction> {
        match self.phase {
            Phase::Reconnecting => vec![SessionAction::OpenTransport],
            Phase::Disconnected | Phase::AwaitingConnected | Phase::Connected => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ProtocolVersion::V1, BackoffPolicy::default())
    }

    #[test]
    fn connect_negotiate_establish() {
        let mut s = session();
        assert_eq!(s.connect(), [SessionAction::OpenTransport]);

        let actions = s.on_transport_open();
        assert_eq!(s.phase(), Phase::AwaitingConnected);
        assert_eq!(
            actions[0],
            SessionAction::SendConnect {
                version: "1",
                support: vec!["1".to_string(), "pre2".to_string()],
            }
        );
        assert_eq!(actions[1], SessionAction::ResetCollections);
        assert_eq!(actions[2], SessionAction::ReplaySubscriptions);

        let actions = s.on_connected_frame("sess".to_string());
        assert_eq!(s.phase(), Phase::Connected);
        assert_eq!(
            actions,
            [SessionAction::SessionEstablished {
                session: "sess".to_string()
            }]
        );
    }

    #[test]
    fn legacy_version_advertises_pre_releases() {
        let mut s = Session::new(ProtocolVersion::Pre2, BackoffPolicy::default());
        let actions = s.on_transport_open();
        assert_eq!(
            actions[0],
            SessionAction::SendConnect {
                version: "pre2",
                support: vec!["pre2".to_string(), "pre1".to_string()],
            }
        );
    }

    #[test]
    fn unrequested_close_schedules_linear_reconnect() {
        let mut s = session();
        s.connect();
        s.on_transport_open();

        let actions = s.on_transport_closed();
        assert_eq!(s.phase(), Phase::Reconnecting);
        assert_eq!(actions[0], SessionAction::FailOutstandingMethods);
        assert_eq!(actions[1], SessionAction::NotifyDisconnected);
        assert_eq!(
            actions[2],
            SessionAction::ScheduleReconnect {
                delay: Duration::from_secs(5)
            }
        );

        // Second failure backs off further without an intervening open.
        let actions = s.on_transport_closed();
        assert_eq!(
            actions[2],
            SessionAction::ScheduleReconnect {
                delay: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn requested_close_stays_down() {
        let mut s = session();
        s.connect();
        s.on_transport_open();
        assert_eq!(s.disconnect(), [SessionAction::CloseTransport]);

        let actions = s.on_transport_closed();
        assert_eq!(s.phase(), Phase::Disconnected);
        assert_eq!(
            actions,
            [
                SessionAction::FailOutstandingMethods,
                SessionAction::NotifyDisconnected,
            ]
        );
        assert!(s.on_reconnect_timer().is_empty());
    }

    #[test]
    fn disconnect_while_reconnecting_abandons_the_retry() {
        let mut s = session();
        s.connect();
        s.on_transport_open();
        s.on_transport_closed();
        assert_eq!(s.phase(), Phase::Reconnecting);

        s.disconnect();
        assert_eq!(s.phase(), Phase::Disconnected);
        assert!(s.on_reconnect_timer().is_empty());
    }

    #[test]
    fn successful_open_resets_backoff() {
        let mut s = session();
        s.connect();
        s.on_transport_open();
        s.on_transport_closed();
        s.on_transport_closed();
        s.on_transport_open();

        let actions = s.on_transport_closed();
        assert_eq!(
            actions[2],
            SessionAction::ScheduleReconnect {
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn reconnect_timer_is_idempotent() {
        let mut s = session();
        s.connect();
        s.on_transport_open();
        s.on_transport_closed();
        assert_eq!(s.on_reconnect_timer(), [SessionAction::OpenTransport]);

        // Timer racing a connection that already came back does nothing.
        s.on_transport_open();
        s.on_connected_frame("sess".to_string());
        assert!(s.on_reconnect_timer().is_empty());
    }

    #[test]
    fn server_ping_is_answered_with_matching_id() {
        let s = session();
        assert_eq!(
            s.on_server_ping(Some("p1".to_string())),
            [SessionAction::SendPong {
                id: Some("p1".to_string())
            }]
        );
        assert_eq!(s.on_server_ping(None), [SessionAction::SendPong { id: None }]);
    }
}
