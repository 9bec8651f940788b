//! Client handle and worker event loop.
//!
//! This is the serialization point: one worker thread owns the session,
//! store, watcher tables, and subscription/method bookkeeping. Caller
//! operations become `Command`s on a channel; transport IO threads feed
//! `TransportEvent`s tagged with a connection generation; timers (reconnect,
//! heartbeat, persist debounce) are deadlines folded into the worker's
//! `select!`. Every callback (watcher, method, ready, logon) runs on the
//! worker thread.

pub mod auth;
pub mod methods;
pub mod subscriptions;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use serde_json::{Map, Value, json};

use crate::config::ClientConfig;
use crate::core::document::Document;
use crate::core::ejson;
use crate::core::ids::{IdAllocator, random_document_id};
use crate::error::ClientError;
use crate::offline;
use crate::paths;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{Phase, Session, SessionAction};
use crate::store::codec::{Codec, JsonCodec};
use crate::store::dispatch::{ChangeDispatcher, WatchCallback, WatchPredicate, WatcherId};
use crate::store::{CollectionStore, StoredEntry, build_update_modifier};
use crate::transport::{Connector, Transport, TransportEvent, TransportEventKind, WebSocketConnector};

pub use auth::{AuthSession, AuthState, LogonCallback, OauthCredential, UserLocator};
pub use methods::MethodCallback;
pub use subscriptions::{GroupReadyCallback, ReadyCallback};

use auth::AuthManager;
use methods::{MethodKind, MethodManager, server_error};
use subscriptions::{SubscriptionManager, UnsubscribeTarget};

/// Connection-lifecycle notifications, drained by the host.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// WebSocket open; version negotiation in progress.
    Connected,
    /// DDP session established; methods and subscriptions are live.
    Ready,
    Disconnected,
    /// Auth state changed.
    SessionUpdate {
        user_id: Option<String>,
        logged_in: bool,
    },
}

type FindPredicate = Box<dyn Fn(&StoredEntry) -> bool + Send>;

enum Command {
    Connect,
    Disconnect,
    Call {
        id: String,
        name: String,
        params: Vec<Value>,
        callback: Option<MethodCallback>,
    },
    Subscribe {
        id: String,
        name: String,
        params: Option<Vec<Value>>,
        on_ready: Option<ReadyCallback>,
    },
    SubscribeMany {
        group_id: String,
        members: Vec<(String, String, Option<Vec<Value>>)>,
        on_ready: Option<GroupReadyCallback>,
    },
    Unsubscribe {
        id: String,
    },
    RegisterCodec {
        collection: String,
        codec: Box<dyn Codec>,
    },
    Watch {
        watcher_id: WatcherId,
        collection: String,
        predicate: Option<WatchPredicate>,
        callback: WatchCallback,
    },
    WatchDocument {
        watcher_id: WatcherId,
        collection: String,
        target: String,
        callback: WatchCallback,
    },
    Unwatch {
        watcher_id: WatcherId,
    },
    Insert {
        collection: String,
        doc: Document,
        method_id: String,
        callback: Option<MethodCallback>,
    },
    Update {
        collection: String,
        id: String,
        changes: Map<String, Value>,
        method_id: String,
        callback: Option<MethodCallback>,
    },
    Remove {
        collection: String,
        id: String,
        method_id: String,
        callback: Option<MethodCallback>,
    },
    FindOne {
        collection: String,
        id: String,
        reply: Sender<Option<StoredEntry>>,
    },
    Find {
        collection: String,
        predicate: FindPredicate,
        reply: Sender<Vec<StoredEntry>>,
    },
    OrderedIds {
        collection: String,
        reply: Sender<Vec<String>>,
    },
    AwaitingUpdated {
        reply: Sender<Vec<String>>,
    },
    SessionPhase {
        reply: Sender<Phase>,
    },
    Logon {
        method: String,
        params: Value,
        callback: Option<LogonCallback>,
    },
    LogonOauth {
        service: String,
        token: String,
        callback: Option<LogonCallback>,
    },
    OauthFetched {
        result: Result<OauthCredential, ClientError>,
    },
    Logout,
    Persist {
        collection: String,
    },
    Restore {
        collection: String,
        reply: Sender<Result<usize, ClientError>>,
    },
    ClearOffline {
        collection: String,
        reply: Sender<Result<(), ClientError>>,
    },
    Shutdown,
}

/// Wire and watcher ids, allocated handle-side. Registration commands never
/// wait on a worker reply; a watcher callback may register further watchers.
#[derive(Debug, Default)]
struct SharedIds {
    wire: IdAllocator,
    watchers: AtomicU64,
}

impl SharedIds {
    fn next_wire(&self) -> String {
        self.wire.next_id()
    }

    fn next_watcher(&self) -> WatcherId {
        self.watchers.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Cloneable handle onto the worker. Dropping every clone shuts the worker
/// down once its command channel disconnects.
#[derive(Clone)]
pub struct Client {
    commands: Sender<Command>,
    ids: Arc<SharedIds>,
}

impl Client {
    /// Spawn a worker using the production WebSocket transport. Returns the
    /// handle and the lifecycle event stream.
    pub fn start(config: ClientConfig) -> (Client, Receiver<ClientEvent>) {
        Self::start_with_connector(config, Box::new(WebSocketConnector))
    }

    /// Spawn a worker with a caller-supplied transport factory (tests use a
    /// scripted fake).
    pub fn start_with_connector(
        config: ClientConfig,
        connector: Box<dyn Connector>,
    ) -> (Client, Receiver<ClientEvent>) {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (transport_tx, transport_rx) = unbounded();
        let ids = Arc::new(SharedIds::default());
        let cache_dir = paths::cache_dir(config.cache_dir.as_deref());

        let worker = Worker {
            session: Session::new(config.version, config.backoff),
            config,
            connector,
            events: event_tx,
            commands_tx: command_tx.clone(),
            transport_tx,
            ids: Arc::clone(&ids),
            generation: 0,
            transport: None,
            store: CollectionStore::default(),
            dispatcher: ChangeDispatcher::default(),
            subscriptions: SubscriptionManager::default(),
            methods: MethodManager::default(),
            auth: AuthManager::default(),
            reconnect_at: None,
            heartbeat_at: None,
            persist_at: None,
            dirty_collections: BTreeSet::new(),
            cache_dir,
        };

        std::thread::Builder::new()
            .name("ddp-worker".to_string())
            .spawn(move || run_worker_loop(worker, command_rx, transport_rx))
            .expect("spawn ddp worker thread");

        (
            Client {
                commands: command_tx,
                ids,
            },
            event_rx,
        )
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect)
    }

    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send(Command::Shutdown)
    }

    /// Invoke a server method. Returns the allocated method id; the
    /// callback fires on the worker with the result or failure.
    pub fn call(
        &self,
        name: &str,
        params: Vec<Value>,
        callback: Option<MethodCallback>,
    ) -> Result<String, ClientError> {
        let id = self.ids.next_wire();
        self.send(Command::Call {
            id: id.clone(),
            name: name.to_string(),
            params,
            callback,
        })?;
        Ok(id)
    }

    /// Subscribe to a named publication. Returns the subscription id.
    pub fn subscribe(
        &self,
        name: &str,
        params: Option<Vec<Value>>,
        on_ready: Option<ReadyCallback>,
    ) -> Result<String, ClientError> {
        let id = self.ids.next_wire();
        self.send(Command::Subscribe {
            id: id.clone(),
            name: name.to_string(),
            params,
            on_ready,
        })?;
        Ok(id)
    }

    /// Subscribe to several publications as a group whose `on_ready` fires
    /// exactly once, after every member is ready. Returns the group id.
    pub fn subscribe_many(
        &self,
        specs: Vec<(String, Option<Vec<Value>>)>,
        on_ready: Option<GroupReadyCallback>,
    ) -> Result<String, ClientError> {
        let members = specs
            .into_iter()
            .map(|(name, params)| (self.ids.next_wire(), name, params))
            .collect();
        let group_id = self.ids.next_wire();
        self.send(Command::SubscribeMany {
            group_id: group_id.clone(),
            members,
            on_ready,
        })?;
        Ok(group_id)
    }

    /// Unsubscribe a subscription or a whole group. A no-op while
    /// disconnected.
    pub fn unsubscribe(&self, id: &str) -> Result<(), ClientError> {
        self.send(Command::Unsubscribe { id: id.to_string() })
    }

    /// Register the typed codec for a collection. Documents already stored
    /// raw are not retroactively converted.
    pub fn register_codec<T>(&self, collection: &str) -> Result<(), ClientError>
    where
        T: serde::Serialize
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug
            + Send
            + 'static,
    {
        self.register_codec_boxed(collection, Box::new(JsonCodec::<T>::new()))
    }

    pub fn register_codec_boxed(
        &self,
        collection: &str,
        codec: Box<dyn Codec>,
    ) -> Result<(), ClientError> {
        self.send(Command::RegisterCodec {
            collection: collection.to_string(),
            codec,
        })
    }

    /// Watch a collection, optionally filtered by a predicate over the
    /// post-op value. Removals always pass the filter.
    pub fn watch(
        &self,
        collection: &str,
        predicate: Option<WatchPredicate>,
        callback: WatchCallback,
    ) -> Result<WatcherId, ClientError> {
        let watcher_id = self.ids.next_watcher();
        self.send(Command::Watch {
            watcher_id,
            collection: collection.to_string(),
            predicate,
            callback,
        })?;
        Ok(watcher_id)
    }

    /// Watch a single document by id.
    pub fn watch_document(
        &self,
        collection: &str,
        id: &str,
        callback: WatchCallback,
    ) -> Result<WatcherId, ClientError> {
        let watcher_id = self.ids.next_watcher();
        self.send(Command::WatchDocument {
            watcher_id,
            collection: collection.to_string(),
            target: id.to_string(),
            callback,
        })?;
        Ok(watcher_id)
    }

    pub fn unwatch(&self, watcher_id: WatcherId) -> Result<(), ClientError> {
        self.send(Command::Unwatch { watcher_id })
    }

    /// Optimistic insert: the document lands in the local store at once and
    /// `/<collection>/insert` is sent; the server's echoed `added` becomes
    /// the authoritative value. A missing `_id` is generated. Returns the
    /// document id.
    pub fn insert(
        &self,
        collection: &str,
        mut value: Value,
        callback: Option<MethodCallback>,
    ) -> Result<String, ClientError> {
        let Some(map) = value.as_object_mut() else {
            return Err(ClientError::InvalidDocument {
                reason: "not a json object".to_string(),
            });
        };
        let id = match map.get("_id") {
            Some(Value::String(id)) => id.clone(),
            Some(_) => {
                return Err(ClientError::InvalidDocument {
                    reason: "_id must be a string".to_string(),
                });
            }
            None => {
                let id = random_document_id();
                map.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let doc = Document::from_value(value).map_err(|err| ClientError::InvalidDocument {
            reason: err.to_string(),
        })?;
        self.send(Command::Insert {
            collection: collection.to_string(),
            doc,
            method_id: self.ids.next_wire(),
            callback,
        })?;
        Ok(id)
    }

    /// Send `/<collection>/update` with a `{$set, $unset}` modifier built
    /// from `changes`; a `Value::Null` marks a field for `$unset`. No local
    /// mutation happens; the server echoes a `changed`.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        changes: Map<String, Value>,
        callback: Option<MethodCallback>,
    ) -> Result<(), ClientError> {
        self.send(Command::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            changes,
            method_id: self.ids.next_wire(),
            callback,
        })
    }

    /// Optimistic remove: drops the local document and sends
    /// `/<collection>/remove`.
    pub fn remove(
        &self,
        collection: &str,
        id: &str,
        callback: Option<MethodCallback>,
    ) -> Result<(), ClientError> {
        self.send(Command::Remove {
            collection: collection.to_string(),
            id: id.to_string(),
            method_id: self.ids.next_wire(),
            callback,
        })
    }

    /// Point-in-time snapshot of one document. Blocks on the worker; do not
    /// call from inside a watcher callback.
    pub fn find_one(&self, collection: &str, id: &str) -> Result<Option<StoredEntry>, ClientError> {
        self.request(|reply| Command::FindOne {
            collection: collection.to_string(),
            id: id.to_string(),
            reply,
        })
    }

    /// Typed snapshot of one document, when a codec decoded it.
    pub fn find_one_as<T: Clone + 'static>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, ClientError> {
        Ok(self.find_one(collection, id)?.and_then(|entry| {
            entry
                .typed_ref()
                .and_then(|typed| typed.as_any().downcast_ref::<T>().cloned())
        }))
    }

    /// Snapshot of every document matching the predicate, in collection
    /// order. Blocks on the worker.
    pub fn find(
        &self,
        collection: &str,
        predicate: impl Fn(&StoredEntry) -> bool + Send + 'static,
    ) -> Result<Vec<StoredEntry>, ClientError> {
        self.request(|reply| Command::Find {
            collection: collection.to_string(),
            predicate: Box::new(predicate),
            reply,
        })
    }

    /// The collection's ids in store order.
    pub fn ordered_ids(&self, collection: &str) -> Result<Vec<String>, ClientError> {
        self.request(|reply| Command::OrderedIds {
            collection: collection.to_string(),
            reply,
        })
    }

    /// Method ids whose data effects have not yet been confirmed by an
    /// `updated` frame. Advisory introspection only.
    pub fn awaiting_updated(&self) -> Result<Vec<String>, ClientError> {
        self.request(|reply| Command::AwaitingUpdated { reply })
    }

    pub fn session_phase(&self) -> Result<Phase, ClientError> {
        self.request(|reply| Command::SessionPhase { reply })
    }

    pub fn login_with_username(
        &self,
        username: &str,
        password: &str,
        callback: Option<LogonCallback>,
    ) -> Result<(), ClientError> {
        let params = auth::password_params(&UserLocator::Username(username.to_string()), password);
        self.logon("login", params, callback)
    }

    pub fn login_with_email(
        &self,
        email: &str,
        password: &str,
        callback: Option<LogonCallback>,
    ) -> Result<(), ClientError> {
        let params = auth::password_params(&UserLocator::Email(email.to_string()), password);
        self.logon("login", params, callback)
    }

    /// Resume a previous session from a stored token.
    pub fn login_with_token(
        &self,
        token: &str,
        callback: Option<LogonCallback>,
    ) -> Result<(), ClientError> {
        self.logon("login", auth::resume_params(token), callback)
    }

    pub fn signup(
        &self,
        username: &str,
        email: &str,
        password: &str,
        profile: Map<String, Value>,
        callback: Option<LogonCallback>,
    ) -> Result<(), ClientError> {
        let params = auth::signup_params(username, email, password, profile);
        self.logon("createUser", params, callback)
    }

    /// Third-party login: fetch the OAuth completion page for `service`,
    /// scrape the credential pair, then `login`.
    pub fn login_with_oauth(
        &self,
        service: &str,
        token: &str,
        callback: Option<LogonCallback>,
    ) -> Result<(), ClientError> {
        self.send(Command::LogonOauth {
            service: service.to_string(),
            token: token.to_string(),
            callback,
        })
    }

    /// Fire-and-forget `logout`, then a local transition to logged out.
    pub fn logout(&self) -> Result<(), ClientError> {
        self.send(Command::Logout)
    }

    /// Schedule an offline persist of the collection; writes coalesce
    /// behind the configured debounce.
    pub fn persist(&self, collection: &str) -> Result<(), ClientError> {
        self.send(Command::Persist {
            collection: collection.to_string(),
        })
    }

    /// Load the collection's cache file, marking every restored document
    /// `_wasOffline_`. Returns how many documents were restored.
    pub fn restore(&self, collection: &str) -> Result<usize, ClientError> {
        self.request(|reply| Command::Restore {
            collection: collection.to_string(),
            reply,
        })?
    }

    /// Drop documents still flagged `_wasOffline_` and delete the cache
    /// file.
    pub fn clear_offline(&self, collection: &str) -> Result<(), ClientError> {
        self.request(|reply| Command::ClearOffline {
            collection: collection.to_string(),
            reply,
        })?
    }

    fn logon(
        &self,
        method: &str,
        params: Value,
        callback: Option<LogonCallback>,
    ) -> Result<(), ClientError> {
        self.send(Command::Logon {
            method: method.to_string(),
            params,
            callback,
        })
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::WorkerGone)
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T, ClientError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(build(reply_tx))?;
        reply_rx.recv().map_err(|_| ClientError::WorkerGone)
    }
}

// ---------------------------------------------------------------------------
// Worker

struct Worker {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    events: Sender<ClientEvent>,
    commands_tx: Sender<Command>,
    transport_tx: Sender<TransportEvent>,
    ids: Arc<SharedIds>,
    session: Session,
    generation: u64,
    transport: Option<Box<dyn Transport>>,
    store: CollectionStore,
    dispatcher: ChangeDispatcher,
    subscriptions: SubscriptionManager,
    methods: MethodManager,
    auth: AuthManager,
    reconnect_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
    persist_at: Option<Instant>,
    dirty_collections: BTreeSet<String>,
    cache_dir: PathBuf,
}

fn run_worker_loop(
    mut worker: Worker,
    commands: Receiver<Command>,
    transport_rx: Receiver<TransportEvent>,
) {
    loop {
        let tick = match worker.next_deadline() {
            Some(deadline) => {
                crossbeam::channel::after(deadline.saturating_duration_since(Instant::now()))
            }
            None => crossbeam::channel::never(),
        };
        crossbeam::select! {
            recv(commands) -> message => match message {
                Ok(Command::Shutdown) | Err(_) => {
                    worker.teardown();
                    return;
                }
                Ok(command) => worker.handle_command(command),
            },
            recv(transport_rx) -> event => {
                if let Ok(event) = event {
                    worker.handle_transport_event(event);
                }
            }
            recv(tick) -> _ => worker.handle_timers(),
        }
    }
}

impl Worker {
    fn next_deadline(&self) -> Option<Instant> {
        [self.reconnect_at, self.heartbeat_at, self.persist_at]
            .into_iter()
            .flatten()
            .min()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let actions = self.session.connect();
                self.execute(actions);
            }
            Command::Disconnect => {
                let actions = self.session.disconnect();
                self.execute(actions);
            }
            Command::Call {
                id,
                name,
                params,
                callback,
            } => self.do_call(id, name, params, callback),
            Command::Subscribe {
                id,
                name,
                params,
                on_ready,
            } => {
                self.subscriptions
                    .add(id.clone(), name.clone(), params.clone(), on_ready);
                if self.session.is_connected() {
                    self.send_frame(&ClientMessage::Sub { id, name, params });
                }
            }
            Command::SubscribeMany {
                group_id,
                members,
                on_ready,
            } => {
                let mut member_ids = Vec::with_capacity(members.len());
                for (id, name, params) in members {
                    member_ids.push(id.clone());
                    self.subscriptions
                        .add(id.clone(), name.clone(), params.clone(), None);
                    if self.session.is_connected() {
                        self.send_frame(&ClientMessage::Sub { id, name, params });
                    }
                }
                self.subscriptions.add_group(group_id, member_ids, on_ready);
            }
            Command::Unsubscribe { id } => {
                if !self.session.is_connected() {
                    tracing::debug!(%id, "unsubscribe while disconnected is a no-op");
                    return;
                }
                match self.subscriptions.unsubscribe_target(&id) {
                    UnsubscribeTarget::Single => {
                        self.send_frame(&ClientMessage::Unsub { id });
                    }
                    UnsubscribeTarget::Group(members) => {
                        for member in members {
                            self.send_frame(&ClientMessage::Unsub { id: member });
                        }
                    }
                    UnsubscribeTarget::Unknown => {
                        tracing::debug!(%id, "unsubscribe for unknown id");
                    }
                }
            }
            Command::RegisterCodec { collection, codec } => {
                self.store.register_codec(&collection, codec);
            }
            Command::Watch {
                watcher_id,
                collection,
                predicate,
                callback,
            } => {
                self.dispatcher
                    .watch_with_id(watcher_id, collection, predicate, callback);
            }
            Command::WatchDocument {
                watcher_id,
                collection,
                target,
                callback,
            } => {
                self.dispatcher
                    .watch_document_with_id(watcher_id, collection, target, callback);
            }
            Command::Unwatch { watcher_id } => {
                self.dispatcher.remove(watcher_id);
            }
            Command::Insert {
                collection,
                doc,
                method_id,
                callback,
            } => {
                let value = doc.to_value();
                let event = self.store.insert_local(&collection, doc);
                self.dispatcher.dispatch(&event);
                self.do_call(
                    method_id,
                    format!("/{collection}/insert"),
                    vec![value],
                    callback,
                );
            }
            Command::Update {
                collection,
                id,
                changes,
                method_id,
                callback,
            } => {
                let selector = json!({ "_id": id });
                let modifier = build_update_modifier(changes);
                self.do_call(
                    method_id,
                    format!("/{collection}/update"),
                    vec![selector, modifier],
                    callback,
                );
            }
            Command::Remove {
                collection,
                id,
                method_id,
                callback,
            } => {
                let event = self.store.remove_local(&collection, &id);
                self.dispatcher.dispatch(&event);
                self.do_call(
                    method_id,
                    format!("/{collection}/remove"),
                    vec![json!({ "_id": id })],
                    callback,
                );
            }
            Command::FindOne {
                collection,
                id,
                reply,
            } => {
                let _ = reply.send(self.store.get(&collection, &id).cloned());
            }
            Command::Find {
                collection,
                predicate,
                reply,
            } => {
                let _ = reply.send(self.store.find(&collection, |entry| predicate(entry)));
            }
            Command::OrderedIds { collection, reply } => {
                let _ = reply.send(self.store.ids_in_order(&collection));
            }
            Command::AwaitingUpdated { reply } => {
                let _ = reply.send(self.methods.awaiting_updated());
            }
            Command::SessionPhase { reply } => {
                let _ = reply.send(self.session.phase());
            }
            Command::Logon {
                method,
                params,
                callback,
            } => self.start_logon(&method, params, callback),
            Command::LogonOauth {
                service,
                token,
                callback,
            } => self.start_oauth(service, token, callback),
            Command::OauthFetched { result } => self.finish_oauth(result),
            Command::Logout => {
                if self.session.is_connected() {
                    let id = self.ids.next_wire();
                    self.methods.register(id.clone(), MethodKind::User, None);
                    self.send_frame(&ClientMessage::Method {
                        id,
                        method: "logout".to_string(),
                        params: None,
                    });
                }
                self.auth.logout();
                self.emit_session_update();
            }
            Command::Persist { collection } => {
                self.dirty_collections.insert(collection);
                if self.persist_at.is_none() {
                    self.persist_at = Some(Instant::now() + self.config.persist_debounce());
                }
            }
            Command::Restore { collection, reply } => {
                let _ = reply.send(self.restore_collection(&collection));
            }
            Command::ClearOffline { collection, reply } => {
                let _ = reply.send(self.clear_offline_collection(&collection));
            }
            Command::Shutdown => unreachable!("shutdown handled by the loop"),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if event.generation != self.generation {
            return;
        }
        match event.kind {
            TransportEventKind::Opened => {
                let _ = self.events.send(ClientEvent::Connected);
                let actions = self.session.on_transport_open();
                self.execute(actions);
            }
            TransportEventKind::Message(text) => self.handle_frame(&text),
            TransportEventKind::Error(message) => {
                tracing::warn!(%message, "transport failure");
            }
            TransportEventKind::Closed => {
                self.transport = None;
                let actions = self.session.on_transport_closed();
                self.execute(actions);
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed frame");
                return;
            }
        };
        match message {
            ServerMessage::Connected { session } => {
                let actions = self.session.on_connected_frame(session);
                self.execute(actions);
            }
            ServerMessage::Ping { id } => {
                let actions = self.session.on_server_ping(id);
                self.execute(actions);
            }
            ServerMessage::Pong { id } => {
                tracing::debug!(?id, "heartbeat pong");
            }
            ServerMessage::Added {
                collection,
                id,
                fields,
            } => {
                let event = self.store.apply_added(&collection, &id, fields);
                self.dispatcher.dispatch(&event);
            }
            ServerMessage::AddedBefore {
                collection,
                id,
                fields,
                before,
            } => {
                let event =
                    self.store
                        .apply_added_before(&collection, &id, fields, before.as_deref());
                self.dispatcher.dispatch(&event);
            }
            ServerMessage::Changed {
                collection,
                id,
                fields,
                cleared,
            } => {
                let event = self.store.apply_changed(&collection, &id, fields, cleared);
                self.dispatcher.dispatch(&event);
            }
            ServerMessage::MovedBefore {
                collection,
                id,
                before,
            } => {
                if let Some(event) =
                    self.store
                        .apply_moved_before(&collection, &id, before.as_deref())
                {
                    self.dispatcher.dispatch(&event);
                }
            }
            ServerMessage::Removed { collection, id } => {
                let event = self.store.apply_removed(&collection, &id);
                self.dispatcher.dispatch(&event);
            }
            ServerMessage::Ready { subs } => {
                self.subscriptions.handle_ready(&subs);
            }
            ServerMessage::Nosub { id, error } => {
                self.subscriptions.handle_nosub(&id, error.as_ref());
            }
            ServerMessage::Result { id, result, error } => {
                self.handle_result(&id, result, error);
            }
            ServerMessage::Updated { methods } => {
                self.methods.on_updated(&methods);
            }
            ServerMessage::Error {
                reason,
                offending_message,
            } => {
                tracing::warn!(?reason, ?offending_message, "server reported protocol error");
            }
        }
    }

    fn execute(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::OpenTransport => self.open_transport(),
                SessionAction::CloseTransport => {
                    if let Some(transport) = self.transport.as_mut() {
                        transport.close();
                    }
                }
                SessionAction::SendConnect { version, support } => {
                    self.send_frame(&ClientMessage::Connect {
                        version: version.to_string(),
                        support,
                    });
                }
                SessionAction::ResetCollections => {
                    self.store.reset_keeping_offline();
                }
                SessionAction::ReplaySubscriptions => self.replay_subscriptions(),
                SessionAction::SessionEstablished { session } => {
                    self.on_session_established(&session);
                }
                SessionAction::SendPong { id } => {
                    self.send_frame(&ClientMessage::Pong { id });
                }
                SessionAction::FailOutstandingMethods => self.fail_outstanding(),
                SessionAction::NotifyDisconnected => {
                    self.heartbeat_at = None;
                    let _ = self.events.send(ClientEvent::Disconnected);
                }
                SessionAction::ScheduleReconnect { delay } => {
                    self.reconnect_at = Some(Instant::now() + delay);
                }
            }
        }
    }

    fn open_transport(&mut self) {
        if let Some(mut old) = self.transport.take() {
            old.close();
            self.fail_outstanding();
        }
        self.generation += 1;
        self.reconnect_at = None;
        tracing::debug!(generation = self.generation, url = %self.config.url, "opening transport");
        let transport =
            self.connector
                .connect(&self.config.url, self.generation, self.transport_tx.clone());
        self.transport = Some(transport);
    }

    fn on_session_established(&mut self, session: &str) {
        tracing::info!(%session, "ddp session established");
        let _ = self.events.send(ClientEvent::Ready);
        self.heartbeat_at = Some(Instant::now() + self.config.heartbeat_interval());
        if let Some(token) = self.auth.token().map(str::to_string) {
            self.start_logon("login", auth::resume_params(&token), None);
        }
        self.replay_subscriptions();
    }

    fn replay_subscriptions(&mut self) {
        let frames = self.subscriptions.replay_frames();
        for frame in frames {
            self.send_frame(&frame);
        }
    }

    fn do_call(
        &mut self,
        id: String,
        method: String,
        params: Vec<Value>,
        callback: Option<MethodCallback>,
    ) {
        if !self.session.is_connected() {
            if let Some(callback) = callback {
                callback(Err(ClientError::NotConnected));
            }
            return;
        }
        self.methods.register(id.clone(), MethodKind::User, callback);
        self.send_frame(&ClientMessage::Method {
            id,
            method,
            params: Some(params),
        });
    }

    fn handle_result(&mut self, id: &str, result: Option<Value>, error: Option<Value>) {
        let Some(call) = self.methods.complete(id) else {
            tracing::warn!(%id, "result for unknown method");
            return;
        };
        if call.kind == MethodKind::Login || self.auth.owns_method(id) {
            match error {
                Some(error) => {
                    let reason = server_error(&error).to_string();
                    tracing::warn!(%reason, "logon refused by server");
                    if let Some(callback) = self.auth.complete_failure() {
                        callback(Err(ClientError::logon_rejected(reason)));
                    }
                }
                None => {
                    let value = result.unwrap_or(Value::Null);
                    if let Some((session, callback)) = self.auth.complete_success(&value) {
                        callback(Ok(session));
                    }
                }
            }
            self.emit_session_update();
            return;
        }
        if let Some(callback) = call.callback {
            match error {
                Some(error) => callback(Err(server_error(&error))),
                None => callback(Ok(result.unwrap_or(Value::Null))),
            }
        }
    }

    fn start_logon(&mut self, method: &str, params: Value, callback: Option<LogonCallback>) {
        if !self.session.is_connected() {
            if let Some(callback) = callback {
                callback(Err(ClientError::NotConnected));
            }
            return;
        }
        match self.auth.begin(callback) {
            Ok(()) => {
                let id = self.ids.next_wire();
                self.methods.register(id.clone(), MethodKind::Login, None);
                self.auth.attach_method(id.clone());
                self.send_frame(&ClientMessage::Method {
                    id,
                    method: method.to_string(),
                    params: Some(vec![params]),
                });
            }
            Err((err, callback)) => {
                if let Some(callback) = callback {
                    callback(Err(err));
                }
            }
        }
    }

    fn start_oauth(&mut self, service: String, token: String, callback: Option<LogonCallback>) {
        if !self.session.is_connected() {
            if let Some(callback) = callback {
                callback(Err(ClientError::NotConnected));
            }
            return;
        }
        match self.auth.begin(callback) {
            Ok(()) => {
                let credential_token = random_document_id();
                let url = self.config.url.clone();
                let commands = self.commands_tx.clone();
                let spawned = std::thread::Builder::new()
                    .name("ddp-oauth".to_string())
                    .spawn(move || {
                        let result = auth::fetch_oauth_credential(
                            &url,
                            &service,
                            &token,
                            &credential_token,
                        );
                        let _ = commands.send(Command::OauthFetched { result });
                    });
                if spawned.is_err()
                    && let Some(callback) = self.auth.complete_failure()
                {
                    callback(Err(ClientError::logon_rejected(
                        "oauth helper thread unavailable",
                    )));
                }
            }
            Err((err, callback)) => {
                if let Some(callback) = callback {
                    callback(Err(err));
                }
            }
        }
    }

    fn finish_oauth(&mut self, result: Result<OauthCredential, ClientError>) {
        if self.auth.state() != AuthState::LoggingIn {
            // The attempt was already failed (e.g. by a disconnect).
            return;
        }
        match result {
            Ok(credential) => {
                if !self.session.is_connected() {
                    if let Some(callback) = self.auth.complete_failure() {
                        callback(Err(ClientError::NotConnected));
                    }
                    return;
                }
                let id = self.ids.next_wire();
                self.methods.register(id.clone(), MethodKind::Login, None);
                self.auth.attach_method(id.clone());
                let params = auth::oauth_login_params("oauth", &credential);
                self.send_frame(&ClientMessage::Method {
                    id,
                    method: "login".to_string(),
                    params: Some(vec![params]),
                });
            }
            Err(err) => {
                if let Some(callback) = self.auth.complete_failure() {
                    callback(Err(err));
                }
            }
        }
    }

    fn fail_outstanding(&mut self) {
        for callback in self.methods.drain_for_disconnect() {
            callback(Err(ClientError::DisconnectedBeforeCallbackComplete));
        }
        if self.auth.state() == AuthState::LoggingIn
            && let Some(callback) = self.auth.complete_failure()
        {
            callback(Err(ClientError::DisconnectedBeforeCallbackComplete));
        }
    }

    fn emit_session_update(&mut self) {
        let _ = self.events.send(ClientEvent::SessionUpdate {
            user_id: self.auth.user_id().map(str::to_string),
            logged_in: self.auth.state() == AuthState::LoggedIn,
        });
    }

    fn send_frame(&mut self, frame: &ClientMessage) {
        let Some(transport) = self.transport.as_mut() else {
            tracing::debug!("dropping frame; no transport");
            return;
        };
        match frame.encode() {
            Ok(text) => {
                if transport.send_text(text).is_err() {
                    tracing::debug!("transport rejected frame; close in flight");
                }
            }
            Err(err) => tracing::warn!(%err, "frame encode failed"),
        }
    }

    fn restore_collection(&mut self, collection: &str) -> Result<usize, ClientError> {
        let docs = offline::read_cache(&self.cache_dir, collection).map_err(|err| {
            ClientError::Cache {
                message: err.to_string(),
            }
        })?;
        let Some(docs) = docs else {
            return Ok(0);
        };
        let mut restored = 0usize;
        for mut doc in docs {
            doc.flag_was_offline();
            let event = self.store.insert_restored(collection, doc);
            self.dispatcher.dispatch(&event);
            restored += 1;
        }
        tracing::info!(collection, restored, "restored collection from offline cache");
        Ok(restored)
    }

    fn clear_offline_collection(&mut self, collection: &str) -> Result<(), ClientError> {
        let events = self.store.clear_offline_entries(collection);
        for event in &events {
            self.dispatcher.dispatch(event);
        }
        offline::delete_cache(&self.cache_dir, collection).map_err(|err| ClientError::Cache {
            message: err.to_string(),
        })
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            let actions = self.session.on_reconnect_timer();
            self.execute(actions);
        }
        if self.heartbeat_at.is_some_and(|at| at <= now) {
            self.heartbeat_at = Some(now + self.config.heartbeat_interval());
            if self.session.is_connected() {
                let id = self.ids.next_wire();
                self.send_frame(&ClientMessage::Ping { id: Some(id) });
            }
        }
        if self.persist_at.is_some_and(|at| at <= now) {
            self.flush_persists(true);
        }
    }

    /// Snapshot dirty collections and write their cache files, on a short
    /// background thread in steady state and inline during teardown.
    fn flush_persists(&mut self, background: bool) {
        self.persist_at = None;
        if self.dirty_collections.is_empty() {
            return;
        }
        let now_ms = ejson::now_ms();
        let snapshots: Vec<(String, Vec<Document>)> =
            std::mem::take(&mut self.dirty_collections)
                .into_iter()
                .map(|collection| {
                    let docs = self.store.stamp_and_snapshot(&collection, now_ms);
                    (collection, docs)
                })
                .collect();
        let dir = self.cache_dir.clone();
        let write = move || {
            for (collection, docs) in &snapshots {
                if let Err(err) = offline::write_cache(&dir, collection, docs) {
                    tracing::warn!(collection, %err, "offline persist failed");
                }
            }
        };
        if background {
            let spawned = std::thread::Builder::new()
                .name("ddp-persist".to_string())
                .spawn(write);
            if let Err(err) = spawned {
                tracing::warn!(%err, "persist thread unavailable");
            }
        } else {
            write();
        }
    }

    fn teardown(&mut self) {
        self.flush_persists(false);
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
    }
}
