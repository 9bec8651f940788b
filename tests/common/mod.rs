//! Scripted transport and helpers shared by the integration suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use serde_json::{Value, json};

use ddp_client::transport::{
    Connector, Transport, TransportError, TransportEvent, TransportEventKind,
};
use ddp_client::{BackoffPolicy, Client, ClientConfig, ClientEvent};

pub const WAIT: Duration = Duration::from_secs(5);

/// Connector that records every connection attempt and lets the test play
/// the server's side of the wire.
#[derive(Clone, Default)]
pub struct FakeConnector {
    handles: Arc<Mutex<Vec<FakeHandle>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the Nth connection attempt (1-based).
    pub fn handle(&self, attempt: usize) -> FakeHandle {
        let deadline = Instant::now() + WAIT;
        loop {
            {
                let handles = self.handles.lock().unwrap();
                if handles.len() >= attempt {
                    return handles[attempt - 1].clone();
                }
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for connection attempt #{attempt}"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn attempts(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        _url: &str,
        generation: u64,
        events: Sender<TransportEvent>,
    ) -> Box<dyn Transport> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.handles.lock().unwrap().push(FakeHandle {
            generation,
            sent: Arc::clone(&sent),
            events: events.clone(),
            closed: Arc::clone(&closed),
        });
        Box::new(FakeTransport {
            generation,
            sent,
            events,
            closed,
        })
    }
}

#[derive(Clone)]
pub struct FakeHandle {
    pub generation: u64,
    sent: Arc<Mutex<Vec<String>>>,
    events: Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl FakeHandle {
    /// Report the socket as open.
    pub fn open(&self) {
        self.emit(TransportEventKind::Opened);
    }

    /// Deliver one server frame.
    pub fn server_send(&self, frame: Value) {
        self.emit(TransportEventKind::Message(frame.to_string()));
    }

    /// Server-side connection drop.
    pub fn server_close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(TransportEventKind::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|text| serde_json::from_str(text).expect("client frames are json"))
            .collect()
    }

    /// Wait until the client has sent a frame matching the predicate.
    pub fn wait_for_frame(&self, what: &str, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(frame) = self.sent_frames().into_iter().find(|f| pred(f)) {
                return frame;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn wait_for_msg(&self, msg: &str) -> Value {
        self.wait_for_frame(msg, |frame| frame["msg"] == msg)
    }

    /// Frame barrier: a server ping whose pong proves every earlier frame
    /// on this connection has been processed.
    pub fn sync(&self, tag: &str) {
        self.server_send(json!({"msg": "ping", "id": tag}));
        self.wait_for_frame("sync pong", |frame| {
            frame["msg"] == "pong" && frame["id"] == tag
        });
    }

    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            generation: self.generation,
            kind,
        });
    }
}

struct FakeTransport {
    generation: u64,
    sent: Arc<Mutex<Vec<String>>>,
    events: Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl Transport for FakeTransport {
    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent {
                generation: self.generation,
                kind: TransportEventKind::Closed,
            });
        }
    }
}

/// Config tuned for the fake wire: zero backoff, immediate persist flush,
/// heartbeat parked out of the way.
pub fn test_config(cache_dir: &std::path::Path) -> ClientConfig {
    ClientConfig {
        url: "ws://app.test/websocket".to_string(),
        backoff: BackoffPolicy {
            base_secs: 0,
            max_tries: 6,
        },
        heartbeat_interval_secs: 3600,
        persist_debounce_secs: 0,
        cache_dir: Some(cache_dir.to_path_buf()),
        ..ClientConfig::default()
    }
}

pub fn start_client(
    cache_dir: &std::path::Path,
) -> (Client, Receiver<ClientEvent>, FakeConnector) {
    let connector = FakeConnector::new();
    let (client, events) = Client::start_with_connector(
        test_config(cache_dir),
        Box::new(connector.clone()),
    );
    (client, events, connector)
}

/// Drive attempt `attempt` through open + version negotiation to an
/// established DDP session.
pub fn establish(client: &Client, connector: &FakeConnector, attempt: usize) -> FakeHandle {
    if attempt == 1 {
        client.connect().expect("connect");
    }
    let handle = connector.handle(attempt);
    handle.open();
    handle.wait_for_msg("connect");
    handle.server_send(json!({"msg": "connected", "session": format!("s{attempt}")}));
    handle
}

pub fn wait_for_event(
    events: &Receiver<ClientEvent>,
    what: &str,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

/// Poll an arbitrary condition with the shared deadline.
pub fn wait_until(what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
