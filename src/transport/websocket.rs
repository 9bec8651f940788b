//! Production transport over `tungstenite`.
//!
//! One IO thread per connection multiplexes blocking reads (bounded by a
//! short read timeout) with writes drained from a queue, so the worker loop
//! never touches the socket directly.

use std::net::TcpStream;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use super::{Connector, Transport, TransportError, TransportEvent, TransportEventKind};

const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        url: &str,
        generation: u64,
        events: Sender<TransportEvent>,
    ) -> Box<dyn Transport> {
        let (outgoing_tx, outgoing_rx) = crossbeam::channel::unbounded();
        let url = url.to_string();
        let spawn = std::thread::Builder::new()
            .name(format!("ddp-ws-{generation}"))
            .spawn({
                let events = events.clone();
                move || run_socket(&url, generation, &events, &outgoing_rx)
            });
        if let Err(err) = spawn {
            emit(&events, generation, TransportEventKind::Error(err.to_string()));
            emit(&events, generation, TransportEventKind::Closed);
        }
        Box::new(WebSocketTransport {
            outgoing: outgoing_tx,
        })
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct WebSocketTransport {
    outgoing: Sender<Outbound>,
}

impl Transport for WebSocketTransport {
    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        let _ = self.outgoing.send(Outbound::Close);
    }
}

fn emit(events: &Sender<TransportEvent>, generation: u64, kind: TransportEventKind) {
    let _ = events.send(TransportEvent { generation, kind });
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

fn run_socket(
    url: &str,
    generation: u64,
    events: &Sender<TransportEvent>,
    outgoing: &Receiver<Outbound>,
) {
    let mut socket = match tungstenite::connect(url) {
        Ok((socket, _response)) => socket,
        Err(err) => {
            emit(events, generation, TransportEventKind::Error(err.to_string()));
            emit(events, generation, TransportEventKind::Closed);
            return;
        }
    };
    if let Err(err) = set_read_timeout(&mut socket) {
        tracing::warn!(generation, %err, "read timeout unavailable on socket");
    }
    emit(events, generation, TransportEventKind::Opened);

    loop {
        if !drain_writes(&mut socket, outgoing, events, generation) {
            return;
        }
        match socket.read() {
            Ok(Message::Text(text)) => {
                emit(events, generation, TransportEventKind::Message(text.to_string()));
            }
            Ok(Message::Ping(payload)) => {
                // Socket-level keepalive; answered here, below the protocol.
                let _ = socket.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => {
                emit(events, generation, TransportEventKind::Closed);
                return;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                emit(events, generation, TransportEventKind::Closed);
                return;
            }
            Err(err) => {
                emit(events, generation, TransportEventKind::Error(err.to_string()));
                emit(events, generation, TransportEventKind::Closed);
                return;
            }
        }
    }
}

/// Returns false when the session is over and the thread should exit.
fn drain_writes(
    socket: &mut Socket,
    outgoing: &Receiver<Outbound>,
    events: &Sender<TransportEvent>,
    generation: u64,
) -> bool {
    loop {
        match outgoing.try_recv() {
            Ok(Outbound::Text(text)) => {
                if let Err(err) = socket.send(Message::Text(text.into())) {
                    emit(events, generation, TransportEventKind::Error(err.to_string()));
                    emit(events, generation, TransportEventKind::Closed);
                    return false;
                }
            }
            Ok(Outbound::Close) | Err(TryRecvError::Disconnected) => {
                // Start the close handshake; keep reading until the peer
                // acknowledges or the socket errors out.
                let _ = socket.close(None);
                return true;
            }
            Err(TryRecvError::Empty) => return true,
        }
    }
}

fn set_read_timeout(socket: &mut Socket) -> std::io::Result<()> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(READ_TIMEOUT)),
        MaybeTlsStream::NativeTls(stream) => {
            stream.get_ref().set_read_timeout(Some(READ_TIMEOUT))
        }
        _ => Ok(()),
    }
}
