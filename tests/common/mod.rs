#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Not every test binary uses every helper, and setup code does not need error plumbing"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Frame pushed from the mock server to every connected client.
#[derive(Clone, Debug)]
pub enum ServerFrame {
    Text(String),
    Close(u16),
}

/// Mock WebSocket server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    frames_tx: broadcast::Sender<ServerFrame>,
    /// Text frames sent by clients
    inbound_rx: mpsc::UnboundedReceiver<String>,
    /// Close codes sent by clients
    closes_rx: mpsc::UnboundedReceiver<(u16, String)>,
    /// Request URI (path and query) of every handshake
    requests_rx: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
    /// When each handshake request arrived
    handshakes: Arc<Mutex<Vec<Instant>>>,
    /// When each client close frame arrived
    closes: Arc<Mutex<Vec<Instant>>>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (frames_tx, _) = broadcast::channel::<ServerFrame>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closes_tx, closes_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(Vec::new()));

        let broadcast_tx = frames_tx.clone();
        let accepted = Arc::clone(&connections);
        let handshake_log = Arc::clone(&handshakes);
        let close_log = Arc::clone(&closes);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                // Subscribe before the handshake so nothing sent after `Open` is missed
                let mut frames_rx = broadcast_tx.subscribe();
                let requests_tx = requests_tx.clone();
                let handshake_log = Arc::clone(&handshake_log);
                let record = move |request: &Request,
                                   response: Response|
                      -> Result<Response, ErrorResponse> {
                    handshake_log
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(Instant::now());
                    drop(requests_tx.send(request.uri().to_string()));
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, record).await
                else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let inbound_tx = inbound_tx.clone();
                let closes_tx = closes_tx.clone();
                let close_log = Arc::clone(&close_log);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(inbound_tx.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        close_log
                                            .lock()
                                            .unwrap_or_else(PoisonError::into_inner)
                                            .push(Instant::now());
                                        let close = frame.map_or((0, String::new()), |f| {
                                            (u16::from(f.code), f.reason.to_string())
                                        });
                                        drop(closes_tx.send(close));
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            frame = frames_rx.recv() => {
                                let message = match frame {
                                    Ok(ServerFrame::Text(text)) => Message::Text(text.into()),
                                    Ok(ServerFrame::Close(code)) => Message::Close(Some(CloseFrame {
                                        code: code.into(),
                                        reason: "server closing".into(),
                                    })),
                                    Err(_) => break,
                                };
                                let closing = matches!(message, Message::Close(_));
                                if write.send(message).await.is_err() || closing {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            frames_tx,
            inbound_rx,
            closes_rx,
            requests_rx,
            connections,
            handshakes,
            closes,
        }
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a text frame to all connected clients.
    pub fn send(&self, text: &str) {
        drop(self.frames_tx.send(ServerFrame::Text(text.to_owned())));
    }

    /// Close every connected client with `code`.
    pub fn close_all(&self, code: u16) {
        drop(self.frames_tx.send(ServerFrame::Close(code)));
    }

    /// Completed handshakes so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Arrival time of every handshake request.
    pub fn handshake_times(&self) -> Vec<Instant> {
        self.handshakes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Arrival time of every client close frame.
    pub fn close_times(&self) -> Vec<Instant> {
        self.closes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receive the next text frame sent by a client.
    pub async fn recv(&mut self) -> Option<String> {
        timeout(RECV_TIMEOUT, self.inbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next close frame sent by a client.
    pub async fn recv_close(&mut self) -> Option<(u16, String)> {
        timeout(RECV_TIMEOUT, self.closes_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the request URI of the next handshake.
    pub async fn next_request(&mut self) -> Option<String> {
        timeout(RECV_TIMEOUT, self.requests_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

/// TCP server that accepts connections and drops them before the WebSocket handshake, so every
/// connection attempt fails.
pub struct RefusingServer {
    addr: SocketAddr,
    accepts: Arc<Mutex<Vec<Instant>>>,
}

impl RefusingServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Instant::now());
                drop(stream);
            }
        });

        Self { addr, accepts }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/realtime", self.addr)
    }

    /// Connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.accepts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Gaps between consecutive connection attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        let accepts = self.accepts.lock().unwrap_or_else(PoisonError::into_inner);
        accepts.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// WebSocket server that completes handshakes and then never reads or writes again.
pub struct SilentWsServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl SilentWsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    held.push(ws_stream);
                }
            }
        });

        Self { addr, connections }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/realtime", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}
