//! In-process websocket server for channel tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    peers: mpsc::UnboundedReceiver<Peer>,
    task: tokio::task::JoinHandle<()>,
}

enum PeerCmd {
    Send(Message),
    Abort,
}

/// Server side of one accepted client socket.
pub struct Peer {
    pub path: String,
    commands: mpsc::UnboundedSender<PeerCmd>,
    inbound: mpsc::UnboundedReceiver<Message>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (peer_tx, peers) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let peer_tx = peer_tx.clone();
                tokio::spawn(async move {
                    let mut path = String::new();
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        path = req.uri().path().to_string();
                        Ok(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                        return;
                    };
                    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
                    let (in_tx, in_rx) = mpsc::unbounded_channel();
                    let _ = peer_tx.send(Peer {
                        path,
                        commands: cmd_tx,
                        inbound: in_rx,
                    });
                    let (mut sink, mut reader) = ws.split();
                    loop {
                        tokio::select! {
                            msg = reader.next() => match msg {
                                Some(Ok(m)) => {
                                    let _ = in_tx.send(m);
                                }
                                _ => return,
                            },
                            cmd = cmd_rx.recv() => match cmd {
                                Some(PeerCmd::Send(m)) => {
                                    if sink.send(m).await.is_err() {
                                        return;
                                    }
                                }
                                Some(PeerCmd::Abort) | None => return,
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            peers,
            task,
        }
    }

    /// `http://127.0.0.1:{port}`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub async fn next_peer(&mut self) -> Peer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("no client connected in time")
            .expect("server stopped")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Peer {
    pub fn send_text(&self, text: &str) {
        let _ = self
            .commands
            .send(PeerCmd::Send(Message::Text(text.to_string())));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub fn close_normal(&self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        };
        let _ = self.commands.send(PeerCmd::Send(Message::Close(Some(frame))));
    }

    /// Drop the socket without a close handshake.
    pub fn abort(&self) {
        let _ = self.commands.send(PeerCmd::Abort);
    }

    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match tokio::time::timeout(WAIT, self.inbound.recv()).await.ok()?? {
                Message::Text(t) => return Some(t),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    /// Wait for the client's close frame and return its code.
    pub async fn closed(&mut self) -> Option<u16> {
        loop {
            if let Message::Close(frame) = tokio::time::timeout(WAIT, self.inbound.recv()).await.ok()?? {
                return frame.map(|f| u16::from(f.code));
            }
        }
    }
}

/// A `ws://` URL whose port refuses connections.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/x")
}

/// A `ws://` URL on a listener that never accepts, so the handshake hangs.
/// Keep the listener alive for as long as the URL is in use.
pub async fn silent_url() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{addr}/x"))
}
