use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, RwLock},
};
use tokio_tungstenite::{
    tungstenite::{error::ProtocolError, Error as WsError, Message},
    WebSocketStream,
};

use crate::manifold::net;
use crate::manifold::tunnel::{
    frame::{ClientFrame, FrameError, ServerFrame},
    tcp, udp,
};

/// Outbound frame queue depth. Senders await a slot, so a slow websocket
/// peer backpressures the sessions feeding it instead of growing a buffer.
const SEND_QUEUE: usize = 256;

pub(crate) struct TcpEntry {
    pub token: u64,
    pub data_tx: mpsc::Sender<Bytes>,
    pub task: tokio::task::JoinHandle<()>,
}

pub(crate) struct UdpEntry {
    pub token: u64,
    pub socket: Arc<tokio::net::UdpSocket>,
    pub target: SocketAddr,
    pub task: tokio::task::JoinHandle<()>,
}

/// Per-websocket owner of every virtual connection opened over it.
///
/// Both tables are keyed by the client-assigned connection id and private to
/// this websocket. The session consumes inbound frames, routes them to the
/// owning entry, and tears everything down when the websocket goes away.
pub struct Session {
    peer: SocketAddr,
    out: mpsc::Sender<Message>,
    closed: AtomicBool,
    seq: AtomicU64,
    tcp: RwLock<HashMap<String, TcpEntry>>,
    udp: RwLock<HashMap<String, UdpEntry>>,
}

/// Drives one accepted websocket until it disconnects, then destroys every
/// virtual connection it owns.
pub async fn run<S>(ws: WebSocketStream<S>, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SEND_QUEUE);

    let session = Arc::new(Session {
        peer,
        out: out_tx,
        closed: AtomicBool::new(false),
        seq: AtomicU64::new(1),
        tcp: RwLock::new(HashMap::new()),
        udp: RwLock::new(HashMap::new()),
    });

    // Single writer owns the sink half; everything else goes through the queue.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(next) = stream.next().await {
        match next {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                match ClientFrame::parse(msg) {
                    Ok(frame) => session.dispatch(frame).await,
                    Err(err) => drop_frame(peer, err),
                }
            }
            Ok(Message::Ping(payload)) => {
                if !session.enqueue(Message::Pong(payload)).await {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                if !is_normal_ws_close(&err) {
                    tracing::warn!(peer = %peer, err = %err, "tunnel: websocket failed");
                }
                break;
            }
        }
    }

    session.teardown().await;
    writer.abort();
    let _ = writer.await;
}

impl Session {
    async fn dispatch(self: &Arc<Self>, frame: ClientFrame) {
        match frame {
            ClientFrame::TcpOpen {
                cid,
                target,
                initial,
            } => tcp::open(self.clone(), cid, target, initial),
            ClientFrame::Data { cid, payload } => {
                let tx = self.tcp.read().await.get(&cid).map(|e| e.data_tx.clone());
                match tx {
                    // A closed receiver means the stream is already gone;
                    // the write is dropped like any other orphan frame.
                    Some(tx) => {
                        let _ = tx.send(payload).await;
                    }
                    None => tracing::debug!(cid = %cid, "tcp: write for unknown stream dropped"),
                }
            }
            ClientFrame::Close { cid } => {
                let entry = self.tcp.write().await.remove(&cid);
                match entry {
                    Some(entry) => {
                        entry.task.abort();
                        tracing::debug!(cid = %cid, "tcp: closed by client");
                    }
                    None => tracing::debug!(cid = %cid, "tcp: close for unknown stream dropped"),
                }
            }
            ClientFrame::UdpOpen { cid, target } => udp::open(self.clone(), cid, target),
            ClientFrame::UdpData { cid, payload } => {
                let hit = self
                    .udp
                    .read()
                    .await
                    .get(&cid)
                    .map(|e| (e.socket.clone(), e.target));
                match hit {
                    Some((socket, target)) => {
                        if let Err(err) = socket.send_to(&payload, target).await {
                            tracing::debug!(cid = %cid, err = %err, "udp: send failed");
                            self.send(ServerFrame::UdpError {
                                cid,
                                message: err.to_string(),
                            })
                            .await;
                        }
                    }
                    None => tracing::debug!(cid = %cid, "udp: datagram for unknown flow dropped"),
                }
            }
            ClientFrame::UdpClose { cid } => {
                let entry = self.udp.write().await.remove(&cid);
                match entry {
                    Some(entry) => {
                        entry.task.abort();
                        tracing::debug!(cid = %cid, "udp: closed by client");
                    }
                    None => tracing::debug!(cid = %cid, "udp: close for unknown flow dropped"),
                }
            }
            ClientFrame::Claim { fields } => {
                self.send(ServerFrame::ClaimAck { fields }).await;
            }
        }
    }

    /// Queues a frame for the client. Returns false once the websocket is
    /// gone, which callers treat as their signal to wind down.
    pub(crate) async fn send(&self, frame: ServerFrame) -> bool {
        self.enqueue(frame.encode()).await
    }

    async fn enqueue(&self, msg: Message) -> bool {
        self.out.send(msg).await.is_ok()
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs a TCP entry, silently replacing a reused connection id.
    /// After teardown has begun the entry is refused and its task aborted.
    pub(crate) async fn insert_tcp(&self, cid: &str, entry: TcpEntry) {
        let mut table = self.tcp.write().await;
        if self.closed.load(Ordering::Acquire) {
            entry.task.abort();
            return;
        }
        if let Some(old) = table.insert(cid.to_string(), entry) {
            old.task.abort();
            tracing::debug!(cid = %cid, "tcp: replaced reused connection id");
        }
    }

    pub(crate) async fn insert_udp(&self, cid: &str, entry: UdpEntry) {
        let mut table = self.udp.write().await;
        if self.closed.load(Ordering::Acquire) {
            entry.task.abort();
            return;
        }
        if let Some(old) = table.insert(cid.to_string(), entry) {
            old.task.abort();
            tracing::debug!(cid = %cid, "udp: replaced reused connection id");
        }
    }

    /// Token-guarded removal, so a finished session never evicts a
    /// successor that took over its connection id.
    pub(crate) async fn remove_tcp_if(&self, cid: &str, token: u64) {
        let mut table = self.tcp.write().await;
        if table.get(cid).is_some_and(|e| e.token == token) {
            table.remove(cid);
        }
    }

    pub(crate) async fn remove_udp_if(&self, cid: &str, token: u64) {
        let mut table = self.udp.write().await;
        if table.get(cid).is_some_and(|e| e.token == token) {
            table.remove(cid);
        }
    }

    /// Destroys every owned session. Idempotent; emits nothing.
    async fn teardown(&self) {
        self.closed.store(true, Ordering::Release);

        let tcp: Vec<_> = {
            let mut table = self.tcp.write().await;
            table.drain().collect()
        };
        let udp: Vec<_> = {
            let mut table = self.udp.write().await;
            table.drain().collect()
        };

        if !tcp.is_empty() || !udp.is_empty() {
            tracing::debug!(
                peer = %self.peer,
                tcp = tcp.len(),
                udp = udp.len(),
                "tunnel: dropping live sessions on disconnect"
            );
        }
        for (_, entry) in tcp {
            entry.task.abort();
        }
        for (_, entry) in udp {
            entry.task.abort();
        }
    }
}

fn drop_frame(peer: SocketAddr, err: FrameError) {
    tracing::debug!(peer = %peer, err = %err, "tunnel: dropped malformed frame");
}

fn is_normal_ws_close(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(io) => net::is_normal_close(io),
        _ => false,
    }
}
