use std::{net::SocketAddr, pin::Pin, sync::Arc, task::Poll};

use anyhow::Context;
use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
};
use tokio_tungstenite::tungstenite::{
    handshake::server::{Request, Response},
    http::HeaderValue,
};
use tokio_rustls::TlsAcceptor;

use crate::manifold::{
    gate::{Denial, Gate},
    http,
    tunnel::session,
};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so
/// we wrap `AsyncRead + AsyncWrite` into a single trait to erase the
/// plain-TCP vs TLS split.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub struct Listener {
    ln: TcpListener,
    gate: Arc<Gate>,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub async fn bind(port: u16, gate: Arc<Gate>, tls: Option<TlsAcceptor>) -> anyhow::Result<Self> {
        let ln = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind tcp 0.0.0.0:{port}"))?;
        Ok(Self { ln, gate, tls })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    pub async fn serve(
        self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            addr = ?self.local_addr(),
            tls = self.tls.is_some(),
            "ws: listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = self.ln.accept() => {
                    let (conn, peer) = res?;
                    let gate = self.gate.clone();
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(conn, peer, gate, tls).await {
                            tracing::debug!(peer = %peer, err = %err, "ws: connection ended");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

async fn handle_conn(
    conn: TcpStream,
    peer: SocketAddr,
    gate: Arc<Gate>,
    tls: Option<TlsAcceptor>,
) -> anyhow::Result<()> {
    let stream: BoxedStream = match &tls {
        Some(acceptor) => Box::new(acceptor.accept(conn).await.context("tls accept")?),
        None => Box::new(conn),
    };
    serve_stream(stream, peer, gate).await
}

/// Reads the request head off the raw stream, then splits three ways: facade
/// response for plain HTTP, silent drop for upgrades at an unknown path, and
/// admission + websocket handshake + tunnel session for the real thing.
async fn serve_stream(
    mut stream: BoxedStream,
    peer: SocketAddr,
    gate: Arc<Gate>,
) -> anyhow::Result<()> {
    let Some(head_bytes) = http::read_head(&mut stream).await? else {
        return Ok(());
    };
    let Some(head) = http::RequestHead::parse(&head_bytes) else {
        return Ok(());
    };

    if !head.is_upgrade() {
        stream
            .write_all(http::facade_response(&head.path).as_bytes())
            .await?;
        let _ = stream.shutdown().await;
        return Ok(());
    }

    let subprotocol = head.header("sec-websocket-protocol");
    if let Err(denial) = gate.evaluate(peer.ip(), &head.path, subprotocol) {
        match denial {
            // The websocket path is effectively secret: upgrades anywhere
            // else are dropped without a response.
            Denial::Path => {
                tracing::debug!(peer = %peer, path = %head.path, "gate: upgrade at unknown path dropped");
            }
            Denial::Ip => {
                tracing::warn!(peer = %peer, "gate: peer address denied");
                let _ = stream.write_all(http::deny_forbidden().as_bytes()).await;
            }
            Denial::Token => {
                tracing::warn!(peer = %peer, "gate: token denied");
                let _ = stream.write_all(http::deny_unauthorized().as_bytes()).await;
            }
        }
        let _ = stream.shutdown().await;
        return Ok(());
    }

    // Replay the sniffed head into the handshake; echo the accepted
    // subprotocol so browser clients keep the connection.
    let protocol = gate.token().map(|t| t.to_string());
    let ws = tokio_tungstenite::accept_hdr_async(
        Rewind::new(head_bytes, stream),
        move |_req: &Request, mut resp: Response| {
            if let Some(token) = protocol {
                if let Ok(value) = HeaderValue::from_str(&token) {
                    resp.headers_mut().insert("Sec-WebSocket-Protocol", value);
                }
            }
            Ok(resp)
        },
    )
    .await
    .context("websocket handshake")?;

    tracing::info!(peer = %peer, "tunnel: client connected");
    session::run(ws, peer).await;
    tracing::info!(peer = %peer, "tunnel: client disconnected");
    Ok(())
}

pin_project_lite::pin_project! {
    /// Serves a prefix of already-read bytes before delegating to the inner
    /// stream; writes pass straight through.
    struct Rewind<S> {
        #[pin]
        inner: S,
        prefix: Bytes,
    }
}

impl<S> Rewind<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            inner,
            prefix: Bytes::from(prefix),
        }
    }
}

impl<S: AsyncRead> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
