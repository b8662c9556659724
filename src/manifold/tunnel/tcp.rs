use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};

use crate::manifold::net;
use crate::manifold::tunnel::{
    frame::ServerFrame,
    session::{Session, TcpEntry},
};

const BUF_SIZE: usize = 32 * 1024;

/// Client-to-stream write queue depth, in read-sized chunks.
const DATA_QUEUE: usize = 32;

/// Opens a virtual TCP stream: dials the target on its own task so a slow
/// resolver or handshake never stalls dispatch for other connection ids.
///
/// On success the entry is installed, any initial bytes are written, and
/// `CONNECTED` is emitted before the first inbound read can produce `DATA`.
/// A failed dial reports `CLOSE` and leaves no trace in the table.
pub(crate) fn open(session: Arc<Session>, cid: String, target: String, initial: Option<Bytes>) {
    tokio::spawn(async move {
        let mut stream = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(cid = %cid, target = %target, err = %err, "tcp: dial failed");
                session.send(ServerFrame::Close { cid }).await;
                return;
            }
        };

        if let Some(prelude) = initial {
            if let Err(err) = stream.write_all(&prelude).await {
                if !net::is_normal_close(&err) {
                    tracing::warn!(cid = %cid, err = %err, "tcp: prelude write failed");
                }
                session.send(ServerFrame::Close { cid }).await;
                return;
            }
        }

        tracing::debug!(cid = %cid, target = %target, peer = %session.peer(), "tcp: established");

        if !session.send(ServerFrame::Connected { cid: cid.clone() }).await {
            return;
        }

        let token = session.next_token();
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(DATA_QUEUE);
        let task = tokio::spawn(run_stream(
            session.clone(),
            cid.clone(),
            token,
            stream,
            data_rx,
        ));
        session
            .insert_tcp(&cid, TcpEntry {
                token,
                data_tx,
                task,
            })
            .await;
    });
}

/// Pumps one established stream in both directions until either side ends.
///
/// The inbound pump frames remote bytes as `DATA`; queueing awaits websocket
/// capacity, so a slow client pauses remote reads instead of buffering. The
/// outbound pump drains client writes in arrival order. `CLOSE` is emitted
/// only for remote-side terminations; a client close or tunnel teardown
/// drops the stream silently.
async fn run_stream(
    session: Arc<Session>,
    cid: String,
    token: u64,
    stream: TcpStream,
    mut data_rx: mpsc::Receiver<Bytes>,
) {
    let (mut rd, mut wr) = stream.into_split();

    let inbound_session = session.clone();
    let inbound_cid = cid.clone();
    let inbound = async move {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    let frame = ServerFrame::Data {
                        cid: inbound_cid.clone(),
                        payload: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if !inbound_session.send(frame).await {
                        return Ok(());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    };

    let outbound = async move {
        while let Some(chunk) = data_rx.recv().await {
            wr.write_all(&chunk).await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let emit_close = tokio::select! {
        res = inbound => {
            match res {
                Ok(()) => tracing::debug!(cid = %cid, "tcp: remote end"),
                Err(err) if net::is_normal_close(&err) => {
                    tracing::debug!(cid = %cid, err = %err, "tcp: remote reset")
                }
                Err(err) => tracing::warn!(cid = %cid, err = %err, "tcp: read failed"),
            }
            true
        }
        res = outbound => {
            match res {
                // Channel closed: the client closed this id or the tunnel is
                // going away. Either way nothing more may be emitted for it.
                Ok(()) => false,
                Err(err) => {
                    if net::is_normal_close(&err) {
                        tracing::debug!(cid = %cid, err = %err, "tcp: remote reset");
                    } else {
                        tracing::warn!(cid = %cid, err = %err, "tcp: write failed");
                    }
                    true
                }
            }
        }
    };

    session.remove_tcp_if(&cid, token).await;
    if emit_close {
        session.send(ServerFrame::Close { cid }).await;
    }
}
