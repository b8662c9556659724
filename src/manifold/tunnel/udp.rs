use std::{net::Ipv4Addr, sync::Arc};

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::manifold::net;
use crate::manifold::tunnel::{
    frame::ServerFrame,
    session::{Session, UdpEntry},
};

const UDP_BUF: usize = 64 * 1024;

/// Opens a virtual UDP flow: binds a fresh IPv4 socket on an OS-chosen port
/// and pins the sticky target, resolved once at open time. Failures are
/// reported as `UDP_ERROR` and leave no table entry behind.
pub(crate) fn open(session: Arc<Session>, cid: String, target: String) {
    tokio::spawn(async move {
        let sticky = match net::resolve_host_port(&target).await {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(cid = %cid, target = %target, err = %err, "udp: resolve failed");
                session
                    .send(ServerFrame::UdpError {
                        cid,
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
        };

        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                tracing::warn!(cid = %cid, err = %err, "udp: bind failed");
                session
                    .send(ServerFrame::UdpError {
                        cid,
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
        };

        tracing::debug!(cid = %cid, target = %sticky, peer = %session.peer(), "udp: flow open");

        let token = session.next_token();
        let task = tokio::spawn(run_flow(session.clone(), cid.clone(), token, socket.clone()));
        session
            .insert_udp(&cid, UdpEntry {
                token,
                socket,
                target: sticky,
                task,
            })
            .await;
        session.send(ServerFrame::UdpConnected { cid }).await;
    });
}

/// Relays inbound datagrams to the client, each annotated with its actual
/// source, which may differ from the sticky target. Receive errors are
/// reported as `UDP_ERROR` and the flow stays open; only `UDP_CLOSE` or
/// tunnel teardown ends it.
async fn run_flow(session: Arc<Session>, cid: String, token: u64, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; UDP_BUF];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, source)) => {
                let frame = ServerFrame::UdpData {
                    cid: cid.clone(),
                    source,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                };
                if !session.send(frame).await {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(cid = %cid, err = %err, "udp: recv failed");
                let notified = session
                    .send(ServerFrame::UdpError {
                        cid: cid.clone(),
                        message: err.to_string(),
                    })
                    .await;
                if !notified {
                    break;
                }
            }
        }
    }

    session.remove_udp_if(&cid, token).await;
}
