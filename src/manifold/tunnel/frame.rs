use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Cap on the ASCII header of a binary frame; payloads start past it.
const MAX_HEADER_BYTES: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown tag")]
    UnknownTag,
    #[error("missing tag terminator")]
    MissingTag,
    #[error("wrong field count")]
    FieldCount,
    #[error("empty connection id")]
    EmptyCid,
    #[error("malformed header")]
    BadHeader,
    #[error("unsupported message kind")]
    MessageKind,
}

/// One client-to-server command.
///
/// Control frames arrive as websocket text messages; bulk data arrives as
/// binary messages whose ASCII header is terminated by the pipe after the
/// connection id, with the payload bytes following opaquely. The header is
/// located by byte scanning so payloads are never run through UTF-8
/// validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    TcpOpen {
        cid: String,
        target: String,
        initial: Option<Bytes>,
    },
    Data {
        cid: String,
        payload: Bytes,
    },
    Close {
        cid: String,
    },
    UdpOpen {
        cid: String,
        target: String,
    },
    UdpData {
        cid: String,
        payload: Bytes,
    },
    UdpClose {
        cid: String,
    },
    Claim {
        fields: String,
    },
}

impl ClientFrame {
    pub fn parse(msg: Message) -> Result<Self, FrameError> {
        match msg {
            Message::Text(text) => Self::parse_text(text.as_str()),
            Message::Binary(data) => Self::parse_binary(data),
            _ => Err(FrameError::MessageKind),
        }
    }

    fn parse_text(s: &str) -> Result<Self, FrameError> {
        let (tag, rest) = s.split_once(':').ok_or(FrameError::MissingTag)?;
        match tag {
            "TCP" => {
                let mut fields = rest.splitn(3, '|');
                let cid = fields.next().ok_or(FrameError::FieldCount)?;
                let target = fields.next().ok_or(FrameError::FieldCount)?;
                let initial = fields
                    .next()
                    .map(|t| Bytes::copy_from_slice(t.as_bytes()));
                Ok(Self::TcpOpen {
                    cid: checked_cid(cid)?,
                    target: target.to_string(),
                    initial,
                })
            }
            "DATA" => {
                let (cid, payload) = rest.split_once('|').ok_or(FrameError::FieldCount)?;
                Ok(Self::Data {
                    cid: checked_cid(cid)?,
                    payload: Bytes::copy_from_slice(payload.as_bytes()),
                })
            }
            "CLOSE" => Ok(Self::Close {
                cid: checked_cid(rest)?,
            }),
            "UDP_CONNECT" => {
                let (cid, target) = rest.split_once('|').ok_or(FrameError::FieldCount)?;
                Ok(Self::UdpOpen {
                    cid: checked_cid(cid)?,
                    target: target.to_string(),
                })
            }
            "UDP_CLOSE" => Ok(Self::UdpClose {
                cid: checked_cid(rest)?,
            }),
            "CLAIM" => {
                if !rest.contains('|') {
                    return Err(FrameError::FieldCount);
                }
                Ok(Self::Claim {
                    fields: rest.to_string(),
                })
            }
            _ => Err(FrameError::UnknownTag),
        }
    }

    fn parse_binary(data: Bytes) -> Result<Self, FrameError> {
        let scan = &data[..data.len().min(MAX_HEADER_BYTES)];
        let colon = scan
            .iter()
            .position(|&b| b == b':')
            .ok_or(FrameError::MissingTag)?;
        let tag = &scan[..colon];

        if tag != b"DATA" && tag != b"UDP_DATA" {
            return Err(FrameError::UnknownTag);
        }

        // The header ends at the pipe terminating the connection id;
        // everything after it is payload.
        let pipe = scan[colon + 1..]
            .iter()
            .position(|&b| b == b'|')
            .map(|p| colon + 1 + p)
            .ok_or(FrameError::FieldCount)?;

        let header = &data[colon + 1..pipe];
        if !header.is_ascii() {
            return Err(FrameError::BadHeader);
        }
        let cid = std::str::from_utf8(header).map_err(|_| FrameError::BadHeader)?;
        let cid = checked_cid(cid)?;
        let payload = data.slice(pipe + 1..);

        if tag == b"DATA" {
            Ok(Self::Data { cid, payload })
        } else {
            Ok(Self::UdpData { cid, payload })
        }
    }
}

/// One server-to-client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Connected {
        cid: String,
    },
    Data {
        cid: String,
        payload: Bytes,
    },
    Close {
        cid: String,
    },
    UdpConnected {
        cid: String,
    },
    UdpData {
        cid: String,
        source: SocketAddr,
        payload: Bytes,
    },
    UdpError {
        cid: String,
        message: String,
    },
    ClaimAck {
        fields: String,
    },
}

impl ServerFrame {
    pub fn encode(self) -> Message {
        match self {
            Self::Connected { cid } => Message::Text(format!("CONNECTED:{cid}").into()),
            Self::Close { cid } => Message::Text(format!("CLOSE:{cid}").into()),
            Self::UdpConnected { cid } => Message::Text(format!("UDP_CONNECTED:{cid}").into()),
            Self::UdpError { cid, message } => {
                Message::Text(format!("UDP_ERROR:{cid}|{message}").into())
            }
            Self::ClaimAck { fields } => Message::Text(format!("CLAIM_ACK:{fields}").into()),
            Self::Data { cid, payload } => {
                let mut buf = BytesMut::with_capacity(6 + cid.len() + payload.len());
                buf.put_slice(b"DATA:");
                buf.put_slice(cid.as_bytes());
                buf.put_u8(b'|');
                buf.put_slice(&payload);
                Message::Binary(buf.freeze())
            }
            Self::UdpData {
                cid,
                source,
                payload,
            } => {
                let source = source.to_string();
                let mut buf =
                    BytesMut::with_capacity(11 + cid.len() + source.len() + payload.len());
                buf.put_slice(b"UDP_DATA:");
                buf.put_slice(cid.as_bytes());
                buf.put_u8(b'|');
                buf.put_slice(source.as_bytes());
                buf.put_u8(b'|');
                buf.put_slice(&payload);
                Message::Binary(buf.freeze())
            }
        }
    }
}

fn checked_cid(cid: &str) -> Result<String, FrameError> {
    if cid.is_empty() {
        return Err(FrameError::EmptyCid);
    }
    Ok(cid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Message {
        Message::Text(s.to_string().into())
    }

    fn binary(b: &[u8]) -> Message {
        Message::Binary(Bytes::copy_from_slice(b))
    }

    #[test]
    fn tcp_open_with_and_without_initial_bytes() {
        assert_eq!(
            ClientFrame::parse(text("TCP:c1|example.com:80")).unwrap(),
            ClientFrame::TcpOpen {
                cid: "c1".into(),
                target: "example.com:80".into(),
                initial: None,
            }
        );
        assert_eq!(
            ClientFrame::parse(text("TCP:c1|example.com:80|GET / HTTP/1.0\r\n\r\n")).unwrap(),
            ClientFrame::TcpOpen {
                cid: "c1".into(),
                target: "example.com:80".into(),
                initial: Some(Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")),
            }
        );
    }

    #[test]
    fn pipes_in_the_last_field_are_preserved() {
        assert_eq!(
            ClientFrame::parse(text("TCP:c1|h:1|a|b|c")).unwrap(),
            ClientFrame::TcpOpen {
                cid: "c1".into(),
                target: "h:1".into(),
                initial: Some(Bytes::from_static(b"a|b|c")),
            }
        );
        assert_eq!(
            ClientFrame::parse(text("DATA:c1|x|y")).unwrap(),
            ClientFrame::Data {
                cid: "c1".into(),
                payload: Bytes::from_static(b"x|y"),
            }
        );
        assert_eq!(
            ClientFrame::parse(text("CLAIM:42|a|b")).unwrap(),
            ClientFrame::Claim {
                fields: "42|a|b".into(),
            }
        );
    }

    #[test]
    fn binary_data_keeps_high_bytes_intact() {
        let mut raw = b"DATA:c1|".to_vec();
        raw.extend_from_slice(&[0x00, 0xff, 0x80, b'|', 0xfe]);
        assert_eq!(
            ClientFrame::parse(binary(&raw)).unwrap(),
            ClientFrame::Data {
                cid: "c1".into(),
                payload: Bytes::from_static(&[0x00, 0xff, 0x80, b'|', 0xfe]),
            }
        );
    }

    #[test]
    fn binary_udp_data_header_ends_at_the_first_pipe() {
        let mut raw = b"UDP_DATA:u1|".to_vec();
        raw.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            ClientFrame::parse(binary(&raw)).unwrap(),
            ClientFrame::UdpData {
                cid: "u1".into(),
                payload: Bytes::from_static(&[1, 2, 3]),
            }
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(
            ClientFrame::parse(text("NOPE:c1")).unwrap_err(),
            FrameError::UnknownTag
        );
        assert_eq!(
            ClientFrame::parse(text("no tag here")).unwrap_err(),
            FrameError::MissingTag
        );
        assert_eq!(
            ClientFrame::parse(text("TCP:c1")).unwrap_err(),
            FrameError::FieldCount
        );
        assert_eq!(
            ClientFrame::parse(text("DATA:|payload")).unwrap_err(),
            FrameError::EmptyCid
        );
        assert_eq!(
            ClientFrame::parse(text("CLOSE:")).unwrap_err(),
            FrameError::EmptyCid
        );
        assert_eq!(
            ClientFrame::parse(text("CLAIM:no-pipe")).unwrap_err(),
            FrameError::FieldCount
        );
        assert_eq!(
            ClientFrame::parse(binary(b"DATA:c1-no-pipe")).unwrap_err(),
            FrameError::FieldCount
        );
        assert_eq!(
            ClientFrame::parse(binary(b"CLOSE:c1|")).unwrap_err(),
            FrameError::UnknownTag
        );
        // Tags are case-sensitive.
        assert_eq!(
            ClientFrame::parse(text("tcp:c1|h:1")).unwrap_err(),
            FrameError::UnknownTag
        );
    }

    #[test]
    fn udp_connect_and_close_forms() {
        assert_eq!(
            ClientFrame::parse(text("UDP_CONNECT:u1|1.1.1.1:53")).unwrap(),
            ClientFrame::UdpOpen {
                cid: "u1".into(),
                target: "1.1.1.1:53".into(),
            }
        );
        assert_eq!(
            ClientFrame::parse(text("UDP_CLOSE:u1")).unwrap(),
            ClientFrame::UdpClose { cid: "u1".into() }
        );
    }

    #[test]
    fn server_frames_encode_to_the_wire_forms() {
        assert_eq!(
            ServerFrame::Connected { cid: "c1".into() }.encode(),
            text("CONNECTED:c1")
        );
        assert_eq!(
            ServerFrame::ClaimAck {
                fields: "42|abc".into()
            }
            .encode(),
            text("CLAIM_ACK:42|abc")
        );
        assert_eq!(
            ServerFrame::UdpError {
                cid: "u1".into(),
                message: "send failed".into()
            }
            .encode(),
            text("UDP_ERROR:u1|send failed")
        );

        let msg = ServerFrame::Data {
            cid: "c1".into(),
            payload: Bytes::from_static(&[0xde, 0xad]),
        }
        .encode();
        assert_eq!(msg, binary(&[b'D', b'A', b'T', b'A', b':', b'c', b'1', b'|', 0xde, 0xad]));

        let msg = ServerFrame::UdpData {
            cid: "u1".into(),
            source: "127.0.0.1:7".parse().unwrap(),
            payload: Bytes::from_static(b"pong"),
        }
        .encode();
        let mut want = b"UDP_DATA:u1|127.0.0.1:7|".to_vec();
        want.extend_from_slice(b"pong");
        assert_eq!(msg, binary(&want));
    }
}
