//! Wire protocol for attached sessions.
//!
//! After the line-based handshake, the connection carries length-prefixed
//! frames: one kind byte, a big-endian u32 payload length, then the
//! payload. Data frames carry terminal bytes in both directions. Request
//! frames carry named control requests whose payloads use big-endian
//! length-prefixed strings and u32s; `pty-req` and `window-change` are
//! the ones the gateway interprets.

use sandgate_core::error::{Error, Result};

pub const FRAME_DATA: u8 = 0;
pub const FRAME_REQUEST: u8 = 1;
pub const FRAME_ACK: u8 = 2;

/// Upper bound on a frame payload; anything larger is a protocol error.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Request(RequestFrame),
    Ack(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub name: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Decode a frame from its kind byte and raw payload.
    pub fn decode(kind: u8, payload: Vec<u8>) -> Result<Self> {
        match kind {
            FRAME_DATA => Ok(Frame::Data(payload)),
            FRAME_REQUEST => {
                let (name, rest) = parse_string(&payload)
                    .ok_or_else(|| Error::protocol_decode("request frame missing name"))?;
                let (&want_reply, rest) = rest
                    .split_first()
                    .ok_or_else(|| Error::protocol_decode("request frame missing reply flag"))?;
                Ok(Frame::Request(RequestFrame {
                    name,
                    want_reply: want_reply != 0,
                    payload: rest.to_vec(),
                }))
            }
            FRAME_ACK => match payload.as_slice() {
                [flag] => Ok(Frame::Ack(*flag != 0)),
                _ => Err(Error::protocol_decode("ack frame must be one byte")),
            },
            other => Err(Error::protocol_decode(format!("unknown frame kind {other}"))),
        }
    }

    /// Encode the full frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, payload) = match self {
            Frame::Data(bytes) => (FRAME_DATA, bytes.clone()),
            Frame::Request(request) => {
                let mut payload = encode_string(&request.name);
                payload.push(u8::from(request.want_reply));
                payload.extend_from_slice(&request.payload);
                (FRAME_REQUEST, payload)
            }
            Frame::Ack(ok) => (FRAME_ACK, vec![u8::from(*ok)]),
        };
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(kind);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Terminal geometry carried by `pty-req` and `window-change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u32,
    pub rows: u32,
}

/// Parse a big-endian length-prefixed UTF-8 string, returning the rest.
pub fn parse_string(buf: &[u8]) -> Option<(String, &[u8])> {
    let (len, rest) = parse_u32(buf)?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let (raw, rest) = rest.split_at(len);
    Some((String::from_utf8(raw.to_vec()).ok()?, rest))
}

pub fn parse_u32(buf: &[u8]) -> Option<(u32, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let (raw, rest) = buf.split_at(4);
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(raw);
    Some((u32::from_be_bytes(bytes), rest))
}

/// `pty-req` payload: TERM string, then columns and rows. Geometry with a
/// zero dimension is rejected.
pub fn parse_pty_request(payload: &[u8]) -> Option<Geometry> {
    let (_term, rest) = parse_string(payload)?;
    parse_geometry(rest)
}

/// `window-change` payload: columns and rows.
pub fn parse_window_change(payload: &[u8]) -> Option<Geometry> {
    parse_geometry(payload)
}

fn parse_geometry(buf: &[u8]) -> Option<Geometry> {
    let (cols, rest) = parse_u32(buf)?;
    let (rows, _) = parse_u32(rest)?;
    if cols == 0 || rows == 0 {
        return None;
    }
    Some(Geometry { cols, rows })
}

pub fn encode_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + s.len());
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    out
}

pub fn encode_pty_request(term: &str, cols: u32, rows: u32) -> Vec<u8> {
    let mut out = encode_string(term);
    out.extend_from_slice(&cols.to_be_bytes());
    out.extend_from_slice(&rows.to_be_bytes());
    out
}

pub fn encode_window_change(cols: u32, rows: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&cols.to_be_bytes());
    out.extend_from_slice(&rows.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let frame = Frame::Data(b"ls -la\n".to_vec());
        let encoded = frame.encode();
        assert_eq!(encoded[0], FRAME_DATA);
        assert_eq!(&encoded[1..5], &7u32.to_be_bytes());
        assert_eq!(Frame::decode(FRAME_DATA, encoded[5..].to_vec()).unwrap(), frame);
    }

    #[test]
    fn request_frame_round_trips() {
        let frame = Frame::Request(RequestFrame {
            name: "pty-req".to_string(),
            want_reply: true,
            payload: encode_pty_request("xterm", 120, 40),
        });
        let encoded = frame.encode();
        let decoded = Frame::decode(encoded[0], encoded[5..].to_vec()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn ack_frame_encodes_one_byte() {
        let encoded = Frame::Ack(true).encode();
        assert_eq!(encoded, vec![FRAME_ACK, 0, 0, 0, 1, 1]);
        assert_eq!(Frame::decode(FRAME_ACK, vec![0]).unwrap(), Frame::Ack(false));
        assert!(Frame::decode(FRAME_ACK, vec![1, 2]).is_err());
    }

    #[test]
    fn unknown_frame_kind_is_an_error() {
        assert!(Frame::decode(9, Vec::new()).is_err());
    }

    #[test]
    fn truncated_request_frame_is_an_error() {
        // Name claims 10 bytes but only 2 follow.
        let mut payload = 10u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"ab");
        assert!(Frame::decode(FRAME_REQUEST, payload).is_err());
    }

    #[test]
    fn pty_request_parses_geometry() {
        let payload = encode_pty_request("xterm-256color", 132, 43);
        let geometry = parse_pty_request(&payload).unwrap();
        assert_eq!(geometry, Geometry { cols: 132, rows: 43 });
    }

    #[test]
    fn zero_dimension_geometry_is_rejected() {
        assert!(parse_pty_request(&encode_pty_request("xterm", 0, 24)).is_none());
        assert!(parse_window_change(&encode_window_change(80, 0)).is_none());
    }

    #[test]
    fn short_buffers_parse_to_none() {
        assert!(parse_u32(&[1, 2, 3]).is_none());
        assert!(parse_string(&3u32.to_be_bytes()[..]).is_none());
        assert!(parse_window_change(&[0, 0, 0, 80]).is_none());
    }

    #[test]
    fn window_change_parses() {
        let geometry = parse_window_change(&encode_window_change(100, 30)).unwrap();
        assert_eq!(geometry.cols, 100);
        assert_eq!(geometry.rows, 30);
    }
}
