use std::io::Cursor;

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// A firehose frame is two concatenated CBOR values: a small header
/// carrying the operation and message type, then the message body.
#[derive(Debug, Deserialize)]
struct FrameHeader {
    op: i64,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug)]
pub struct MessageFrame {
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct ErrorFrame {
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum Frame {
    Message(Option<String>, MessageFrame),
    Error(ErrorFrame),
}

impl TryFrom<&[u8]> for Frame {
    type Error = anyhow::Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        // ciborium reads exactly one value from the cursor, so its position
        // afterwards marks where the body starts.
        let mut cursor = Cursor::new(data);
        let header: FrameHeader = ciborium::from_reader(&mut cursor)
            .map_err(|e| anyhow!("could not decode frame header: {}", e))?;
        let body = data[cursor.position() as usize..].to_vec();

        match header.op {
            1 => Ok(Frame::Message(header.t, MessageFrame { body })),
            -1 => Ok(Frame::Error(ErrorFrame { body })),
            op => Err(anyhow!("invalid frame op: {}", op)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(op: i64, t: Option<&str>, body: &serde_json::Value) -> Vec<u8> {
        let mut buf = Vec::new();

        let header = match t {
            Some(t) => serde_json::json!({"op": op, "t": t}),
            None => serde_json::json!({"op": op}),
        };
        ciborium::into_writer(&header, &mut buf).unwrap();
        ciborium::into_writer(body, &mut buf).unwrap();

        buf
    }

    #[test]
    fn test_message_frame_split() {
        let body = serde_json::json!({"seq": 42});
        let data = encode_frame(1, Some("#commit"), &body);

        match Frame::try_from(&data[..]).unwrap() {
            Frame::Message(Some(t), message) => {
                assert_eq!(t, "#commit");

                let decoded: serde_json::Value =
                    ciborium::from_reader(&message.body[..]).unwrap();
                assert_eq!(decoded, body);
            }
            other => panic!("expected message frame, got {:?}", other),
        }
    }

    #[test]
    fn test_untyped_message_frame() {
        let data = encode_frame(1, None, &serde_json::json!({}));

        assert!(matches!(
            Frame::try_from(&data[..]).unwrap(),
            Frame::Message(None, _)
        ));
    }

    #[test]
    fn test_error_frame() {
        let data = encode_frame(-1, None, &serde_json::json!({"error": "FutureCursor"}));

        assert!(matches!(
            Frame::try_from(&data[..]).unwrap(),
            Frame::Error(_)
        ));
    }

    #[test]
    fn test_invalid_op_rejected() {
        let data = encode_frame(2, None, &serde_json::json!({}));
        assert!(Frame::try_from(&data[..]).is_err());

        assert!(Frame::try_from(&[][..]).is_err());
    }
}
