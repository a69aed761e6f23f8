use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encoding used on the control websocket. Text frames carry JSON, binary
/// frames carry MessagePack with named fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Msgpack,
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" => Ok(Self::Msgpack),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn format(&self) -> WireFormat {
        match self {
            Self::Text(_) => WireFormat::Json,
            Self::Binary(_) => WireFormat::Msgpack,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    Encode(String),
    Decode(String),
    FrameTooLarge(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "encode failed: {err}"),
            Self::Decode(err) => write!(f, "decode failed: {err}"),
            Self::FrameTooLarge(len) => write!(f, "frame too large: {len}"),
        }
    }
}

impl std::error::Error for CodecError {}

pub fn encode<T: Serialize>(format: WireFormat, value: &T) -> Result<Frame, CodecError> {
    let frame = match format {
        WireFormat::Json => serde_json::to_string(value)
            .map(Frame::Text)
            .map_err(|err| CodecError::Encode(err.to_string()))?,
        WireFormat::Msgpack => rmp_serde::to_vec_named(value)
            .map(Frame::Binary)
            .map_err(|err| CodecError::Encode(err.to_string()))?,
    };
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(frame.len()));
    }
    Ok(frame)
}

pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(frame.len()));
    }
    match frame {
        Frame::Text(text) => {
            serde_json::from_str(text).map_err(|err| CodecError::Decode(err.to_string()))
        }
        Frame::Binary(bytes) => {
            rmp_serde::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ControlReply, KeyAction, KeyEvent, Twist};

    #[test]
    fn frame_kind_selects_format() {
        let text = encode(WireFormat::Json, &KeyEvent::down("ArrowUp")).unwrap();
        assert!(matches!(text, Frame::Text(_)));
        assert_eq!(text.format(), WireFormat::Json);

        let binary = encode(WireFormat::Msgpack, &KeyEvent::up("ArrowUp")).unwrap();
        assert_eq!(binary.format(), WireFormat::Msgpack);
        let decoded: KeyEvent = decode(&binary).unwrap();
        assert_eq!(decoded.action, KeyAction::Up);
    }

    #[test]
    fn msgpack_reply_keeps_status_tag() {
        let reply = ControlReply::Ok {
            twist: Twist::new(0.182, 1.27),
            pressed_keys: vec!["ArrowUp".to_string(), "ArrowLeft".to_string()],
            timestamp: 7,
        };
        let frame = encode(WireFormat::Msgpack, &reply).unwrap();
        let decoded: ControlReply = decode(&frame).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let frame = Frame::Text("x".repeat(MAX_FRAME_SIZE + 1));
        let err = decode::<KeyEvent>(&frame).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }

    #[test]
    fn malformed_json_reports_decode_error() {
        let err = decode::<KeyEvent>(&Frame::Text("{\"action\":".to_string())).unwrap_err();
        assert!(err.to_string().starts_with("decode failed"));
    }

    #[test]
    fn wire_format_parses_case_insensitively() {
        assert_eq!("MsgPack".parse::<WireFormat>().unwrap(), WireFormat::Msgpack);
        assert!("cbor".parse::<WireFormat>().is_err());
    }
}
