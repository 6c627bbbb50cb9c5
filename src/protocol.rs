//! Wire format of the signaling server: Engine.IO type-code-prefixed text frames
//! carrying Socket.IO style `[eventName, payload]` events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;

pub const EVENT_SYN: &str = "syn";
pub const EVENT_SYN_ACK: &str = "syn-ack";
pub const EVENT_SIG: &str = "sig";
pub const EVENT_SIG_ACK: &str = "sig-ack";

/// Frame type, selected by the leading one or two ASCII digits of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    EmptyMessage,
    CommonMessage,
    Ack,
}

impl FrameType {
    pub fn code(self) -> &'static str {
        match self {
            FrameType::Open => "0",
            FrameType::Close => "1",
            FrameType::Ping => "2",
            FrameType::Pong => "3",
            FrameType::Message => "4",
            FrameType::EmptyMessage => "40",
            FrameType::CommonMessage => "42",
            FrameType::Ack => "43",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(FrameType::Open),
            "1" => Some(FrameType::Close),
            "2" => Some(FrameType::Ping),
            "3" => Some(FrameType::Pong),
            "4" => Some(FrameType::Message),
            "40" => Some(FrameType::EmptyMessage),
            "42" => Some(FrameType::CommonMessage),
            "43" => Some(FrameType::Ack),
            _ => None,
        }
    }
}

/// One inbound frame split into its type code and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub code: &'a str,
    pub kind: Option<FrameType>,
    pub body: &'a str,
}

impl<'a> Frame<'a> {
    pub fn parse(text: &'a str) -> Result<Self, SignalingError> {
        let digits = text
            .bytes()
            .take(2)
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits == 0 {
            return Err(SignalingError::MalformedFrame(format!(
                "missing type code: {:?}",
                text
            )));
        }
        let (code, body) = text.split_at(digits);
        Ok(Self {
            code,
            kind: FrameType::from_code(code),
            body,
        })
    }
}

/// Encode a COMMON_MESSAGE frame: `42["event",{...}]`.
pub fn encode_event<T: Serialize>(event: &str, payload: &T) -> serde_json::Result<String> {
    Ok(format!(
        "{}{}",
        FrameType::CommonMessage.code(),
        serde_json::to_string(&(event, payload))?
    ))
}

/// Split a COMMON_MESSAGE body into its event name and payload.
pub fn decode_event(body: &str) -> Result<(String, Value), SignalingError> {
    let mut args: Vec<Value> = serde_json::from_str(body)?;
    if args.is_empty() {
        return Err(SignalingError::MalformedFrame("empty event array".into()));
    }
    let payload = if args.len() > 1 { args.swap_remove(1) } else { Value::Null };
    match args.swap_remove(0) {
        Value::String(name) => Ok((name, payload)),
        other => Err(SignalingError::MalformedFrame(format!(
            "event name is not a string: {}",
            other
        ))),
    }
}

// ======================== Server frames ========================

/// Body of the OPEN frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenMessage {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynAck {
    pub msg_id: u64,
    pub success: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub sender_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigAck {
    pub msg_id: u64,
    pub success: bool,
    #[serde(default)]
    pub reason: String,
}

// ======================== Client messages ========================

/// Identity synchronization request, answered by `syn-ack`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynRequest {
    pub msg_id: u64,
    pub name: String,
    pub is_sender: bool,
}

impl SynRequest {
    pub fn new(name: impl Into<String>, is_sender: bool) -> Self {
        Self {
            msg_id: 0,
            name: name.into(),
            is_sender,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Description,
    Candidate,
    #[serde(other)]
    Unknown,
}

/// Signal envelope exchanged with the peer through the server.
///
/// `from` is filled in by the server when it forwards the envelope. `body` stays an
/// untyped JSON value until the negotiator converts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    #[serde(default)]
    pub msg_id: u64,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub body: Value,
}

impl Signal {
    pub fn new(kind: SignalKind, to: impl Into<String>, body: Value) -> Self {
        Self {
            msg_id: 0,
            kind,
            to: to.into(),
            from: String::new(),
            body,
        }
    }
}

/// Outbound message kinds. Each variant knows its event name.
#[derive(Debug, Clone)]
pub enum Outbound {
    Syn(SynRequest),
    Signal(Signal),
}

impl Outbound {
    pub fn event(&self) -> &'static str {
        match self {
            Outbound::Syn(_) => EVENT_SYN,
            Outbound::Signal(_) => EVENT_SIG,
        }
    }

    pub fn set_msg_id(&mut self, id: u64) {
        match self {
            Outbound::Syn(m) => m.msg_id = id,
            Outbound::Signal(m) => m.msg_id = id,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        match self {
            Outbound::Syn(m) => encode_event(EVENT_SYN, m),
            Outbound::Signal(m) => encode_event(EVENT_SIG, m),
        }
    }
}
