//! PiMMS wire protocol
//!
//! Every message is framed as:
//!
//! ```text
//! "#!" | length: u32 | body | length: u32
//! ```
//!
//! where `length` covers the body plus the trailing length word, and the body
//! is a single Qt `QDataStream`-style variant (type id, null flag, value).
//! All integers are big-endian.

use bytes::{BufMut, Bytes, BytesMut};

/// Frame marker bytes ("#!")
pub const FRAME_MARKER: [u8; 2] = [0x23, 0x21];

/// Marker plus leading length word
pub const FRAME_HEADER_SIZE: usize = 6;

/// Trailing length word
pub const FRAME_TRAILER_SIZE: usize = 4;

/// PiMMS message type carried by trigger role frames
pub const MSG_TYPE_TRIGGER: u8 = 0x02;

/// PiMMS message type for a controller log on
pub const MSG_TYPE_LOG_ON: i32 = 0x04;

/// Opcode of the "train started" trigger frame
pub const OPCODE_TRAIN_START: u8 = 0x01;

/// Default log on session identifier
pub const DEFAULT_SESSION_ID: &str = "VioCamera";

/// Trigger message opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerOpcode {
    /// Trigger event (ride has started)
    Event = 0x02,

    /// Response to the server's trigger poll
    PollResponse = 0x07,
}

impl From<TriggerOpcode> for u8 {
    fn from(op: TriggerOpcode) -> Self {
        op as u8
    }
}

/// Serialized variant type ids
mod type_id {
    pub const BOOL: u32 = 1;
    pub const INT: u32 = 2;
    pub const STRING: u32 = 10;
    pub const BYTE_ARRAY: u32 = 12;
    pub const HASH: u32 = 28;
}

/// A value in the server's variant serialization
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Int(i32),
    String(String),
    ByteArray(Vec<u8>),
    /// Key/value pairs, emitted in the given order
    Hash(Vec<(String, Variant)>),
}

impl Variant {
    fn type_id(&self) -> u32 {
        match self {
            Variant::Bool(_) => type_id::BOOL,
            Variant::Int(_) => type_id::INT,
            Variant::String(_) => type_id::STRING,
            Variant::ByteArray(_) => type_id::BYTE_ARRAY,
            Variant::Hash(_) => type_id::HASH,
        }
    }

    /// Encode type id, null flag and value
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.type_id());
        buf.put_u8(0);
        match self {
            Variant::Bool(b) => buf.put_u8(u8::from(*b)),
            Variant::Int(i) => buf.put_i32(*i),
            Variant::String(s) => put_string(buf, s),
            Variant::ByteArray(bytes) => {
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            Variant::Hash(entries) => {
                buf.put_u32(entries.len() as u32);
                for (key, value) in entries {
                    put_string(buf, key);
                    value.encode(buf);
                }
            }
        }
    }
}

/// Strings are a byte length followed by UTF-16BE code units
fn put_string(buf: &mut BytesMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    buf.put_u32((units.len() * 2) as u32);
    for unit in units {
        buf.put_u16(unit);
    }
}

/// Wrap a variant body in marker and length words.
///
/// Lengths are always derived from the encoded body.
pub fn frame(body: &Variant) -> Bytes {
    let mut payload = BytesMut::new();
    body.encode(&mut payload);

    let length = (payload.len() + FRAME_TRAILER_SIZE) as u32;
    let mut buf =
        BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
    buf.put_slice(&FRAME_MARKER);
    buf.put_u32(length);
    buf.extend_from_slice(&payload);
    buf.put_u32(length);
    buf.freeze()
}

/// Encode a trigger message (event or poll response).
///
/// 21 bytes, opcode at offset 16.
pub fn encode_trigger(opcode: u8) -> Bytes {
    frame(&Variant::ByteArray(vec![MSG_TYPE_TRIGGER, opcode]))
}

/// Encode a "train N started" message.
///
/// Train and controller ids are zero-based. Only the first ASCII character of
/// each decimal id is sent, so ids of 10 or more are truncated to their
/// leading digit. Deployments keep both below 10.
///
/// The server expects a trigger event within 5s of this message.
pub fn encode_train_start(train_index: u32, controller_index: u32) -> Bytes {
    frame(&Variant::ByteArray(vec![
        MSG_TYPE_TRIGGER,
        OPCODE_TRAIN_START,
        leading_digit(train_index),
        b',',
        leading_digit(controller_index),
    ]))
}

fn leading_digit(index: u32) -> u8 {
    // u32 decimal rendering is never empty
    index.to_string().as_bytes()[0]
}

/// Controller log on parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOn {
    /// Session identifier reported to the server
    pub session_id: String,

    /// "OK" flag
    pub ok: bool,

    /// "TEST" flag
    pub test: bool,
}

impl Default for LogOn {
    fn default() -> Self {
        Self {
            session_id: DEFAULT_SESSION_ID.to_string(),
            ok: true,
            test: false,
        }
    }
}

impl LogOn {
    /// Log on with the given session id and the deployed flags
    pub fn with_session_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    fn to_variant(&self) -> Variant {
        Variant::Hash(vec![
            ("OK".to_string(), Variant::Bool(self.ok)),
            (
                "SSID".to_string(),
                Variant::String(self.session_id.clone()),
            ),
            ("__MSG_TYPE".to_string(), Variant::Int(MSG_TYPE_LOG_ON)),
            ("__MSG_STRING".to_string(), Variant::String(String::new())),
            ("__MSG_OPCODE".to_string(), Variant::Int(0)),
            ("TEST".to_string(), Variant::Bool(self.test)),
        ])
    }
}

/// Encode a controller log on message.
///
/// The server works out which train is logging on from the source address,
/// so the content only varies by session id.
pub fn encode_log_on(log_on: &LogOn) -> Bytes {
    frame(&log_on.to_variant())
}

/// Read the leading length word of a frame, if the marker is present
pub fn declared_length(frame: &[u8]) -> Option<u32> {
    if frame.len() < FRAME_HEADER_SIZE || frame[..2] != FRAME_MARKER {
        return None;
    }
    Some(u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]))
}
