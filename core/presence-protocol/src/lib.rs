//! Wire framing and activity extraction for the rich presence IPC proxy.
//!
//! Shared by the proxy and anything that talks to it so the frame layout
//! cannot drift. Nothing in here touches a socket; callers feed it bytes.

use serde::Serialize;
use serde_json::Value;

/// Bytes in a frame header: little-endian opcode, then little-endian length.
pub const HEADER_SIZE: usize = 8;

pub const OP_HANDSHAKE: u32 = 0;
pub const OP_FRAME: u32 = 1;

pub const SET_ACTIVITY: &str = "SET_ACTIVITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake,
    Frame,
    /// Any other tag. Passed through without inspection.
    Other(u32),
}

impl From<u32> for Opcode {
    fn from(value: u32) -> Self {
        match value {
            OP_HANDSHAKE => Opcode::Handshake,
            OP_FRAME => Opcode::Frame,
            other => Opcode::Other(other),
        }
    }
}

impl From<Opcode> for u32 {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Handshake => OP_HANDSHAKE,
            Opcode::Frame => OP_FRAME,
            Opcode::Other(value) => value,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit the 32-bit length field")]
    PayloadTooLarge(usize),
}

/// One complete frame found at the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub opcode: Opcode,
    pub payload: String,
    /// Header plus payload. The caller advances its buffer by exactly this much.
    pub consumed: usize,
}

/// Decodes the frame at the front of `buf`.
///
/// Returns `None` while the buffer is shorter than a header or shorter than
/// the declared payload; that is not an error, the caller keeps its bytes and
/// tries again once more arrive. Trailing bytes past the first frame are left
/// alone.
pub fn decode_frame(buf: &[u8]) -> Option<DecodedFrame> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let opcode = read_u32_le(&buf[0..4]);
    let payload_len = read_u32_le(&buf[4..8]) as usize;
    let consumed = HEADER_SIZE.checked_add(payload_len)?;
    if buf.len() < consumed {
        return None;
    }

    let payload = String::from_utf8_lossy(&buf[HEADER_SIZE..consumed]).into_owned();
    Some(DecodedFrame {
        opcode: Opcode::from(opcode),
        payload,
        consumed,
    })
}

/// Encodes a header and payload. The length field counts bytes, not chars.
pub fn encode_frame(opcode: Opcode, payload: &str) -> Result<Vec<u8>, FrameError> {
    let payload_len =
        u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&u32::from(opcode).to_le_bytes());
    out.extend_from_slice(&payload_len.to_le_bytes());
    out.extend_from_slice(payload.as_bytes());
    Ok(out)
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

// Shape of the READY dispatch a real service sends after a handshake. Field
// order is the serialization order.
#[derive(Serialize)]
struct ReadyDispatch {
    cmd: &'static str,
    evt: &'static str,
    data: ReadyData,
}

#[derive(Serialize)]
struct ReadyData {
    v: u32,
    user: ReadyUser,
}

#[derive(Serialize)]
struct ReadyUser {
    id: &'static str,
    username: &'static str,
    discriminator: &'static str,
}

/// JSON body of the synthetic READY reply, with a placeholder user.
pub fn ready_payload() -> String {
    let dispatch = ReadyDispatch {
        cmd: "DISPATCH",
        evt: "READY",
        data: ReadyData {
            v: 1,
            user: ReadyUser {
                id: "1",
                username: "Proxy",
                discriminator: "0",
            },
        },
    };
    // Plain structs of strings and integers always serialize.
    serde_json::to_string(&dispatch).unwrap_or_default()
}

/// Full `FRAME` frame carrying [`ready_payload`], sent to clients in passive mode.
pub fn ready_response() -> Vec<u8> {
    // The payload is a fixed ~100 bytes, well under the length limit.
    encode_frame(Opcode::Frame, &ready_payload()).unwrap_or_default()
}

/// Presence fields pulled out of a `SET_ACTIVITY` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityUpdate {
    /// Client supplied. Zero when absent or not a valid process id.
    pub pid: i32,
    pub state: Option<String>,
    pub details: Option<String>,
}

impl ActivityUpdate {
    /// Whether the pid can name a real process and so be stored.
    pub fn has_pid(&self) -> bool {
        self.pid > 0
    }
}

/// Parses a `FRAME` payload and returns the activity it sets, if any.
///
/// Invalid JSON, non-object roots and any `cmd` other than `SET_ACTIVITY` all
/// yield `None`; most frames are not presence updates.
pub fn extract_activity(payload: &str) -> Option<ActivityUpdate> {
    if payload.is_empty() {
        return None;
    }

    let root: Value = serde_json::from_str(payload).ok()?;
    let command = root.as_object()?;
    if command.get("cmd").and_then(|v| v.as_str()) != Some(SET_ACTIVITY) {
        return None;
    }

    let args = command.get("args");
    let pid = args
        .and_then(|args| args.get("pid"))
        .and_then(|v| v.as_i64())
        .and_then(|raw| i32::try_from(raw).ok())
        .unwrap_or(0);

    let activity = args.and_then(|args| args.get("activity"));
    Some(ActivityUpdate {
        pid,
        state: non_empty_string(activity, "state"),
        details: non_empty_string(activity, "details"),
    })
}

fn non_empty_string(object: Option<&Value>, field: &str) -> Option<String> {
    object
        .and_then(|value| value.get(field))
        .and_then(|v| v.as_str())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}
