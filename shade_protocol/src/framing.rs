// Length-delimited framing over TCP, plus the transport frames.
//
// Wire format: a 4-byte big-endian length prefix followed by a
// JSON-serialized frame. `write_message` / `read_message` deal in raw bytes
// and stay format-agnostic; `write_frame` / `read_frame` add the JSON layer
// for the two frame types.
//
// A request frame is a header (the session id, absent before the
// handshake) plus an encrypted body. A reply frame is a status code plus an
// encrypted body. The router never looks inside a body before it has
// resolved the session whose cipher decrypts it.
//
// A `MAX_MESSAGE_SIZE` constant (16 MB) protects against unbounded
// allocation from malformed or malicious length prefixes. Transfer chunks
// are the largest expected payloads.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Maximum allowed message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = msg.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited message: 4-byte big-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// message. Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Serialize `frame` to JSON and write it with length-delimited framing.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    let json = serde_json::to_vec(frame).map_err(io::Error::from)?;
    write_message(writer, &json)
}

/// Read one length-delimited JSON frame. Malformed JSON is `InvalidData`.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    let bytes = read_message(reader)?;
    serde_json::from_slice(&bytes).map_err(io::Error::from)
}

/// Client-to-router frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Absent until the handshake has produced a session.
    pub session: Option<SessionId>,
    /// Encrypted JSON of `Vec<Request>`. Empty bodies are answered with a
    /// redirect.
    pub body: Vec<u8>,
}

/// Router-to-client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub status: Status,
    /// Set with `Status::Redirect`.
    pub location: Option<String>,
    /// Encrypted JSON of `Vec<Reply>`; empty on error statuses.
    pub body: Vec<u8>,
}

impl ReplyFrame {
    /// A bodiless reply carrying only a status.
    pub fn status(status: Status) -> Self {
        Self {
            status,
            location: None,
            body: Vec::new(),
        }
    }
}

/// Reply status, modelled on the HTTP codes the transport used to carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Redirect,
    BadRequest,
    Unauthorized,
    NotFound,
    NotImplemented,
}

impl Status {
    /// The numeric HTTP-equivalent code.
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Redirect => 302,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::NotFound => 404,
            Status::NotImplemented => 501,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Ok
    }
}
