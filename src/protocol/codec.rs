//! Field-ordered binary encoding of the command channel.
//!
//! Layout follows Java `DataOutput`: big-endian integers, booleans as one
//! byte, strings as a 2-byte length followed by modified UTF-8. There are no
//! delimiters, so both ends must agree on the exact field order.

use crate::error::{DStoreError, Result};
use crate::protocol::constants::{CMD_EXEC, PROTO_COMMAND, PROTO_ERROR, PROTO_OK, PROTO_SHUTDOWN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

const MAX_UTF_LEN: usize = u16::MAX as usize;

/// Writes `value` as a length-prefixed modified UTF-8 string.
pub fn put_utf(buf: &mut BytesMut, value: &str) -> Result<()> {
    let mut encoded = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => encoded.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                encoded.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                encoded.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                encoded.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    if encoded.len() > MAX_UTF_LEN {
        return Err(DStoreError::InvalidArgument(format!(
            "encoded string is {} bytes, limit is {}",
            encoded.len(),
            MAX_UTF_LEN
        )));
    }
    buf.put_u16(encoded.len() as u16);
    buf.put_slice(&encoded);
    Ok(())
}

/// Reads a length-prefixed modified UTF-8 string.
pub fn get_utf(buf: &mut impl Buf) -> Result<String> {
    let len = get_u16(buf)? as usize;
    ensure_remaining(buf, len, "string body")?;
    let raw = buf.copy_to_bytes(len);
    let mut units: Vec<u16> = Vec::with_capacity(len);
    let mut i = 0;
    while i < raw.len() {
        let a = raw[i] as u16;
        if a & 0x80 == 0 {
            units.push(a);
            i += 1;
        } else if a & 0xE0 == 0xC0 {
            let b = continuation(&raw, i + 1)?;
            units.push(((a & 0x1F) << 6) | b);
            i += 2;
        } else if a & 0xF0 == 0xE0 {
            let b = continuation(&raw, i + 1)?;
            let c = continuation(&raw, i + 2)?;
            units.push(((a & 0x0F) << 12) | (b << 6) | c);
            i += 3;
        } else {
            return Err(DStoreError::Protocol(format!("invalid UTF lead byte 0x{:02x}", a)));
        }
    }
    String::from_utf16(&units).map_err(|e| DStoreError::Protocol(format!("invalid UTF-16 sequence: {}", e)))
}

fn continuation(raw: &[u8], at: usize) -> Result<u16> {
    match raw.get(at) {
        Some(byte) if byte & 0xC0 == 0x80 => Ok((byte & 0x3F) as u16),
        Some(byte) => Err(DStoreError::Protocol(format!("invalid UTF continuation byte 0x{:02x}", byte))),
        None => Err(DStoreError::Protocol("truncated UTF sequence".to_string())),
    }
}

fn ensure_remaining(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(DStoreError::Protocol(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    ensure_remaining(buf, 1, "byte")?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> Result<u16> {
    ensure_remaining(buf, 2, "short")?;
    Ok(buf.get_u16())
}

fn get_count(buf: &mut impl Buf, what: &str) -> Result<usize> {
    ensure_remaining(buf, 4, what)?;
    let count = buf.get_i32();
    if count < 0 {
        return Err(DStoreError::Protocol(format!("negative {}: {}", what, count)));
    }
    // Every counted item needs at least its 2-byte length prefix.
    ensure_remaining(buf, count as usize * 2, what)?;
    Ok(count as usize)
}

fn get_bool(buf: &mut impl Buf) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

/// Launch request carried by `CMD_EXEC`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub directory: String,
    pub redirect: bool,
    pub append_env: bool,
    /// stdout channel id
    pub chan_a: u8,
    /// stderr channel id
    pub chan_b: u8,
    /// stdin channel id
    pub chan_c: u8,
}

impl ExecRequest {
    pub fn new(command: Vec<String>, directory: impl Into<String>) -> Self {
        Self {
            command,
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(PROTO_COMMAND);
        buf.put_u16(CMD_EXEC);
        buf.put_u8(self.chan_a);
        buf.put_u8(self.chan_b);
        buf.put_u8(self.chan_c);
        buf.put_i32(self.command.len() as i32);
        for arg in &self.command {
            put_utf(&mut buf, arg)?;
        }
        buf.put_i32(self.env.len() as i32);
        for (key, value) in &self.env {
            put_utf(&mut buf, key)?;
            put_utf(&mut buf, value)?;
        }
        put_utf(&mut buf, &self.directory)?;
        buf.put_u8(self.redirect as u8);
        buf.put_u8(self.append_env as u8);
        Ok(buf.freeze())
    }

    /// Decodes the body that follows the tag and command id.
    fn decode_body(buf: &mut impl Buf) -> Result<Self> {
        let chan_a = get_u8(buf)?;
        let chan_b = get_u8(buf)?;
        let chan_c = get_u8(buf)?;
        let argc = get_count(buf, "argument count")?;
        let mut command = Vec::with_capacity(argc);
        for _ in 0..argc {
            command.push(get_utf(buf)?);
        }
        let envc = get_count(buf, "environment count")?;
        let mut env = BTreeMap::new();
        for _ in 0..envc {
            let key = get_utf(buf)?;
            let value = get_utf(buf)?;
            env.insert(key, value);
        }
        let directory = get_utf(buf)?;
        let redirect = get_bool(buf)?;
        let append_env = get_bool(buf)?;
        Ok(Self {
            command,
            env,
            directory,
            redirect,
            append_env,
            chan_a,
            chan_b,
            chan_c,
        })
    }
}

/// A request read from the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Exec(ExecRequest),
    Shutdown,
}

impl Request {
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Request::Exec(exec) => exec.encode(),
            Request::Shutdown => Ok(Bytes::from_static(&[PROTO_SHUTDOWN])),
        }
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        match get_u8(&mut buf)? {
            PROTO_COMMAND => {
                let command_id = get_u16(&mut buf)?;
                if command_id != CMD_EXEC {
                    return Err(DStoreError::Protocol(format!("unsupported command id {}", command_id)));
                }
                let exec = ExecRequest::decode_body(&mut buf)?;
                if buf.has_remaining() {
                    return Err(DStoreError::Protocol(format!(
                        "{} trailing bytes after exec request",
                        buf.remaining()
                    )));
                }
                Ok(Request::Exec(exec))
            }
            PROTO_SHUTDOWN => Ok(Request::Shutdown),
            tag => Err(DStoreError::Protocol(format!("unexpected request tag {}", tag))),
        }
    }
}

/// Reply to a command-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error(String),
}

impl Reply {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Reply::Ok => buf.put_u8(PROTO_OK),
            Reply::Error(message) => {
                buf.put_u8(PROTO_ERROR);
                put_utf(&mut buf, message)?;
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        match get_u8(&mut buf)? {
            PROTO_OK => Ok(Reply::Ok),
            PROTO_ERROR => Ok(Reply::Error(get_utf(&mut buf)?)),
            tag => Err(DStoreError::Protocol(format!("unexpected reply tag {}", tag))),
        }
    }

    /// Turns an error reply into a typed remote failure.
    pub fn into_result(self) -> Result<()> {
        match self {
            Reply::Ok => Ok(()),
            Reply::Error(message) => Err(DStoreError::RemoteExecution(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf_round_trip(value: &str) -> String {
        let mut buf = BytesMut::new();
        put_utf(&mut buf, value).unwrap();
        get_utf(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn modified_utf_matches_java_layout() {
        let mut buf = BytesMut::new();
        put_utf(&mut buf, "a\0é").unwrap();
        // NUL is two bytes in modified UTF-8
        assert_eq!(&buf[..], &[0x00, 0x05, b'a', 0xC0, 0x80, 0xC3, 0xA9]);
    }

    #[test]
    fn supplementary_characters_use_surrogate_pairs() {
        let mut buf = BytesMut::new();
        put_utf(&mut buf, "🦀").unwrap();
        assert_eq!(buf.len(), 2 + 6);
        assert_eq!(utf_round_trip("crab 🦀 krabbe"), "crab 🦀 krabbe");
    }

    #[test]
    fn exec_request_round_trip() {
        let mut request = ExecRequest::new(
            vec!["grep".to_string(), "-r".to_string(), "Grüße, 世界".to_string()],
            "/home/ünïcode",
        );
        request.redirect = true;
        request.chan_a = 3;
        request.chan_b = 4;
        request.chan_c = 5;

        let encoded = Request::Exec(request.clone()).encode().unwrap();
        assert_eq!(encoded[0], PROTO_COMMAND);
        match Request::decode(encoded).unwrap() {
            Request::Exec(decoded) => {
                assert_eq!(decoded, request);
                assert!(decoded.env.is_empty());
                assert!(!decoded.append_env);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn truncated_request_is_protocol_error() {
        let encoded = ExecRequest::new(vec!["ls".into()], "/").encode().unwrap();
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(matches!(Request::decode(truncated), Err(DStoreError::Protocol(_))));
    }

    #[test]
    fn huge_count_does_not_allocate() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTO_COMMAND);
        buf.put_u16(CMD_EXEC);
        buf.put_slice(&[1, 2, 3]);
        buf.put_i32(i32::MAX);
        assert!(matches!(Request::decode(buf.freeze()), Err(DStoreError::Protocol(_))));
    }

    #[test]
    fn error_reply_becomes_remote_execution_error() {
        let encoded = Reply::Error("cannot run program \"nope\"".into()).encode().unwrap();
        let reply = Reply::decode(encoded).unwrap();
        match reply.into_result() {
            Err(DStoreError::RemoteExecution(msg)) => assert!(msg.contains("nope")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_reply_tag_is_protocol_error() {
        let err = Reply::decode(Bytes::from_static(&[42])).unwrap_err();
        assert!(err.is_fatal());
    }
}
