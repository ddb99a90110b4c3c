//! The wire protocol spoken with the shared key/value store.
//!
//! A small, length-prefixed request/response framing — one frame per
//! request, one frame per reply, decoded with a `tokio_util` codec the
//! same way every other inter-node link in this codebase frames its
//! traffic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// A request sent to the shared store.
#[derive(Debug, Clone)]
pub enum Request {
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes, ttl_secs: Option<u64> },
    Append { key: Bytes, chunk: Bytes },
    Del { key: Bytes },
    Ttl { key: Bytes },
    DbSize,
    InfoMemory,
}

/// A reply received from the shared store.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    NotFound,
    Value(Bytes),
    Bool(bool),
    Int(i64),
    Blob(Bytes),
    Err(String),
}

const OP_GET: u8 = 1;
const OP_SET: u8 = 2;
const OP_APPEND: u8 = 3;
const OP_DEL: u8 = 4;
const OP_TTL: u8 = 5;
const OP_DBSIZE: u8 = 6;
const OP_INFO_MEMORY: u8 = 7;

const REP_OK: u8 = 1;
const REP_NOT_FOUND: u8 = 2;
const REP_VALUE: u8 = 3;
const REP_BOOL: u8 = 4;
const REP_INT: u8 = 5;
const REP_BLOB: u8 = 6;
const REP_ERR: u8 = 7;

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn take_bytes(buf: &mut Bytes) -> io::Result<Bytes> {
    if buf.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated length"));
    }
    let len = buf.get_u32() as usize;
    if buf.len() < len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated payload"));
    }
    Ok(buf.split_to(len))
}

/// Encodes/decodes one whole [`Request`] frame, each framed by an outer
/// 4-byte big-endian length prefix (so a partial frame is detected before
/// any field-level parsing begins).
pub struct RequestCodec;

impl Encoder<Request> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> io::Result<()> {
        let mut body = BytesMut::new();
        match item {
            Request::Get { key } => {
                body.put_u8(OP_GET);
                put_bytes(&mut body, &key);
            }
            Request::Set { key, value, ttl_secs } => {
                body.put_u8(OP_SET);
                put_bytes(&mut body, &key);
                put_bytes(&mut body, &value);
                body.put_i64(ttl_secs.map(|t| t as i64).unwrap_or(-1));
            }
            Request::Append { key, chunk } => {
                body.put_u8(OP_APPEND);
                put_bytes(&mut body, &key);
                put_bytes(&mut body, &chunk);
            }
            Request::Del { key } => {
                body.put_u8(OP_DEL);
                put_bytes(&mut body, &key);
            }
            Request::Ttl { key } => {
                body.put_u8(OP_TTL);
                put_bytes(&mut body, &key);
            }
            Request::DbSize => body.put_u8(OP_DBSIZE),
            Request::InfoMemory => body.put_u8(OP_INFO_MEMORY),
        }
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Request>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(len).freeze();
        let op = body[0];
        body.advance(1);
        let req = match op {
            OP_GET => Request::Get { key: take_bytes(&mut body)? },
            OP_SET => {
                let key = take_bytes(&mut body)?;
                let value = take_bytes(&mut body)?;
                let ttl_raw = body.get_i64();
                let ttl_secs = if ttl_raw < 0 { None } else { Some(ttl_raw as u64) };
                Request::Set { key, value, ttl_secs }
            }
            OP_APPEND => {
                let key = take_bytes(&mut body)?;
                let chunk = take_bytes(&mut body)?;
                Request::Append { key, chunk }
            }
            OP_DEL => Request::Del { key: take_bytes(&mut body)? },
            OP_TTL => Request::Ttl { key: take_bytes(&mut body)? },
            OP_DBSIZE => Request::DbSize,
            OP_INFO_MEMORY => Request::InfoMemory,
            other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown opcode {other}"))),
        };
        Ok(Some(req))
    }
}

/// Encodes/decodes one whole [`Reply`] frame with the same outer framing
/// as [`RequestCodec`].
pub struct ReplyCodec;

impl Encoder<Reply> for ReplyCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> io::Result<()> {
        let mut body = BytesMut::new();
        match item {
            Reply::Ok => body.put_u8(REP_OK),
            Reply::NotFound => body.put_u8(REP_NOT_FOUND),
            Reply::Value(v) => {
                body.put_u8(REP_VALUE);
                put_bytes(&mut body, &v);
            }
            Reply::Bool(b) => {
                body.put_u8(REP_BOOL);
                body.put_u8(b as u8);
            }
            Reply::Int(i) => {
                body.put_u8(REP_INT);
                body.put_i64(i);
            }
            Reply::Blob(b) => {
                body.put_u8(REP_BLOB);
                put_bytes(&mut body, &b);
            }
            Reply::Err(msg) => {
                body.put_u8(REP_ERR);
                put_bytes(&mut body, msg.as_bytes());
            }
        }
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Reply>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(len).freeze();
        let tag = body[0];
        body.advance(1);
        let reply = match tag {
            REP_OK => Reply::Ok,
            REP_NOT_FOUND => Reply::NotFound,
            REP_VALUE => Reply::Value(take_bytes(&mut body)?),
            REP_BOOL => Reply::Bool(body.get_u8() != 0),
            REP_INT => Reply::Int(body.get_i64()),
            REP_BLOB => Reply::Blob(take_bytes(&mut body)?),
            REP_ERR => {
                let msg = take_bytes(&mut body)?;
                Reply::Err(String::from_utf8_lossy(&msg).into_owned())
            }
            other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown reply tag {other}"))),
        };
        Ok(Some(reply))
    }
}
