// src/core/protocol/resp.rs

//! Implements the RESP2 frame structure and the corresponding `Encoder`/
//! `Decoder` for network communication. Only the RESP2 subset used by
//! is supported: simple strings, errors, integers, bulk strings,
//! and arrays, with null bulk strings/arrays encoded via a `-1` length.

use crate::core::errors::HyperCacheError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

/// Protocol-level limits to prevent denial-of-service from malformed frames.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;

/// A single frame in the RESP2 protocol — the wire-level representation
/// exchanged between a client and this server.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Encodes a frame into a standalone `Vec<u8>`. Used by the AOF writer
    /// is not needed here (the log uses its own binary record format), but
    /// tests and the cluster client use this to build request/response
    /// fixtures without going through a `Framed` stream.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, HyperCacheError> {
        let mut buf = BytesMut::new();
        RespCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    pub fn bulk(s: impl Into<Vec<u8>>) -> Self {
        RespFrame::BulkString(Bytes::from(s.into()))
    }

    pub fn ok() -> Self {
        RespFrame::SimpleString("OK".to_string())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        RespFrame::Error(msg.into())
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default)]
pub struct RespCodec;

impl Encoder<RespFrame> for RespCodec {
    type Error = HyperCacheError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => {
                dst.extend_from_slice(b"$-1\r\n");
            }
            RespFrame::NullArray => {
                dst.extend_from_slice(b"*-1\r\n");
            }
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = RespFrame;
    type Error = HyperCacheError;

    /// Returns `Ok(None)` if the buffer does not contain a full frame yet,
    /// which lets `Framed` wait for more bytes from the socket.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src) {
            Ok((frame, len)) => {
                src.advance(len);
                Ok(Some(frame))
            }
            Err(HyperCacheError::IncompleteFrame) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_frame(src: &[u8]) -> Result<(RespFrame, usize), HyperCacheError> {
    if src.is_empty() {
        return Err(HyperCacheError::IncompleteFrame);
    }
    match src[0] {
        b'+' => parse_simple_string(src),
        b'-' => parse_error(src),
        b':' => parse_integer(src),
        b'$' => parse_bulk_string(src),
        b'*' => parse_array(src),
        _ => Err(HyperCacheError::Protocol(format!(
            "invalid frame type byte '{}'",
            src[0] as char
        ))),
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}

fn parse_line(src: &[u8]) -> Result<(&[u8], usize), HyperCacheError> {
    find_crlf(src)
        .map(|pos| (&src[..pos], pos + CRLF_LEN))
        .ok_or(HyperCacheError::IncompleteFrame)
}

fn parse_simple_string(src: &[u8]) -> Result<(RespFrame, usize), HyperCacheError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::SimpleString(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

fn parse_error(src: &[u8]) -> Result<(RespFrame, usize), HyperCacheError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::Error(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

fn parse_integer(src: &[u8]) -> Result<(RespFrame, usize), HyperCacheError> {
    let (line, len) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let i = s
        .parse::<i64>()
        .map_err(|_| HyperCacheError::Protocol("invalid integer frame".to_string()))?;
    Ok((RespFrame::Integer(i), len + 1))
}

fn parse_bulk_string(src: &[u8]) -> Result<(RespFrame, usize), HyperCacheError> {
    let (line, len_of_line) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let str_len = s
        .parse::<isize>()
        .map_err(|_| HyperCacheError::Protocol("invalid bulk string length".to_string()))?;

    if str_len == -1 {
        return Ok((RespFrame::Null, len_of_line + 1));
    }
    if str_len < 0 {
        return Err(HyperCacheError::Protocol(
            "negative bulk string length".to_string(),
        ));
    }

    let str_len = str_len as usize;
    if str_len > MAX_BULK_STRING_SIZE {
        return Err(HyperCacheError::Protocol(
            "bulk string exceeds maximum size".to_string(),
        ));
    }

    let total_len_prefix = len_of_line + 1;
    if src.len() < total_len_prefix + str_len + CRLF_LEN {
        return Err(HyperCacheError::IncompleteFrame);
    }
    if &src[total_len_prefix + str_len..total_len_prefix + str_len + CRLF_LEN] != CRLF {
        return Err(HyperCacheError::Protocol(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data_start = total_len_prefix;
    let data_end = total_len_prefix + str_len;
    let data = Bytes::copy_from_slice(&src[data_start..data_end]);
    Ok((RespFrame::BulkString(data), data_end + CRLF_LEN))
}

fn parse_array(src: &[u8]) -> Result<(RespFrame, usize), HyperCacheError> {
    let (line, len_of_line) = parse_line(&src[1..])?;
    let s = String::from_utf8_lossy(line);
    let arr_len = s
        .parse::<isize>()
        .map_err(|_| HyperCacheError::Protocol("invalid array length".to_string()))?;

    if arr_len == -1 {
        return Ok((RespFrame::NullArray, len_of_line + 1));
    }
    if arr_len < 0 {
        return Err(HyperCacheError::Protocol(
            "negative array length".to_string(),
        ));
    }

    let arr_len = arr_len as usize;
    if arr_len > MAX_FRAME_ELEMENTS {
        return Err(HyperCacheError::Protocol(
            "array exceeds maximum element count".to_string(),
        ));
    }

    let mut frames = Vec::with_capacity(arr_len);
    let mut cursor = len_of_line + 1;
    for _ in 0..arr_len {
        let (frame, frame_len) = parse_frame(&src[cursor..])?;
        frames.push(frame);
        cursor += frame_len;
    }

    Ok((RespFrame::Array(frames), cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: RespFrame) {
        let mut buf = BytesMut::new();
        RespCodec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = RespCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrips_all_frame_kinds() {
        roundtrip(RespFrame::SimpleString("OK".to_string()));
        roundtrip(RespFrame::Error("ERR boom".to_string()));
        roundtrip(RespFrame::Integer(-42));
        roundtrip(RespFrame::bulk("hello"));
        roundtrip(RespFrame::Null);
        roundtrip(RespFrame::NullArray);
        roundtrip(RespFrame::Array(vec![
            RespFrame::bulk("SET"),
            RespFrame::bulk("key1"),
            RespFrame::bulk("value1"),
        ]));
    }

    #[test]
    fn incomplete_frame_requests_more_data() {
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert!(RespCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn pipelined_commands_decode_in_order() {
        let mut buf = BytesMut::new();
        RespCodec
            .encode(RespFrame::Array(vec![RespFrame::bulk("PING")]), &mut buf)
            .unwrap();
        RespCodec
            .encode(RespFrame::Array(vec![RespFrame::bulk("PING")]), &mut buf)
            .unwrap();
        let first = RespCodec.decode(&mut buf).unwrap().unwrap();
        let second = RespCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, RespFrame::Array(vec![RespFrame::bulk("PING")]));
        assert_eq!(second, RespFrame::Array(vec![RespFrame::bulk("PING")]));
    }

    #[test]
    fn s1_set_get_exact_bytes() {
        let set = RespFrame::Array(vec![
            RespFrame::bulk("SET"),
            RespFrame::bulk("key1"),
            RespFrame::bulk("value1"),
        ]);
        assert_eq!(
            set.encode_to_vec().unwrap(),
            b"*3\r\n$3\r\nSET\r\n$4\r\nkey1\r\n$6\r\nvalue1\r\n".to_vec()
        );
        assert_eq!(
            RespFrame::ok().encode_to_vec().unwrap(),
            b"+OK\r\n".to_vec()
        );
        assert_eq!(
            RespFrame::bulk("value1").encode_to_vec().unwrap(),
            b"$6\r\nvalue1\r\n".to_vec()
        );
    }
}
