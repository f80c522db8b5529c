//! Frame codec: length prefix, request/response header, bincode body.
//!
//! Request:  len (u32 BE) | api_key (i16) | api_version (i16) | correlation_id (i32)
//!           | client_id_len (i16, -1 = none) | client_id | body
//! Response: len (u32 BE) | correlation_id (i32) | api_key (i16) | body

use super::messages::*;
use crate::error::{ClientError, Result};
use bincode::Options;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Version spoken for every api.
pub const API_VERSION: i16 = 1;
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024; // 100MB

const LEN_PREFIX: usize = 4;
const REQUEST_HEADER_LEN: usize = 2 + 2 + 4 + 2;
const RESPONSE_HEADER_LEN: usize = 4 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

/// A decoded request with its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: RequestHeader,
    pub request: Request,
}

/// A decoded response with the correlation id it echoes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub correlation_id: i32,
    pub response: Response,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_FRAME_LEN as u64)
        .reject_trailing_bytes()
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    wire_options()
        .serialize(value)
        .map_err(|e| ClientError::Serialization(e.to_string()))
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    wire_options()
        .deserialize(body)
        .map_err(|e| ClientError::MalformedFrame(format!("body: {}", e)))
}

fn write_frame(dst: &mut BytesMut, header: &[u8], body: &[u8]) -> Result<()> {
    let frame_len = header.len() + body.len();
    if frame_len > MAX_FRAME_LEN {
        return Err(ClientError::Serialization(format!(
            "frame of {} bytes exceeds limit {}",
            frame_len, MAX_FRAME_LEN
        )));
    }
    dst.reserve(LEN_PREFIX + frame_len);
    dst.put_u32(frame_len as u32);
    dst.extend_from_slice(header);
    dst.extend_from_slice(body);
    Ok(())
}

/// Strip and check the length prefix of one complete frame.
fn frame_payload(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < LEN_PREFIX {
        return Err(ClientError::MalformedFrame(format!(
            "{} bytes is shorter than the length prefix",
            frame.len()
        )));
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let available = frame.len() - LEN_PREFIX;
    if declared > available {
        return Err(ClientError::MalformedFrame(format!(
            "declared length {} exceeds buffer of {}",
            declared, available
        )));
    }
    if declared < available {
        return Err(ClientError::MalformedFrame(format!(
            "{} trailing bytes after frame",
            available - declared
        )));
    }
    Ok(&frame[LEN_PREFIX..])
}

/// Split one complete frame (length prefix included) off the front of `src`.
/// Returns `Ok(None)` until the whole frame has arrived.
pub fn split_frame(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClientError::MalformedFrame(format!(
            "declared length {} exceeds limit {}",
            len, MAX_FRAME_LEN
        )));
    }
    if src.len() < LEN_PREFIX + len {
        return Ok(None);
    }
    Ok(Some(src.split_to(LEN_PREFIX + len)))
}

/// Encode a request frame into `dst`.
pub fn encode_request(
    correlation_id: i32,
    client_id: Option<&str>,
    req: &Request,
    dst: &mut BytesMut,
) -> Result<()> {
    let body = match req {
        Request::ApiVersions => Vec::new(),
        Request::Metadata(m) => encode_body(m)?,
        Request::Produce(p) => encode_body(p)?,
        Request::Fetch(f) => encode_body(f)?,
        Request::ListOffsets(l) => encode_body(l)?,
        Request::OffsetCommit(c) => encode_body(c)?,
        Request::OffsetFetch(o) => encode_body(o)?,
    };
    let client_id = client_id.map(str::as_bytes);
    let id_len = client_id.map(|b| b.len()).unwrap_or(0);
    if id_len > i16::MAX as usize {
        return Err(ClientError::Serialization("client id too long".into()));
    }
    let mut header = BytesMut::with_capacity(REQUEST_HEADER_LEN + id_len);
    header.put_i16(req.api_key());
    header.put_i16(API_VERSION);
    header.put_i32(correlation_id);
    match client_id {
        Some(id) => {
            header.put_i16(id.len() as i16);
            header.extend_from_slice(id);
        }
        None => header.put_i16(-1),
    }
    write_frame(dst, &header, &body)
}

/// Decode one complete request frame.
pub fn decode_request(frame: &[u8]) -> Result<RequestFrame> {
    let mut payload = frame_payload(frame)?;
    if payload.len() < REQUEST_HEADER_LEN {
        return Err(ClientError::MalformedFrame("short request header".into()));
    }
    let api_key = payload.get_i16();
    let api_version = payload.get_i16();
    let correlation_id = payload.get_i32();
    let client_id_len = payload.get_i16();
    let client_id = if client_id_len < 0 {
        None
    } else {
        let n = client_id_len as usize;
        if payload.len() < n {
            return Err(ClientError::MalformedFrame(format!(
                "client_id length {} exceeds remaining {}",
                n,
                payload.len()
            )));
        }
        let id = String::from_utf8(payload[..n].to_vec())
            .map_err(|_| ClientError::MalformedFrame("client_id is not utf-8".into()))?;
        payload.advance(n);
        Some(id)
    };
    let body = payload;
    let request = match api_key {
        API_API_VERSIONS => {
            if !body.is_empty() {
                return Err(ClientError::MalformedFrame(
                    "api_versions request carries a body".into(),
                ));
            }
            Request::ApiVersions
        }
        API_METADATA => Request::Metadata(decode_body(body)?),
        API_PRODUCE => Request::Produce(decode_body(body)?),
        API_FETCH => Request::Fetch(decode_body(body)?),
        API_LIST_OFFSETS => Request::ListOffsets(decode_body(body)?),
        API_OFFSET_COMMIT => Request::OffsetCommit(decode_body(body)?),
        API_OFFSET_FETCH => Request::OffsetFetch(decode_body(body)?),
        other => {
            return Err(ClientError::MalformedFrame(format!(
                "unknown request api_key {}",
                other
            )))
        }
    };
    Ok(RequestFrame {
        header: RequestHeader {
            api_key,
            api_version,
            correlation_id,
            client_id,
        },
        request,
    })
}

/// Encode a response frame into `dst`.
pub fn encode_response(correlation_id: i32, resp: &Response, dst: &mut BytesMut) -> Result<()> {
    let body = match resp {
        Response::ApiVersions(v) => encode_body(v)?,
        Response::Metadata(m) => encode_body(m)?,
        Response::Produce(p) => encode_body(p)?,
        Response::Fetch(f) => encode_body(f)?,
        Response::ListOffsets(l) => encode_body(l)?,
        Response::OffsetCommit(c) => encode_body(c)?,
        Response::OffsetFetch(o) => encode_body(o)?,
        Response::Error(e) => encode_body(e)?,
    };
    let mut header = BytesMut::with_capacity(RESPONSE_HEADER_LEN);
    header.put_i32(correlation_id);
    header.put_i16(resp.api_key());
    write_frame(dst, &header, &body)
}

/// Decode one complete response frame.
pub fn decode_response(frame: &[u8]) -> Result<ResponseFrame> {
    let mut payload = frame_payload(frame)?;
    if payload.len() < RESPONSE_HEADER_LEN {
        return Err(ClientError::MalformedFrame("short response header".into()));
    }
    let correlation_id = payload.get_i32();
    let api_key = payload.get_i16();
    let body = payload;
    let response = match api_key {
        API_API_VERSIONS => Response::ApiVersions(decode_body(body)?),
        API_METADATA => Response::Metadata(decode_body(body)?),
        API_PRODUCE => Response::Produce(decode_body(body)?),
        API_FETCH => Response::Fetch(decode_body(body)?),
        API_LIST_OFFSETS => Response::ListOffsets(decode_body(body)?),
        API_OFFSET_COMMIT => Response::OffsetCommit(decode_body(body)?),
        API_OFFSET_FETCH => Response::OffsetFetch(decode_body(body)?),
        API_ERROR => Response::Error(decode_body(body)?),
        other => {
            return Err(ClientError::MalformedFrame(format!(
                "unknown response api_key {}",
                other
            )))
        }
    };
    Ok(ResponseFrame {
        correlation_id,
        response,
    })
}
