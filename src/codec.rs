//! The record codec: bytes to [`Record`]s and back.
//!
//! The decoder accepts arbitrarily fragmented input (a record may arrive one
//! byte at a time, or several records back-to-back in one chunk) and yields
//! one typed record per complete frame. The encoder writes fixed 8-byte
//! headers, pads every frame out to a configurable alignment, and splits
//! over-long stream payloads across as many frames as needed.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BufMut, BytesMut};
use log::debug;
use num_traits::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::protocol::{
    ProtocolStatus, RecordType, Role, DEFAULT_PADDING_FIT, FASTCGI_VERSION, HEADER_LEN,
    MAX_CONTENT_LEN,
};
use crate::record::{BeginRequest, EndRequest, Record, RecordBody};

/// Codec for one transport connection. One decoder instance per connection;
/// its buffer state is owned by the surrounding `Framed`.
#[derive(Debug, Clone)]
pub struct FastcgiCodec {
    padding_fit: u8,
}

impl Default for FastcgiCodec {
    fn default() -> FastcgiCodec {
        FastcgiCodec {
            padding_fit: DEFAULT_PADDING_FIT,
        }
    }
}

impl FastcgiCodec {
    pub fn new() -> FastcgiCodec {
        FastcgiCodec::default()
    }

    /// Encoded frames are padded so header+content+padding is a multiple of
    /// `fit`. Zero is rejected here, not at encode time.
    pub fn with_padding_fit(fit: u8) -> Result<FastcgiCodec, Error> {
        if fit == 0 {
            return Err(Error::InvalidPaddingFit(fit));
        }
        Ok(FastcgiCodec { padding_fit: fit })
    }

    pub fn padding_fit(&self) -> u8 {
        self.padding_fit
    }

    fn write_frame(&self, dst: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
        debug_assert!(content.len() <= MAX_CONTENT_LEN);
        let fit = self.padding_fit as usize;
        let padding = (fit - content.len() % fit) % fit;
        dst.reserve(HEADER_LEN + content.len() + padding);
        dst.put_u8(FASTCGI_VERSION);
        dst.put_u8(record_type as u8);
        dst.put_u16(request_id);
        dst.put_u16(content.len() as u16);
        dst.put_u8(padding as u8);
        dst.put_u8(0); // reserved
        dst.put_slice(content);
        dst.put_bytes(0, padding);
    }
}

fn read_len(buf: &mut BytesMut) -> Option<usize> {
    let first = *buf.first()?;
    if first < 0x80 {
        buf.advance(1);
        Some(first as usize)
    } else if buf.len() < 4 {
        None
    } else {
        let len = NetworkEndian::read_u32(&buf[..4]) as usize & 0x7fff_ffff;
        buf.advance(4);
        Some(len)
    }
}

fn write_len(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        debug_assert!(len < 0x8000_0000);
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

fn read_pairs(buf: &mut BytesMut, record_type: RecordType) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let name_len = read_len(buf).ok_or(Error::Truncated(record_type))?;
        let value_len = read_len(buf).ok_or(Error::Truncated(record_type))?;
        if buf.len() < name_len + value_len {
            return Err(Error::Truncated(record_type));
        }
        let name = buf.split_to(name_len);
        let value = buf.split_to(value_len);
        pairs.push((
            String::from_utf8_lossy(&name).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        ));
    }
    Ok(pairs)
}

fn write_pairs<'a>(out: &mut BytesMut, pairs: impl Iterator<Item = (&'a str, &'a str)>) {
    for (name, value) in pairs {
        write_len(out, name.len());
        write_len(out, value.len());
        out.put_slice(name.as_bytes());
        out.put_slice(value.as_bytes());
    }
}

/// Encoded size of one name/value pair, including both length prefixes.
pub(crate) fn encoded_pair_len(name: &str, value: &str) -> usize {
    fn prefix(len: usize) -> usize {
        if len < 0x80 {
            1
        } else {
            4
        }
    }
    prefix(name.len()) + prefix(value.len()) + name.len() + value.len()
}

fn decode_body(record_type: RecordType, content: &mut BytesMut) -> Result<RecordBody, Error> {
    let body = match record_type {
        RecordType::BeginRequest => {
            if content.len() < 3 {
                return Err(Error::Truncated(record_type));
            }
            let role_code = NetworkEndian::read_u16(&content[0..2]);
            let role = Role::from_u16(role_code).ok_or(Error::UnknownRole(role_code))?;
            RecordBody::BeginRequest(BeginRequest {
                role,
                flags: content[2],
            })
        }
        RecordType::AbortRequest => RecordBody::AbortRequest,
        RecordType::EndRequest => {
            if content.len() < 5 {
                return Err(Error::Truncated(record_type));
            }
            let app_status = NetworkEndian::read_u32(&content[0..4]);
            let status_code = content[4];
            let protocol_status = ProtocolStatus::from_u8(status_code)
                .ok_or(Error::UnknownProtocolStatus(status_code))?;
            RecordBody::EndRequest(EndRequest {
                app_status,
                protocol_status,
            })
        }
        RecordType::Params => RecordBody::Params(read_pairs(content, record_type)?),
        RecordType::Stdin => RecordBody::Stdin(content.split().freeze()),
        RecordType::Stdout => RecordBody::Stdout(content.split().freeze()),
        RecordType::Stderr => RecordBody::Stderr(content.split().freeze()),
        RecordType::Data => RecordBody::Data(content.split().freeze()),
        RecordType::GetValues => {
            let pairs = read_pairs(content, record_type)?;
            RecordBody::GetValues(pairs.into_iter().map(|(name, _value)| name).collect())
        }
        RecordType::GetValuesResult => {
            RecordBody::GetValuesResult(read_pairs(content, record_type)?)
        }
        RecordType::UnknownType => {
            if content.is_empty() {
                return Err(Error::Truncated(record_type));
            }
            RecordBody::UnknownType(content[0])
        }
    };
    Ok(body)
}

fn encode_body(body: &RecordBody) -> BytesMut {
    let mut out = BytesMut::new();
    match body {
        RecordBody::BeginRequest(begin) => {
            out.put_u16(begin.role as u16);
            out.put_u8(begin.flags);
            out.put_bytes(0, 5);
        }
        RecordBody::AbortRequest => {}
        RecordBody::EndRequest(end) => {
            out.put_u32(end.app_status);
            out.put_u8(end.protocol_status as u8);
            out.put_bytes(0, 3);
        }
        RecordBody::Params(pairs) => {
            write_pairs(&mut out, pairs.iter().map(|(n, v)| (n.as_str(), v.as_str())));
        }
        RecordBody::GetValues(keys) => {
            write_pairs(&mut out, keys.iter().map(|k| (k.as_str(), "")));
        }
        RecordBody::GetValuesResult(values) => {
            write_pairs(&mut out, values.iter().map(|(n, v)| (n.as_str(), v.as_str())));
        }
        RecordBody::UnknownType(code) => {
            out.put_u8(*code);
            out.put_bytes(0, 7);
        }
        RecordBody::Stdin(_)
        | RecordBody::Stdout(_)
        | RecordBody::Stderr(_)
        | RecordBody::Data(_) => unreachable!("stream bodies are framed directly by encode"),
    }
    out
}

impl Decoder for FastcgiCodec {
    type Item = Record;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, Error> {
        if buf.len() < HEADER_LEN {
            buf.reserve(HEADER_LEN - buf.len());
            return Ok(None);
        }

        // Peek the header; nothing is consumed until the whole frame is here.
        let version = buf[0];
        if version != FASTCGI_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let type_code = buf[1];
        let record_type =
            RecordType::from_u8(type_code).ok_or(Error::UnknownRecordType(type_code))?;
        let request_id = NetworkEndian::read_u16(&buf[2..4]);
        let content_len = NetworkEndian::read_u16(&buf[4..6]) as usize;
        let padding_len = buf[6] as usize;

        let frame_len = HEADER_LEN + content_len + padding_len;
        if buf.len() < frame_len {
            debug!("insufficient buffer for {:?} frame ({}/{} bytes)", record_type, buf.len(), frame_len);
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let mut content = buf.split_to(content_len);
        buf.advance(padding_len);

        debug!(
            "request id {}, {:?}, {} bytes of content",
            request_id, record_type, content_len
        );

        let body = decode_body(record_type, &mut content)?;
        Ok(Some(Record { request_id, body }))
    }
}

impl Encoder<Record> for FastcgiCodec {
    type Error = Error;

    fn encode(&mut self, record: Record, dst: &mut BytesMut) -> Result<(), Error> {
        let record_type = record.record_type();
        let Record { request_id, body } = record;
        match body {
            RecordBody::Stdin(data)
            | RecordBody::Stdout(data)
            | RecordBody::Stderr(data)
            | RecordBody::Data(data) => {
                // Split over-long payloads; an empty payload still produces
                // one zero-content frame (the end-of-stream marker).
                let mut rest = &data[..];
                loop {
                    let take = rest.len().min(MAX_CONTENT_LEN);
                    let (chunk, tail) = rest.split_at(take);
                    self.write_frame(dst, record_type, request_id, chunk);
                    rest = tail;
                    if rest.is_empty() {
                        break;
                    }
                }
            }
            body => {
                let content = encode_body(&body);
                if content.len() > MAX_CONTENT_LEN {
                    return Err(Error::Oversize(content.len()));
                }
                self.write_frame(dst, record_type, request_id, &content);
            }
        }
        Ok(())
    }
}
