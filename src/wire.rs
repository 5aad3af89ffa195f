//! Binary wire protocol between front-end workers and the engine.
//!
//! Every message is framed with a 4-byte big-endian length followed by the
//! payload. A request payload is, in order: a 1-byte class tag length and the
//! tag bytes, a 4-byte big-endian amount, a 2-byte big-endian holder length
//! and the holder bytes. A reply payload is a status byte, followed by an
//! 8-byte big-endian certificate number when the status is ok.
//!
//! Frame lengths are validated before any allocation, and both decoders
//! reject payloads that underrun or overrun their declared fields. Such
//! structural errors terminate the connection; semantic rejections travel
//! back as status codes instead.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::engine::GrantError;
use crate::model::{CertificateNumber, GrantRequest, MAX_CLASS_TAG_LEN, MAX_HOLDER_LEN};

/// Bytes in the frame header (big-endian payload length).
const HEADER_LEN: usize = 4;

/// Largest legal request payload: class tag and holder at their wire bounds.
pub const MAX_REQUEST_PAYLOAD_LEN: usize = 1 + MAX_CLASS_TAG_LEN + 4 + 2 + MAX_HOLDER_LEN;

/// Largest legal reply payload: status byte plus certificate number.
pub const MAX_REPLY_PAYLOAD_LEN: usize = 1 + 8;

const STATUS_OK: u8 = 0x00;

/// Reason byte carried by an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    UnknownClass,
    InvalidAmount,
    InsufficientShares,
    Malformed,
    /// Journal failure while the request was in flight; the engine is going
    /// down and the request was not committed.
    EngineFault,
}

impl Denial {
    pub const fn code(self) -> u8 {
        match self {
            Denial::UnknownClass => 0x01,
            Denial::InvalidAmount => 0x02,
            Denial::InsufficientShares => 0x03,
            Denial::Malformed => 0x04,
            Denial::EngineFault => 0x05,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Denial::UnknownClass),
            0x02 => Some(Denial::InvalidAmount),
            0x03 => Some(Denial::InsufficientShares),
            0x04 => Some(Denial::Malformed),
            0x05 => Some(Denial::EngineFault),
            _ => None,
        }
    }

    /// Stable reason name used in HTTP error bodies and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Denial::UnknownClass => "UNKNOWN_CLASS",
            Denial::InvalidAmount => "INVALID_AMOUNT",
            Denial::InsufficientShares => "INSUFFICIENT_SHARES",
            Denial::Malformed => "MALFORMED",
            Denial::EngineFault => "ENGINE_FAULT",
        }
    }
}

impl From<&GrantError> for Denial {
    fn from(err: &GrantError) -> Self {
        match err {
            GrantError::UnknownClass(_) => Denial::UnknownClass,
            GrantError::InvalidAmount(_) => Denial::InvalidAmount,
            GrantError::InsufficientShares { .. } => Denial::InsufficientShares,
            GrantError::MalformedHolder => Denial::Malformed,
        }
    }
}

/// Engine's answer to one grant request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantReply {
    Granted(CertificateNumber),
    Denied(Denial),
}

/// Framing or payload errors. On the engine side any of these is fatal to
/// the connection that produced it.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    #[error("payload truncated mid-field")]
    TruncatedPayload,

    #[error("payload has {0} bytes past the last field")]
    TrailingBytes(usize),

    #[error("payload field is not valid utf-8")]
    InvalidUtf8,

    #[error("unknown reply status {0:#04x}")]
    UnknownStatus(u8),

    #[error("{field} is {len} bytes, over the {max} byte wire bound")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
}

/// Server-side codec: decodes requests, encodes replies.
#[derive(Debug, Default)]
pub struct EngineCodec;

/// Client-side codec: encodes requests, decodes replies.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Decoder for EngineCodec {
    type Item = GrantRequest;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<GrantRequest>, WireError> {
        match decode_frame(src, MAX_REQUEST_PAYLOAD_LEN)? {
            None => Ok(None),
            Some(payload) => decode_request(payload).map(Some),
        }
    }
}

impl Encoder<GrantReply> for EngineCodec {
    type Error = WireError;

    fn encode(&mut self, reply: GrantReply, dst: &mut BytesMut) -> Result<(), WireError> {
        encode_reply(reply, dst);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = GrantReply;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<GrantReply>, WireError> {
        match decode_frame(src, MAX_REPLY_PAYLOAD_LEN)? {
            None => Ok(None),
            Some(payload) => decode_reply(payload).map(Some),
        }
    }
}

impl<'a> Encoder<&'a GrantRequest> for ClientCodec {
    type Error = WireError;

    fn encode(&mut self, request: &'a GrantRequest, dst: &mut BytesMut) -> Result<(), WireError> {
        encode_request(request, dst)
    }
}

/// Split one length-prefixed frame off `src`, validating the length against
/// `max` before reserving or allocating anything.
fn decode_frame(src: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, WireError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if length > max {
        return Err(WireError::FrameTooLarge { length, max });
    }
    let total = HEADER_LEN + length;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    src.advance(HEADER_LEN);
    Ok(Some(src.split_to(length)))
}

fn encode_request(request: &GrantRequest, dst: &mut BytesMut) -> Result<(), WireError> {
    if request.class.len() > MAX_CLASS_TAG_LEN {
        return Err(WireError::FieldTooLong {
            field: "class tag",
            len: request.class.len(),
            max: MAX_CLASS_TAG_LEN,
        });
    }
    if request.holder.len() > MAX_HOLDER_LEN {
        return Err(WireError::FieldTooLong {
            field: "holder name",
            len: request.holder.len(),
            max: MAX_HOLDER_LEN,
        });
    }

    let payload_len = 1 + request.class.len() + 4 + 2 + request.holder.len();
    dst.reserve(HEADER_LEN + payload_len);
    dst.put_u32(payload_len as u32);
    dst.put_u8(request.class.len() as u8);
    dst.put_slice(request.class.as_bytes());
    dst.put_u32(request.amount);
    dst.put_u16(request.holder.len() as u16);
    dst.put_slice(request.holder.as_bytes());
    Ok(())
}

fn decode_request(mut payload: BytesMut) -> Result<GrantRequest, WireError> {
    if payload.remaining() < 1 {
        return Err(WireError::TruncatedPayload);
    }
    let class_len = payload.get_u8() as usize;
    if payload.remaining() < class_len + 4 + 2 {
        return Err(WireError::TruncatedPayload);
    }
    let class = take_utf8(&mut payload, class_len)?;
    let amount = payload.get_u32();
    let holder_len = payload.get_u16() as usize;
    if payload.remaining() < holder_len {
        return Err(WireError::TruncatedPayload);
    }
    let holder = take_utf8(&mut payload, holder_len)?;
    if payload.has_remaining() {
        return Err(WireError::TrailingBytes(payload.remaining()));
    }
    Ok(GrantRequest {
        class,
        holder,
        amount,
    })
}

fn encode_reply(reply: GrantReply, dst: &mut BytesMut) {
    match reply {
        GrantReply::Granted(number) => {
            dst.reserve(HEADER_LEN + 9);
            dst.put_u32(9);
            dst.put_u8(STATUS_OK);
            dst.put_u64(number);
        }
        GrantReply::Denied(denial) => {
            dst.reserve(HEADER_LEN + 1);
            dst.put_u32(1);
            dst.put_u8(denial.code());
        }
    }
}

fn decode_reply(mut payload: BytesMut) -> Result<GrantReply, WireError> {
    if payload.remaining() < 1 {
        return Err(WireError::TruncatedPayload);
    }
    let status = payload.get_u8();
    if status == STATUS_OK {
        if payload.remaining() < 8 {
            return Err(WireError::TruncatedPayload);
        }
        let number = payload.get_u64();
        if payload.has_remaining() {
            return Err(WireError::TrailingBytes(payload.remaining()));
        }
        return Ok(GrantReply::Granted(number));
    }
    let denial = Denial::from_code(status).ok_or(WireError::UnknownStatus(status))?;
    if payload.has_remaining() {
        return Err(WireError::TrailingBytes(payload.remaining()));
    }
    Ok(GrantReply::Denied(denial))
}

fn take_utf8(buf: &mut BytesMut, len: usize) -> Result<String, WireError> {
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(class: &str, amount: u32, holder: &str) -> GrantRequest {
        GrantRequest {
            class: class.to_string(),
            holder: holder.to_string(),
            amount,
        }
    }

    // Interop vectors: exact bytes other implementations must produce.

    #[test]
    fn request_interop_vector() {
        let mut buf = BytesMut::new();
        ClientCodec
            .encode(&request("CS", 10, "Salt Bae"), &mut buf)
            .unwrap();

        #[rustfmt::skip]
        let expected: &[u8] = &[
            0x00, 0x00, 0x00, 0x11,             // frame length 17
            0x02, b'C', b'S',                   // class tag
            0x00, 0x00, 0x00, 0x0a,             // amount 10
            0x00, 0x08,                         // holder length 8
            b'S', b'a', b'l', b't', b' ', b'B', b'a', b'e',
        ];
        assert_eq!(&buf[..], expected);
    }

    #[test]
    fn reply_interop_vectors() {
        let mut ok = BytesMut::new();
        EngineCodec.encode(GrantReply::Granted(32), &mut ok).unwrap();
        #[rustfmt::skip]
        let expected_ok: &[u8] = &[
            0x00, 0x00, 0x00, 0x09,
            0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20,
        ];
        assert_eq!(&ok[..], expected_ok);

        let mut denied = BytesMut::new();
        EngineCodec
            .encode(GrantReply::Denied(Denial::InsufficientShares), &mut denied)
            .unwrap();
        assert_eq!(&denied[..], &[0x00, 0x00, 0x00, 0x01, 0x03]);
    }

    #[test]
    fn request_round_trips_through_both_codecs() {
        let original = request("PS", 1_000_000, "Bob Jr, Esq.");
        let mut buf = BytesMut::new();
        ClientCodec.encode(&original, &mut buf).unwrap();

        let decoded = EngineCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn reply_round_trips_through_both_codecs() {
        for reply in [
            GrantReply::Granted(1),
            GrantReply::Granted(u64::MAX),
            GrantReply::Denied(Denial::UnknownClass),
            GrantReply::Denied(Denial::EngineFault),
        ] {
            let mut buf = BytesMut::new();
            EngineCodec.encode(reply, &mut buf).unwrap();
            assert_eq!(ClientCodec.decode(&mut buf).unwrap().unwrap(), reply);
        }
    }

    #[test]
    fn decoder_waits_for_a_complete_frame() {
        let mut full = BytesMut::new();
        ClientCodec.encode(&request("CS", 7, "Alice"), &mut full).unwrap();

        let mut codec = EngineCodec;
        let mut src = BytesMut::new();
        for chunk in full.chunks(3) {
            // Nothing decodes until the last chunk lands.
            assert!(codec.decode(&mut src).unwrap().is_none());
            src.extend_from_slice(chunk);
        }
        let decoded = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(decoded.holder, "Alice");
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut src = BytesMut::new();
        ClientCodec.encode(&request("CS", 1, "a"), &mut src).unwrap();
        ClientCodec.encode(&request("PS", 2, "b"), &mut src).unwrap();

        let mut codec = EngineCodec;
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().class, "CS");
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().class, "PS");
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let mut src = BytesMut::new();
        src.put_u32((MAX_REQUEST_PAYLOAD_LEN + 1) as u32);
        assert!(matches!(
            EngineCodec.decode(&mut src),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn trailing_payload_bytes_are_rejected() {
        let mut src = BytesMut::new();
        src.put_u32(11);
        src.put_u8(2);
        src.put_slice(b"CS");
        src.put_u32(5);
        src.put_u16(0);
        src.put_slice(b"xx"); // two bytes past the declared holder
        assert!(matches!(
            EngineCodec.decode(&mut src),
            Err(WireError::TrailingBytes(2))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut src = BytesMut::new();
        src.put_u32(3);
        src.put_u8(200); // class length claims 200 bytes, frame has 2
        src.put_slice(b"CS");
        assert!(matches!(
            EngineCodec.decode(&mut src),
            Err(WireError::TruncatedPayload)
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut src = BytesMut::new();
        src.put_u32(9);
        src.put_u8(2);
        src.put_slice(&[0xff, 0xfe]);
        src.put_u32(5);
        src.put_u16(0);
        assert!(matches!(
            EngineCodec.decode(&mut src),
            Err(WireError::InvalidUtf8)
        ));
    }

    #[test]
    fn unknown_reply_status_is_rejected() {
        let mut src = BytesMut::new();
        src.put_u32(1);
        src.put_u8(0x7f);
        assert!(matches!(
            ClientCodec.decode(&mut src),
            Err(WireError::UnknownStatus(0x7f))
        ));
    }

    #[test]
    fn encode_rejects_fields_over_wire_bounds() {
        let mut buf = BytesMut::new();
        let long_class = request(&"C".repeat(MAX_CLASS_TAG_LEN + 1), 1, "a");
        assert!(matches!(
            ClientCodec.encode(&long_class, &mut buf),
            Err(WireError::FieldTooLong { field: "class tag", .. })
        ));

        let long_holder = request("CS", 1, &"h".repeat(MAX_HOLDER_LEN + 1));
        assert!(matches!(
            ClientCodec.encode(&long_holder, &mut buf),
            Err(WireError::FieldTooLong { field: "holder name", .. })
        ));
    }

    #[test]
    fn denial_codes_round_trip() {
        for denial in [
            Denial::UnknownClass,
            Denial::InvalidAmount,
            Denial::InsufficientShares,
            Denial::Malformed,
            Denial::EngineFault,
        ] {
            assert_eq!(Denial::from_code(denial.code()), Some(denial));
        }
        assert_eq!(Denial::from_code(0x00), None);
        assert_eq!(Denial::from_code(0x06), None);
    }
}
