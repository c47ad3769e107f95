//! CBOR encoding of messages and length-prefixed framing.
//!
//! On a byte stream every frame is a 4-byte big-endian length followed by
//! one CBOR-encoded [`SyncMessage`]. Message channels carry the CBOR body
//! alone.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::SyncMessage;

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Encodes a message body.
pub fn encode_message(message: &SyncMessage) -> ProtocolResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(message, &mut body)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(body)
}

/// Decodes a message body.
pub fn decode_message(body: &[u8]) -> ProtocolResult<SyncMessage> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    ciborium::from_reader(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Prepends the length header to an encoded body.
pub fn frame(body: &[u8]) -> ProtocolResult<Vec<u8>> {
    let len = check_len(body.len())?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Validates a length read from a frame header.
pub fn frame_len(header: [u8; FRAME_HEADER_SIZE]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;
    Ok(len)
}

fn check_len(len: usize) -> ProtocolResult<u32> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        size: len,
        max: MAX_FRAME_SIZE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChangeBatch, Close, SyncRequest};
    use proptest::prelude::*;
    use tidesync_core::{ChangeRecord, ObjectKey};
    use uuid::Uuid;

    fn record(id: &str, seq: u64) -> ChangeRecord {
        ChangeRecord {
            key: ObjectKey::new("Note", id),
            version: 3,
            origin: Uuid::from_u128(7),
            deleted: false,
            payload: vec![0xa1, 0x61, 0x78, 0x01],
            seq,
        }
    }

    #[test]
    fn change_batch_survives_encoding() {
        let message = SyncMessage::ChangeBatch(ChangeBatch {
            request_id: 4,
            records: vec![record("1", 10), record("2", 11)],
            last_seq: 11,
            complete: true,
        });
        let body = encode_message(&message).unwrap();
        assert_eq!(decode_message(&body).unwrap(), message);
    }

    #[test]
    fn framing_prefixes_big_endian_length() {
        let body = encode_message(&SyncMessage::SyncRequest(SyncRequest {
            request_id: 1,
            since: None,
        }))
        .unwrap();
        let framed = frame(&body).unwrap();
        let header: [u8; 4] = framed[..4].try_into().unwrap();
        assert_eq!(frame_len(header).unwrap(), body.len());
        assert_eq!(&framed[4..], body.as_slice());
    }

    #[test]
    fn oversized_header_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(
            frame_len(header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_message(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn type_codes_are_distinct() {
        let close = SyncMessage::Close(Close {
            reason: "bye".into(),
            authentication: false,
        });
        let request = SyncMessage::SyncRequest(SyncRequest {
            request_id: 0,
            since: Some(1),
        });
        assert_ne!(close.type_code(), request.type_code());
        assert_eq!(close.kind(), "close");
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_message(&bytes);
        }
    }
}
