//! Framing for streams (length-prefix, 4 bytes LE + bincode) and discovery datagrams
//! (magic header + bincode).

use crate::protocol::{Announcement, Frame};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Magic bytes identifying a LanChat discovery datagram.
pub const MAGIC: &[u8; 4] = b"LNCH";

/// Maximum size of one discovery datagram.
pub const MAX_DATAGRAM_LEN: usize = 1400;

/// Encode a frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a frame or datagram (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns NeedMore if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame: Frame =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((frame, LEN_SIZE + len))
}

/// Read the payload length from a frame header. Used by stream readers to size the body read.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameDecodeError> {
    if header.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Size of the length prefix in bytes.
pub const fn header_len() -> usize {
    LEN_SIZE
}

/// Error decoding a frame or datagram.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("bad magic header")]
    BadMagic,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Encode an announcement into a single datagram: magic + bincode.
pub fn encode_datagram(announcement: &Announcement) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(announcement)?;
    if MAGIC.len() + body.len() > MAX_DATAGRAM_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(MAGIC.len() + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a discovery datagram, checking the magic header first.
pub fn decode_datagram(bytes: &[u8]) -> Result<Announcement, FrameDecodeError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    match bytes.strip_prefix(MAGIC.as_slice()) {
        Some(body) => Ok(bincode::deserialize(body)?),
        None => Err(FrameDecodeError::BadMagic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageId, TransferId, PROTOCOL_VERSION};

    fn sample_text() -> Frame {
        Frame::Text {
            message_id: MessageId::new(),
            body: "hello there".into(),
            sent_at: 1_700_000_000_000,
        }
    }

    fn sample_announcement() -> Announcement {
        Announcement {
            protocol_version: PROTOCOL_VERSION,
            display_name: "Alice".into(),
            device_label: "Laptop".into(),
            address: "192.168.1.20:45681".parse().unwrap(),
            platform_tag: "linux-x86_64".into(),
            session_start: 1_700_000_000_000,
            sequence_number: 7,
            sent_at: 1_700_000_035_000,
        }
    }

    #[test]
    fn text_frame_survives_encoding() {
        let msg = sample_text();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        match (&msg, &decoded) {
            (
                Frame::Text {
                    message_id: a,
                    body: b1,
                    ..
                },
                Frame::Text {
                    message_id: b,
                    body: b2,
                    ..
                },
            ) => {
                assert_eq!(a, b);
                assert_eq!(b1, b2);
            }
            _ => panic!("expected Text"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_text()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(&header), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn back_to_back_frames() {
        let a = sample_text();
        let b = Frame::ChunkAck {
            transfer_id: TransferId::new(),
            sequence: 3,
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Frame::Text { .. }));
        assert!(matches!(m2, Frame::ChunkAck { sequence: 3, .. }));
    }

    #[test]
    fn datagram_carries_announcement() {
        let ann = sample_announcement();
        let bytes = encode_datagram(&ann).unwrap();
        assert!(bytes.starts_with(MAGIC));
        assert!(bytes.len() <= MAX_DATAGRAM_LEN);
        assert_eq!(decode_datagram(&bytes).unwrap(), ann);
    }

    #[test]
    fn datagram_without_magic_rejected() {
        let mut bytes = encode_datagram(&sample_announcement()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode_datagram(&bytes),
            Err(FrameDecodeError::BadMagic)
        ));
    }

    #[test]
    fn truncated_datagram_rejected() {
        let bytes = encode_datagram(&sample_announcement()).unwrap();
        assert!(matches!(
            decode_datagram(&bytes[..bytes.len() / 2]),
            Err(FrameDecodeError::Decode(_))
        ));
    }
}
