//! Chunk integrity: SHA-256 checksum computed by the sender, verified by the receiver.

use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

/// Checksum of a chunk payload (32-byte SHA-256 digest).
pub fn checksum(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

/// Verify a received payload against the checksum the sender attached.
pub fn verify(payload: &[u8], expected: &[u8; 32]) -> Result<(), ProtocolError> {
    if checksum(payload) == *expected {
        Ok(())
    } else {
        Err(ProtocolError::ChecksumMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_payload_verifies() {
        let payload = b"quarterly-report.pdf bytes";
        let sum = checksum(payload);
        assert!(verify(payload, &sum).is_ok());
    }

    #[test]
    fn tampered_payload_rejected() {
        let sum = checksum(b"original");
        assert!(matches!(
            verify(b"tampered", &sum),
            Err(ProtocolError::ChecksumMismatch)
        ));
    }

    #[test]
    fn known_digest_of_empty_input() {
        let sum = checksum(b"");
        assert_eq!(sum[0], 0xe3);
        assert_eq!(sum[31], 0x55);
    }
}
