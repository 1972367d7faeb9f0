//! Byte-level handling of the STUN FINGERPRINT attribute.
//!
//! FINGERPRINT must be the last attribute of a message and covers all bytes
//! that precede it, with the header's length field already adjusted to
//! include the attribute itself. The value is `crc32(prefix) ^ 0x5354554E`.
//!
//! We handle the attribute outside of the STUN codec so that
//! MESSAGE-INTEGRITY verification operates on the fingerprint-free message:
//! outbound messages get the attribute appended after encoding, inbound
//! messages get it verified and stripped before decoding.

const FINGERPRINT_TYPE: u16 = 0x8028;
const FINGERPRINT_XOR: u32 = 0x5354_554E;
const ATTR_LEN: usize = 8; // 4 bytes TLV header + 4 bytes CRC.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("message too short to carry a STUN header")]
    TooShort,
    #[error("fingerprint mismatch: computed {computed:#010x}, found {found:#010x}")]
    Mismatch { computed: u32, found: u32 },
}

/// Appends a FINGERPRINT attribute to an encoded STUN message.
///
/// Requests and responses carry a fingerprint; indications do not.
pub fn append_fingerprint(mut message: Vec<u8>) -> Vec<u8> {
    debug_assert!(message.len() >= 20, "not a STUN message");

    let new_length = (message.len() - 20 + ATTR_LEN) as u16;
    message[2..4].copy_from_slice(&new_length.to_be_bytes());

    let crc = crc32(&message) ^ FINGERPRINT_XOR;

    message.extend_from_slice(&FINGERPRINT_TYPE.to_be_bytes());
    message.extend_from_slice(&4u16.to_be_bytes());
    message.extend_from_slice(&crc.to_be_bytes());

    message
}

/// Verifies and removes a trailing FINGERPRINT attribute, if present.
///
/// Returns the fingerprint-free message (header length restored) so it can
/// be fed to the STUN decoder. Messages without a fingerprint are returned
/// unchanged.
pub fn strip_fingerprint(message: &[u8]) -> Result<Vec<u8>, FingerprintError> {
    if message.len() < 20 {
        return Err(FingerprintError::TooShort);
    }

    if message.len() < 20 + ATTR_LEN || !has_trailing_fingerprint(message) {
        return Ok(message.to_vec());
    }

    let prefix_len = message.len() - ATTR_LEN;
    let found = u32::from_be_bytes(
        message[message.len() - 4..]
            .try_into()
            .expect("slice is 4 bytes"),
    );

    // The CRC was computed with the length field covering the attribute.
    let computed = crc32(&message[..prefix_len]) ^ FINGERPRINT_XOR;

    if computed != found {
        return Err(FingerprintError::Mismatch { computed, found });
    }

    let mut stripped = message[..prefix_len].to_vec();
    let restored_length = (prefix_len - 20) as u16;
    stripped[2..4].copy_from_slice(&restored_length.to_be_bytes());

    Ok(stripped)
}

fn has_trailing_fingerprint(message: &[u8]) -> bool {
    let attr_start = message.len() - ATTR_LEN;

    message[attr_start..attr_start + 2] == FINGERPRINT_TYPE.to_be_bytes()
        && message[attr_start + 2..attr_start + 4] == 4u16.to_be_bytes()
}

/// CRC-32/ISO-HDLC, the variant STUN mandates.
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;

    for byte in bytes {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }

    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Vec<u8> {
        // Binding request with a 4-byte dummy attribute.
        let mut m = vec![0x00, 0x01, 0x00, 0x08, 0x21, 0x12, 0xA4, 0x42];
        m.extend_from_slice(&[0xAB; 12]); // transaction id
        m.extend_from_slice(&[0x80, 0x22, 0x00, 0x02, b'h', b'i', 0, 0]);
        m
    }

    #[test]
    fn crc32_check_value() {
        // Standard check input for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn round_trip() {
        let original = sample_message();

        let fingerprinted = append_fingerprint(original.clone());
        assert_eq!(fingerprinted.len(), original.len() + 8);

        let stripped = strip_fingerprint(&fingerprinted).unwrap();
        assert_eq!(stripped, original);
    }

    #[test]
    fn message_without_fingerprint_passes_through() {
        let original = sample_message();

        assert_eq!(strip_fingerprint(&original).unwrap(), original);
    }

    #[test]
    fn detects_any_single_bit_flip() {
        let fingerprinted = append_fingerprint(sample_message());

        for bit in 0..fingerprinted.len() * 8 {
            let mut tampered = fingerprinted.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);

            // Flipping a bit either breaks the CRC or destroys the
            // fingerprint TLV framing; both must prevent a clean strip.
            match strip_fingerprint(&tampered) {
                Ok(stripped) => assert_ne!(
                    stripped[..],
                    fingerprinted[..fingerprinted.len() - 8],
                    "bit {bit} went undetected"
                ),
                Err(_) => {}
            }
        }
    }
}
