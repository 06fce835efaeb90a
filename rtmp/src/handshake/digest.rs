//! The digest flavored handshake used by clients that stream h.264.
//!
//! C1 and S1 hide a 32 byte HMAC-SHA-256 digest at an offset derived from
//! four bytes of the packet itself.  Two offset schemes exist in the wild;
//! the validator probes both.

use super::errors::HandshakeError;
use ring::hmac;

pub const PACKET_SIZE: usize = 1536;
pub const DIGEST_SIZE: usize = 32;

// "Genuine Adobe Flash Player 001" + shared suffix
pub const FP_KEY: [u8; 62] = [
    0x47, 0x65, 0x6E, 0x75, 0x69, 0x6E, 0x65, 0x20, 0x41, 0x64, 0x6F, 0x62, 0x65, 0x20, 0x46,
    0x6C, 0x61, 0x73, 0x68, 0x20, 0x50, 0x6C, 0x61, 0x79, 0x65, 0x72, 0x20, 0x30, 0x30, 0x31,
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E,
    0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB,
    0x31, 0xAE,
];

// "Genuine Adobe Flash Media Server 001" + shared suffix
pub const FMS_KEY: [u8; 68] = [
    0x47, 0x65, 0x6E, 0x75, 0x69, 0x6E, 0x65, 0x20, 0x41, 0x64, 0x6F, 0x62, 0x65, 0x20, 0x46,
    0x6C, 0x61, 0x73, 0x68, 0x20, 0x4D, 0x65, 0x64, 0x69, 0x61, 0x20, 0x53, 0x65, 0x72, 0x76,
    0x65, 0x72, 0x20, 0x30, 0x30, 0x31, 0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E,
    0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E, 0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB,
    0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB, 0x31, 0xAE,
];

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

/// Computes where the digest lives inside a C1/S1 packet.
///
/// The base offset is 12 (or 776 for the alternate scheme); the four bytes
/// just before it are summed modulo 728 and added on.
pub fn digest_offset(packet: &[u8], middle: bool) -> Result<usize, HandshakeError> {
    let mut offset = 8 + 4;
    if middle {
        offset += 764;
    }

    offset += (packet[offset - 4] as usize
        + packet[offset - 3] as usize
        + packet[offset - 2] as usize
        + packet[offset - 1] as usize)
        % 728;

    if offset + DIGEST_SIZE > PACKET_SIZE {
        return Err(HandshakeError::DigestOffsetOutOfRange { offset });
    }

    Ok(offset)
}

fn packet_without_digest(packet: &[u8], offset: usize) -> Vec<u8> {
    let mut stripped = Vec::with_capacity(PACKET_SIZE - DIGEST_SIZE);
    stripped.extend_from_slice(&packet[..offset]);
    stripped.extend_from_slice(&packet[offset + DIGEST_SIZE..]);
    stripped
}

fn validate_scheme(c1: &[u8], middle: bool) -> Option<Vec<u8>> {
    let offset = digest_offset(c1, middle).ok()?;
    let claimed = &c1[offset..offset + DIGEST_SIZE];
    let computed = hmac_sha256(&FP_KEY[..30], &packet_without_digest(c1, offset));

    if computed == claimed {
        Some(claimed.to_vec())
    } else {
        None
    }
}

/// Probes both digest schemes against C1, returning the embedded digest and
/// the scheme that matched.  `None` means neither scheme validated and the
/// peer should be served with the plain handshake instead.
pub fn validate_client(c1: &[u8]) -> Option<(Vec<u8>, bool)> {
    if let Some(digest) = validate_scheme(c1, true) {
        return Some((digest, true));
    }

    validate_scheme(c1, false).map(|digest| (digest, false))
}

/// Splices a server digest (keyed with the first 36 bytes of the FMS key)
/// into an S1 packet that already carries its time and random fields.
pub fn sign_s1(s1: &mut [u8], middle: bool) -> Result<(), HandshakeError> {
    let offset = digest_offset(s1, middle)?;
    let digest = hmac_sha256(&FMS_KEY[..36], &packet_without_digest(s1, offset));
    s1[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);
    Ok(())
}

/// Builds the S2 reply for a digest handshake: 1504 random bytes followed by
/// an HMAC over them, keyed with HMAC(FMS_KEY, c1_digest).
pub fn make_s2(c1_digest: &[u8], random: &[u8]) -> Vec<u8> {
    let key = hmac_sha256(&FMS_KEY[..68], c1_digest);
    let tail = hmac_sha256(&key, random);

    let mut s2 = Vec::with_capacity(PACKET_SIZE);
    s2.extend_from_slice(random);
    s2.extend_from_slice(&tail);
    s2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_signed_c1(middle: bool) -> Vec<u8> {
        let mut c1 = vec![0_u8; PACKET_SIZE];
        for (index, byte) in c1.iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }

        // A non-zero version field marks the packet as digest flavored
        c1[4..8].copy_from_slice(&[0x80, 0x00, 0x07, 0x02]);

        let offset = digest_offset(&c1, middle).unwrap();
        let digest = hmac_sha256(&FP_KEY[..30], &packet_without_digest(&c1, offset));
        c1[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);
        c1
    }

    #[test]
    fn validates_either_digest_scheme() {
        let (_, scheme1) = validate_client(&digest_signed_c1(true)).unwrap();
        assert!(scheme1, "middle scheme expected");

        let (_, scheme2) = validate_client(&digest_signed_c1(false)).unwrap();
        assert!(!scheme2, "non-middle scheme expected");
    }

    #[test]
    fn garbage_c1_fails_both_schemes() {
        let mut c1 = vec![0x55_u8; PACKET_SIZE];
        c1[4..8].copy_from_slice(&[1, 2, 3, 4]);

        assert!(validate_client(&c1).is_none());
    }

    #[test]
    fn signed_s1_validates_against_fms_key() {
        let mut s1 = vec![0_u8; PACKET_SIZE];
        for (index, byte) in s1.iter_mut().enumerate() {
            *byte = (index % 247) as u8;
        }

        sign_s1(&mut s1, false).unwrap();

        let offset = digest_offset(&s1, false).unwrap();
        let expected = hmac_sha256(&FMS_KEY[..36], &packet_without_digest(&s1, offset));
        assert_eq!(&s1[offset..offset + DIGEST_SIZE], &expected[..]);
    }

    #[test]
    fn s2_is_hmac_over_its_random_prefix() {
        let c1_digest = [7_u8; DIGEST_SIZE];
        let random = [9_u8; PACKET_SIZE - DIGEST_SIZE];
        let s2 = make_s2(&c1_digest, &random);

        assert_eq!(s2.len(), PACKET_SIZE);

        let key = hmac_sha256(&FMS_KEY[..68], &c1_digest);
        let expected_tail = hmac_sha256(&key, &random);
        assert_eq!(&s2[PACKET_SIZE - DIGEST_SIZE..], &expected_tail[..]);
    }
}
