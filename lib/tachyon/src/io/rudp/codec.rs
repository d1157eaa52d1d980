//! Datagram wire format for the reliable UDP transport.
//!
//! ```text
//! | FLAGS(1) | SEQ(netint) | ACK(netint) | WIN(netint) | DATA | HMAC(20) |
//! ```
//!
//! Integers use the positive-integer network encoding from
//! `quark::encoding::netint`. The trailing tag is the keyed SHA-1 digest of
//! everything before it, computed with the sender's role-asymmetric secret.

use quark::crypto;
use quark::encoding::netint;
use quark::{IoError, IoResult};

/// IPv4 minimum reassembly MTU.
pub const MTU: usize = 576;

/// Maximum total datagram size within the IPv4 minimum-MTU budget
/// (IPv4 header and UDP header subtracted).
pub const MAX_SEGMENT: usize = 516;

/// Maximum UDP payload; bounds the number of datagrams read per dispatch.
pub const MAX_DGRAM: usize = 65507;

const FLAGS_LEN: usize = 1;
const SEQ_LEN: usize = 8;
const ACK_LEN: usize = 8;
const WIN_LEN: usize = 8;

/// Maximum stream data per datagram.
pub const MAX_DATA: usize =
    MAX_SEGMENT - (FLAGS_LEN + SEQ_LEN + ACK_LEN + WIN_LEN + crypto::DIGEST_SIZE);

pub mod flags {
    /// The datagram carries the last byte of the output stream.
    pub const CLOSE: u8 = 0x80;
    /// Acknowledges the peer's closed stream.
    pub const ACK_CLOSE: u8 = 0x40;
    /// Connection-level failure notification.
    pub const FAIL: u8 = 0x20;
    /// All assigned flag bits; the rest are reserved.
    pub const MASK: u8 = 0xe0;
}

/// A parsed datagram borrowing its payload from the receive buffer.
#[derive(Debug, Eq, PartialEq)]
pub struct Datagram<'a> {
    pub flags: u8,
    pub seq: u64,
    pub ack: u64,
    pub win: u64,
    pub data: &'a [u8],
}

/// Encodes a datagram, appending the authentication tag computed with
/// `send_secret`.
pub fn encode(dgram: &Datagram, send_secret: &[u8]) -> Vec<u8> {
    let mut pkg = Vec::with_capacity(
        FLAGS_LEN
            + netint::encoded_len(dgram.seq)
            + netint::encoded_len(dgram.ack)
            + netint::encoded_len(dgram.win)
            + dgram.data.len()
            + crypto::DIGEST_SIZE,
    );
    pkg.push(dgram.flags);
    netint::encode(dgram.seq, &mut pkg);
    netint::encode(dgram.ack, &mut pkg);
    netint::encode(dgram.win, &mut pkg);
    pkg.extend_from_slice(dgram.data);

    let tag = crypto::keyed_digest(send_secret, &pkg);
    pkg.extend_from_slice(&tag);
    pkg
}

/// Splits off and verifies the authentication tag.
///
/// Returns the authenticated payload, or `None` when the datagram is too
/// short or fails authentication; such datagrams are silently dropped.
pub fn authenticate<'a>(dgram: &'a [u8], recv_secret: &[u8]) -> Option<&'a [u8]> {
    if dgram.len() <= crypto::DIGEST_SIZE {
        return None;
    }
    let (payload, tag) = dgram.split_at(dgram.len() - crypto::DIGEST_SIZE);
    if !crypto::verify_digest(recv_secret, payload, tag) {
        return None;
    }
    Some(payload)
}

/// Parses an authenticated payload into a datagram.
pub fn parse(payload: &[u8]) -> IoResult<Datagram> {
    if payload.is_empty() {
        return Err(IoError::Protocol("datagram format error"));
    }
    let flags = payload[0];
    let mut offset = 1;

    let mut fields = [0u64; 3];
    for field in fields.iter_mut() {
        match netint::decode(&payload[offset..])? {
            Some((value, used)) => {
                *field = value;
                offset += used;
            }
            None => return Err(IoError::Protocol("datagram format error")),
        }
    }

    Ok(Datagram {
        flags,
        seq: fields[0],
        ack: fields[1],
        win: fields[2],
        data: &payload[offset..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEND_SECRET: &[u8] = b"ab";
    const RECV_SECRET: &[u8] = b"ba";

    #[test]
    fn test_constants() {
        assert_eq!(MAX_SEGMENT, 516);
        assert_eq!(MAX_DATA, 471);
        assert!(MAX_SEGMENT < MTU);
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let dgram = Datagram {
            flags: flags::CLOSE,
            seq: 1024,
            ack: 17,
            win: 65536,
            data: b"stream data",
        };

        let wire = encode(&dgram, SEND_SECRET);
        let payload = authenticate(&wire, SEND_SECRET).expect("Authentication failed");
        let parsed = parse(payload).unwrap();

        assert_eq!(parsed, dgram);
    }

    #[test]
    fn test_tampering_is_dropped() {
        let dgram = Datagram {
            flags: 0,
            seq: 5,
            ack: 0,
            win: 128,
            data: b"x",
        };
        let wire = encode(&dgram, SEND_SECRET);

        // Flip one bit anywhere in the datagram
        for idx in 0..wire.len() {
            let mut tampered = wire.clone();
            tampered[idx] ^= 0x01;
            assert!(authenticate(&tampered, SEND_SECRET).is_none());
        }
    }

    #[test]
    fn test_wrong_direction_secret_is_dropped() {
        let dgram = Datagram {
            flags: 0,
            seq: 0,
            ack: 0,
            win: 128,
            data: b"",
        };
        let wire = encode(&dgram, SEND_SECRET);

        // A replay on the reverse direction must not authenticate
        assert!(authenticate(&wire, RECV_SECRET).is_none());
        assert!(authenticate(&wire, SEND_SECRET).is_some());
    }

    #[test]
    fn test_short_datagram_is_dropped() {
        assert!(authenticate(&[0u8; crypto::DIGEST_SIZE], SEND_SECRET).is_none());
        assert!(authenticate(&[], SEND_SECRET).is_none());
    }

    #[test]
    fn test_truncated_fields_fail_parse() {
        assert!(parse(&[]).is_err());
        // Flags plus a length prefix promising more bytes than present
        assert!(parse(&[0x00, 0x04, 0x01]).is_err());
    }

    #[test]
    fn test_empty_ack_datagram() {
        let dgram = Datagram {
            flags: 0,
            seq: 42,
            ack: 42,
            win: 1024,
            data: b"",
        };
        let wire = encode(&dgram, SEND_SECRET);
        let parsed = parse(authenticate(&wire, SEND_SECRET).unwrap()).unwrap();
        assert_eq!(parsed.data, b"");
        assert_eq!(parsed.seq, 42);
    }
}
