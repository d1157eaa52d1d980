/// Positive-integer network encoding.
///
/// A non-negative integer is encoded as one length byte `L` followed by `L`
/// big-endian octets holding the value without leading zero octets. `L == 0`
/// encodes the value zero.
pub mod netint {
    use crate::shared::{IoError, IoResult};
    use byteorder::{BigEndian, ByteOrder};

    /// Largest possible encoding of a `u64`.
    pub const MAX_LEN: usize = 9;

    /// Number of bytes `value` occupies on the wire, length prefix included.
    #[inline]
    pub fn encoded_len(value: u64) -> usize {
        1 + payload_len(value)
    }

    #[inline]
    fn payload_len(value: u64) -> usize {
        8 - (value.leading_zeros() / 8) as usize
    }

    /// Append the encoding of `value` to `out`.
    pub fn encode(value: u64, out: &mut Vec<u8>) {
        let mut raw = [0u8; 8];
        BigEndian::write_u64(&mut raw, value);
        let len = payload_len(value);
        out.push(len as u8);
        out.extend_from_slice(&raw[8 - len..]);
    }

    /// Decode an integer from the front of `buf`.
    ///
    /// Returns the value and the number of bytes consumed, or `Ok(None)` when
    /// the buffer does not yet hold a full encoding. Non-minimal encodings and
    /// encodings wider than 64 bits are protocol errors.
    pub fn decode(buf: &[u8]) -> IoResult<Option<(u64, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let len = buf[0] as usize;
        if len > 8 {
            return Err(IoError::Protocol("integer field too wide"));
        }
        if buf.len() < 1 + len {
            return Ok(None);
        }
        if len == 0 {
            return Ok(Some((0, 1)));
        }
        if buf[1] == 0 {
            return Err(IoError::Protocol("non-minimal integer encoding"));
        }
        let value = BigEndian::read_uint(&buf[1..1 + len], len);
        Ok(Some((value, 1 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::netint;
    use crate::shared::IoError;

    #[test]
    fn test_roundtrip() {
        for &value in &[0u64, 1, 127, 128, 255, 256, 65535, 65536, u64::max_value()] {
            let mut out = Vec::new();
            netint::encode(value, &mut out);
            assert_eq!(out.len(), netint::encoded_len(value));

            let (decoded, used) = netint::decode(&out).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, out.len());
        }
    }

    #[test]
    fn test_zero_is_single_byte() {
        let mut out = Vec::new();
        netint::encode(0, &mut out);
        assert_eq!(out, vec![0u8]);
    }

    #[test]
    fn test_incomplete() {
        assert_eq!(netint::decode(&[]).unwrap(), None);
        assert_eq!(netint::decode(&[2, 1]).unwrap(), None);
    }

    #[test]
    fn test_non_minimal_rejected() {
        assert_eq!(
            netint::decode(&[2, 0, 5]).unwrap_err(),
            IoError::Protocol("non-minimal integer encoding")
        );
    }

    #[test]
    fn test_too_wide_rejected() {
        assert_eq!(
            netint::decode(&[9, 1, 1, 1, 1, 1, 1, 1, 1, 1]).unwrap_err(),
            IoError::Protocol("integer field too wide")
        );
    }
}
