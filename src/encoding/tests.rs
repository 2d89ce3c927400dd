#[cfg(test)]
mod tests {
    use crate::encoding::{ByteReader, EncodingError};
    use bytes::BufMut;

    #[test]
    fn test_fixed_width_round_trip() {
        let mut buf = Vec::new();
        buf.put_u8(0xAB);
        buf.put_u16_le(0xBEEF);
        buf.put_u32_le(0xDEAD_BEEF);
        buf.put_u64_le(0x0123_4567_89AB_CDEF);

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(r.is_empty());
    }

    #[test]
    fn test_length_prefixed_round_trip() {
        let mut buf = Vec::new();
        buf.put_u16_le(5);
        buf.put_slice(b"hello");
        buf.put_u32_le(0);
        buf.put_u32_le(3);
        buf.put_slice(b"abc");

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_len_u16().unwrap(), b"hello");
        assert_eq!(r.read_len_u32().unwrap(), b"");
        assert_eq!(r.read_len_u32().unwrap(), b"abc");
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_integer_reports_eof() {
        let buf = [0x01u8, 0x02, 0x03];
        let mut r = ByteReader::new(&buf);
        match r.read_u32() {
            Err(EncodingError::UnexpectedEof { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_length_prefix_payload() {
        // Length prefix claims 10 bytes but only 4 follow.
        let mut buf = Vec::new();
        buf.put_u16_le(10);
        buf.put_slice(b"abcd");

        let mut r = ByteReader::new(&buf);
        assert!(matches!(
            r.read_len_u16(),
            Err(EncodingError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_position_tracking() {
        let mut buf = Vec::new();
        buf.put_u64_le(7);
        buf.put_u16_le(2);
        buf.put_slice(b"xy");

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.pos(), 0);
        r.read_u64().unwrap();
        assert_eq!(r.pos(), 8);
        assert_eq!(r.remaining(), 4);
        r.read_len_u16().unwrap();
        assert_eq!(r.pos(), 12);
        assert!(r.is_empty());
    }

    #[test]
    fn test_read_slice_exact_bounds() {
        let buf = b"abcdef";
        let mut r = ByteReader::new(buf);
        assert_eq!(r.read_slice(6).unwrap(), b"abcdef");
        assert!(matches!(
            r.read_slice(1),
            Err(EncodingError::UnexpectedEof { .. })
        ));
    }
}
