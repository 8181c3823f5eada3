//! Wire-format primitives shared by instruction data and message
//! serialization.
//!
//! Instruction payloads use the little-endian, length-prefixed layout the
//! payment program deserializes: integers as LE bytes, strings as a `u32`
//! length followed by UTF-8 bytes, options as a `0x00`/`0x01` tag. Message
//! framing uses the chain's compact-u16 (shortvec) length prefix.

/// Append-only writer for instruction payload fields.
#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// `u32` length prefix + raw UTF-8 bytes.
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// `0x00` for None, `0x01` followed by the value for Some.
    pub fn write_option<T>(
        &mut self,
        value: Option<T>,
        write: impl FnOnce(&mut Self, T),
    ) -> &mut Self {
        match value {
            None => {
                self.buf.push(0);
            }
            Some(v) => {
                self.buf.push(1);
                write(self, v);
            }
        }
        self
    }
}

/// Encode a length as compact-u16: 7 bits per byte, little-endian, high bit
/// as the continuation flag. At most 3 bytes.
pub fn push_compact_u16(buf: &mut Vec<u8>, mut value: u16) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a compact-u16 at `offset`, returning the value and the new offset.
pub fn read_compact_u16(buf: &[u8], mut offset: usize) -> Option<(u16, usize)> {
    let mut value: u32 = 0;
    for shift in [0u32, 7, 14] {
        let byte = *buf.get(offset)?;
        offset += 1;
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return u16::try_from(value).ok().map(|v| (v, offset));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_writer_layout() {
        let mut w = FieldWriter::new();
        w.write_u8(7)
            .write_str("ab")
            .write_i64(-1)
            .write_u64(0x0102_0304_0506_0708);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..1], &[7]);
        assert_eq!(&bytes[1..5], &[2, 0, 0, 0]); // u32 LE length
        assert_eq!(&bytes[5..7], b"ab");
        assert_eq!(&bytes[7..15], &[0xff; 8]); // -1 as i64 LE
        assert_eq!(
            &bytes[15..23],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn option_tags() {
        let mut w = FieldWriter::new();
        w.write_option(None::<u64>, |w, v| {
            w.write_u64(v);
        });
        w.write_option(Some(5u64), |w, v| {
            w.write_u64(v);
        });
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(&bytes[2..10], &5u64.to_le_bytes());
    }

    #[test]
    fn compact_u16_boundaries() {
        for (value, expected) in [
            (0u16, vec![0x00]),
            (1, vec![0x01]),
            (0x7f, vec![0x7f]),
            (0x80, vec![0x80, 0x01]),
            (0x3fff, vec![0xff, 0x7f]),
            (0x4000, vec![0x80, 0x80, 0x01]),
            (u16::MAX, vec![0xff, 0xff, 0x03]),
        ] {
            let mut buf = Vec::new();
            push_compact_u16(&mut buf, value);
            assert_eq!(buf, expected, "encoding {value}");

            let (decoded, next) = read_compact_u16(&buf, 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(next, buf.len());
        }
    }

    #[test]
    fn compact_u16_rejects_truncated_input() {
        assert!(read_compact_u16(&[0x80], 0).is_none());
        assert!(read_compact_u16(&[], 0).is_none());
    }
}
