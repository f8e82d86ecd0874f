/// Variable byte encoding for unsigned integers: little-endian, 7 data bits
/// per byte, high bit set on every byte except the last.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 128 {
        out.push((value & 127) as u8 | 128);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a single value, returns (value, bytes_consumed)
pub fn read_varint(input: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in input.iter().enumerate() {
        value |= ((byte & 127) as u64) << shift;
        if byte & 128 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None; // more than 10 bytes
        }
    }
    None // truncated
}

/// Cursor over an encoded byte stream
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], offset: usize) -> Self {
        ByteReader { data, pos: offset }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_varint(&mut self) -> Option<u64> {
        let (value, consumed) = read_varint(&self.data[self.pos.min(self.data.len())..])?;
        self.pos += consumed;
        Some(value)
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_varint_round_trip() {
        let mut out = Vec::new();
        let values = [
            0u64,
            1,
            127,
            128,
            16383,
            16384,
            u32::MAX as u64,
            u64::MAX - 1,
            u64::MAX,
        ];
        for &v in &values {
            out.clear();
            write_varint(&mut out, v);
            let (decoded, consumed) = read_varint(&out).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, out.len());
        }
    }

    #[test]
    fn test_varint_round_trip_random() {
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        for _ in 0..1000 {
            let v: u64 = rng.r#gen::<u64>() >> rng.gen_range(0..64);
            out.clear();
            write_varint(&mut out, v);
            assert_eq!(read_varint(&out).unwrap().0, v);
        }
    }

    #[test]
    fn test_varint_truncated() {
        assert!(read_varint(&[0x80]).is_none());
        assert!(read_varint(&[]).is_none());
    }

    #[test]
    fn test_byte_reader_stream() {
        let mut out = Vec::new();
        write_varint(&mut out, 300);
        write_varint(&mut out, 5);
        let mut reader = ByteReader::new(&out);
        assert_eq!(reader.read_varint(), Some(300));
        assert_eq!(reader.read_varint(), Some(5));
        assert!(reader.is_eof());
        assert_eq!(reader.read_varint(), None);
    }
}
