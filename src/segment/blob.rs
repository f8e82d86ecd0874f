use serde::{Deserialize, Serialize};

use crate::codec::varint::{ByteReader, write_varint};
use crate::core::error::{Error, Result};

/// Append-only byte arena for variable-length attribute values. Every
/// entry is a varint length followed by its payload; offset 0 is reserved
/// for "no value" so rows can use a zero cell as the empty marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobPool {
    data: Vec<u8>,
}

impl Default for BlobPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobPool {
    pub fn new() -> Self {
        // Burn offset zero
        BlobPool { data: vec![0] }
    }

    pub fn from_raw(data: Vec<u8>) -> Self {
        if data.is_empty() {
            Self::new()
        } else {
            BlobPool { data }
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_len(&self) -> usize {
        self.data.len()
    }

    fn append(&mut self, payload: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        write_varint(&mut self.data, payload.len() as u64);
        self.data.extend_from_slice(payload);
        offset
    }

    pub fn append_bytes(&mut self, payload: &[u8]) -> u64 {
        self.append(payload)
    }

    pub fn append_string(&mut self, value: &str) -> u64 {
        self.append(value.as_bytes())
    }

    pub fn append_json(&mut self, value: &serde_json::Value) -> Result<u64> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.append(&payload))
    }

    pub fn append_mva_u32(&mut self, values: &[u32]) -> u64 {
        let mut payload = Vec::with_capacity(values.len() * 4);
        for &v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.append(&payload)
    }

    pub fn append_mva_u64(&mut self, values: &[u64]) -> u64 {
        let mut payload = Vec::with_capacity(values.len() * 8);
        for &v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.append(&payload)
    }

    /// Payload at `offset`; 0 resolves to the empty payload
    pub fn get(&self, offset: u64) -> Option<&[u8]> {
        if offset == 0 {
            return Some(&[]);
        }
        let mut reader = ByteReader::at(&self.data, offset as usize);
        let len = reader.read_varint()? as usize;
        reader.read_bytes(len)
    }

    pub fn get_string(&self, offset: u64) -> Result<&str> {
        let payload = self
            .get(offset)
            .ok_or_else(|| Error::corrupted(format!("blob offset {offset} out of range")))?;
        std::str::from_utf8(payload).map_err(|_| Error::corrupted("blob is not valid UTF-8"))
    }

    pub fn get_json(&self, offset: u64) -> Result<serde_json::Value> {
        let payload = self
            .get(offset)
            .ok_or_else(|| Error::corrupted(format!("blob offset {offset} out of range")))?;
        if payload.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn get_mva_u32(&self, offset: u64) -> Option<Vec<u32>> {
        let payload = self.get(offset)?;
        Some(
            payload
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn get_mva_u64(&self, offset: u64) -> Option<Vec<u64>> {
        let payload = self.get(offset)?;
        Some(
            payload
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }

    /// Deep-copy one payload from another pool (merge path)
    pub fn copy_from(&mut self, source: &BlobPool, offset: u64) -> u64 {
        if offset == 0 {
            return 0;
        }
        match source.get(offset) {
            Some(payload) => self.append(payload),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let mut pool = BlobPool::new();
        let a = pool.append_string("hello");
        let b = pool.append_mva_u32(&[5, 10, 15]);
        let c = pool.append_mva_u64(&[u64::MAX, 1]);

        assert_ne!(a, 0);
        assert_eq!(pool.get_string(a).unwrap(), "hello");
        assert_eq!(pool.get_mva_u32(b).unwrap(), vec![5, 10, 15]);
        assert_eq!(pool.get_mva_u64(c).unwrap(), vec![u64::MAX, 1]);
        assert_eq!(pool.get(0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_blob_json_round_trip() {
        let mut pool = BlobPool::new();
        let value = serde_json::json!({"a": [1, 2], "b": "x"});
        let offset = pool.append_json(&value).unwrap();
        assert_eq!(pool.get_json(offset).unwrap(), value);
        assert_eq!(pool.get_json(0).unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn test_copy_between_pools() {
        let mut src = BlobPool::new();
        let offset = src.append_string("payload");
        let mut dst = BlobPool::new();
        dst.append_string("padding to shift offsets");
        let copied = dst.copy_from(&src, offset);
        assert_eq!(dst.get_string(copied).unwrap(), "payload");
        assert_eq!(dst.copy_from(&src, 0), 0);
    }
}
