use std::fs;
use std::io::Write;
use std::path::Path;

use crate::core::error::{Error, ErrorKind, Result};

/// Shared on-disk framing: magic, format version, body checksum, body.
/// Every persisted file of the index uses it.
const FRAME_HEADER_LEN: usize = 12;

pub fn write_file(path: &Path, magic: u32, version: u32, body: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(&magic.to_le_bytes());
    header[4..8].copy_from_slice(&version.to_le_bytes());
    header[8..12].copy_from_slice(&crc32fast::hash(body).to_le_bytes());
    file.write_all(&header)?;
    file.write_all(body)?;
    file.sync_all()?;
    Ok(())
}

/// Write through a staging file and rename over the target, so readers
/// only ever observe a complete file
pub fn write_file_atomic(
    path: &Path,
    staging: &Path,
    magic: u32,
    version: u32,
    body: &[u8],
) -> Result<()> {
    write_file(staging, magic, version, body)?;
    fs::rename(staging, path)?;
    Ok(())
}

pub fn read_file(path: &Path, magic: u32, version: u32) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    verify_frame(&data, magic, version, path)
}

fn verify_frame(data: &[u8], magic: u32, version: u32, path: &Path) -> Result<Vec<u8>> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(Error::corrupted(format!("{path:?}: file too short")));
    }
    let file_magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if file_magic != magic {
        return Err(Error::corrupted(format!(
            "{path:?}: bad magic {file_magic:#x}, expected {magic:#x}"
        )));
    }
    let file_version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if file_version != version {
        return Err(Error::new(
            ErrorKind::Parse,
            format!("{path:?}: unsupported format version {file_version}"),
        ));
    }
    let crc = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let body = data[FRAME_HEADER_LEN..].to_vec();
    if crc32fast::hash(&body) != crc {
        return Err(Error::corrupted(format!("{path:?}: checksum mismatch")));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.bin");
        write_file(&path, 0xABCD, 3, b"payload").unwrap();
        assert_eq!(read_file(&path, 0xABCD, 3).unwrap(), b"payload");
        assert!(read_file(&path, 0xABCE, 3).is_err());
        assert!(read_file(&path, 0xABCD, 4).is_err());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.bin");
        write_file(&path, 0xABCD, 1, b"payload").unwrap();
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, data).unwrap();
        let err = read_file(&path, 0xABCD, 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupted);
    }
}
