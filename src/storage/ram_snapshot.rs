use std::sync::Arc;

use log::{debug, info};

use crate::core::error::Result;
use crate::segment::data::SegmentData;
use crate::segment::ram_segment::RamSegment;
use crate::storage::files::{read_file, write_file_atomic};
use crate::storage::layout::IndexLayout;

pub const RAM_MAGIC: u32 = 0x5452_4D52; // "TRMR"
pub const RAM_VERSION: u32 = 1;

/// Write the whole RAM layer to `.ram`, staged through `.ram.new` and
/// renamed so a crash never leaves a half-written snapshot
pub fn save_ram(layout: &IndexLayout, segments: &[Arc<RamSegment>]) -> Result<()> {
    let datas: Vec<SegmentData> = segments.iter().map(|s| s.to_data()).collect();
    let body = bincode::serialize(&datas)?;
    write_file_atomic(
        &layout.ram_path(),
        &layout.ram_new_path(),
        RAM_MAGIC,
        RAM_VERSION,
        &body,
    )?;
    info!(
        "saved .ram snapshot: {} segments, {} bytes",
        segments.len(),
        body.len()
    );
    Ok(())
}

/// Load the RAM layer from `.ram`; an absent file is an empty layer
pub fn load_ram(layout: &IndexLayout) -> Result<Vec<Arc<RamSegment>>> {
    let path = layout.ram_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let body = read_file(&path, RAM_MAGIC, RAM_VERSION)?;
    let datas: Vec<SegmentData> = bincode::deserialize(&body)?;
    let mut segments = Vec::with_capacity(datas.len());
    for data in datas {
        segments.push(RamSegment::from_data(data)?);
    }
    debug!("loaded .ram snapshot: {} segments", segments.len());
    Ok(segments)
}

/// The RAM layer became redundant (promoted to a disk chunk)
pub fn delete_ram(layout: &IndexLayout) {
    let _ = std::fs::remove_file(layout.ram_path());
    let _ = std::fs::remove_file(layout.ram_new_path());
}
