use chrono::{DateTime, Utc};

/// Point-in-time index status surfaced by `get_status`
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub total_documents: u64,
    pub ram_segment_count: usize,
    pub disk_chunk_count: usize,
    /// Bytes owned by published RAM segments
    pub ram_segment_bytes: i64,
    /// Soft RAM budget currently configured
    pub soft_ram_limit: i64,
    /// Last committed transaction id
    pub committed_tid: u64,
    /// Transaction id covered by the on-disk state
    pub saved_tid: u64,
    /// Segments currently reserved by a merge or save
    pub locked_segments: usize,
    /// When the RAM layer was last flushed to `.ram` or promoted to disk
    pub last_flush: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl IndexStatus {
    /// Whether the RAM layer holds state newer than the last flush
    pub fn flush_needed(&self) -> bool {
        self.committed_tid > self.saved_tid
    }

    /// Seconds since the last flush, if any happened
    pub fn flush_age_secs(&self) -> Option<i64> {
        self.last_flush
            .map(|at| (Utc::now() - at).num_seconds().max(0))
    }
}
