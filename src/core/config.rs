use serde::{Deserialize, Serialize};

/// Dictionary mode: hashed numeric word ids or interned keyword bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DictMode {
    Crc,
    Keywords,
}

/// Docstore block compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Lz4,
    Zstd,
}

/// Tunable index settings, persisted inside `.meta` with a mutable
/// `.settings` overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtSettings {
    /// Wordlist checkpoint interval (words per checkpoint)
    pub checkpoint_interval: u32,
    /// RAM budget for the segment layer, in bytes
    pub soft_ram_limit: i64,
    /// Hard cap on published RAM segments
    pub max_segments: usize,
    /// Merge headroom below `max_segments`
    pub max_progression: usize,
    /// Skiplist entry every this many docs in a word's doclist
    pub skiplist_block_size: u32,
    pub dict_mode: DictMode,
    /// Minimum expandable prefix length; 0 disables prefix search
    pub min_prefix_len: u32,
    /// Minimum expandable infix length; 0 disables infix search
    pub min_infix_len: u32,
    /// Infix bloom geometry, per checkpoint
    pub bloom_per_entry: u8,
    pub bloom_hashes: u8,
    /// Longest codepoint sequence the tokenizer may emit
    pub max_codepoint_len: u32,
    /// Per-segment cap on wildcard expansion; 0 means unlimited
    pub expansion_limit: usize,
    pub docstore_compression: CompressionType,
    /// Keep original field text in the docstore
    pub stored_fields: bool,
}

impl Default for RtSettings {
    fn default() -> Self {
        RtSettings {
            checkpoint_interval: 48,
            soft_ram_limit: 128 * 1024 * 1024,
            max_segments: 32,
            max_progression: 8,
            skiplist_block_size: 128,
            dict_mode: DictMode::Keywords,
            min_prefix_len: 0,
            min_infix_len: 0,
            bloom_per_entry: 8,
            bloom_hashes: 2,
            max_codepoint_len: 42,
            expansion_limit: 0,
            docstore_compression: CompressionType::Lz4,
            stored_fields: true,
        }
    }
}

impl RtSettings {
    /// Fraction of the soft limit available to fresh commits while a save
    /// is running (the "double buffer")
    pub fn double_buffer_limit(&self) -> i64 {
        self.soft_ram_limit / 10
    }

    /// Infix search requires a dictionary that keeps keyword bytes
    pub fn infix_enabled(&self) -> bool {
        self.min_infix_len > 0 && self.dict_mode == DictMode::Keywords
    }

    pub fn prefix_enabled(&self) -> bool {
        self.min_prefix_len > 0 && self.dict_mode == DictMode::Keywords
    }
}
