use crate::codec::varint::{ByteReader, write_varint};
use crate::core::config::DictMode;
use crate::core::types::WordId;

/// Longest keyword the dictionary layer may intern, in bytes. Keeps the
/// two-byte keyword-delta encoding (7-bit suffix length) always sufficient.
pub const MAX_KEYWORD_BYTES: usize = 120;

/// High bit on the encoded doc_count marking a hitless word
pub const HITLESS_FLAG: u64 = 1 << 31;

/// Dictionary key: hashed id in crc mode, raw keyword bytes in keywords mode
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WordKey {
    Id(WordId),
    Keyword(Vec<u8>),
}

impl WordKey {
    pub fn keyword_bytes(&self) -> &[u8] {
        match self {
            WordKey::Keyword(bytes) => bytes,
            WordKey::Id(_) => &[],
        }
    }
}

/// Wordlist checkpoint: the first word of a span and the byte offset its
/// delta-restarted encoding begins at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub key: WordKey,
    pub offset: usize,
}

/// One decoded dictionary entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordEntry {
    pub key: WordKey,
    pub doc_count: u32,
    pub hit_count: u64,
    pub doclist_offset: u64,
    pub has_hitlist: bool,
}

/// Streaming wordlist encoder. Every `interval`-th word starts a new
/// checkpoint; between checkpoints word keys and doclist offsets are
/// delta-encoded.
#[derive(Debug)]
pub struct WordlistWriter {
    mode: DictMode,
    interval: u32,
    count: u64,
    last_id: WordId,
    last_keyword: Vec<u8>,
    last_doclist_offset: u64,
    checkpoints: Vec<Checkpoint>,
}

impl WordlistWriter {
    pub fn new(mode: DictMode, interval: u32) -> Self {
        WordlistWriter {
            mode,
            interval: interval.max(1),
            count: 0,
            last_id: 0,
            last_keyword: Vec::new(),
            last_doclist_offset: 0,
            checkpoints: Vec::new(),
        }
    }

    /// Append one entry; caller guarantees keys arrive in ascending order
    pub fn push(&mut self, out: &mut Vec<u8>, entry: &WordEntry) {
        if self.count % self.interval as u64 == 0 {
            self.checkpoints.push(Checkpoint {
                key: entry.key.clone(),
                offset: out.len(),
            });
            self.last_id = 0;
            self.last_keyword.clear();
            self.last_doclist_offset = 0;
        }
        self.count += 1;

        match (&entry.key, self.mode) {
            (WordKey::Id(id), DictMode::Crc) => {
                write_varint(out, id - self.last_id);
                self.last_id = *id;
            }
            (WordKey::Keyword(word), DictMode::Keywords) => {
                let matched = shared_prefix(&self.last_keyword, word);
                let delta = word.len() - matched;
                debug_assert!(delta >= 1 && delta <= 127 && matched <= 255);
                if delta <= 8 && matched <= 15 {
                    // Packed single byte [1ddd mmmm]
                    out.push(0x80 | (((delta - 1) as u8) << 4) | matched as u8);
                } else {
                    out.push(delta as u8);
                    out.push(matched as u8);
                }
                out.extend_from_slice(&word[matched..]);
                self.last_keyword.clear();
                self.last_keyword.extend_from_slice(word);
            }
            _ => debug_assert!(false, "word key does not match dictionary mode"),
        }

        let mut doc_count = entry.doc_count as u64;
        if !entry.has_hitlist {
            doc_count |= HITLESS_FLAG;
        }
        write_varint(out, doc_count);
        write_varint(out, entry.hit_count);
        write_varint(out, entry.doclist_offset - self.last_doclist_offset);
        self.last_doclist_offset = entry.doclist_offset;
    }

    pub fn word_count(&self) -> u64 {
        self.count
    }

    pub fn finish(self) -> Vec<Checkpoint> {
        self.checkpoints
    }
}

/// Decoder for one checkpoint span (delta state starts zeroed)
#[derive(Debug, Clone)]
pub struct WordlistReader<'a> {
    mode: DictMode,
    reader: ByteReader<'a>,
    end: usize,
    last_id: WordId,
    last_keyword: Vec<u8>,
    last_doclist_offset: u64,
}

impl<'a> WordlistReader<'a> {
    /// Read the span `[start, end)`; `end` is the next checkpoint's offset
    /// or the stream length
    pub fn span(data: &'a [u8], mode: DictMode, start: usize, end: usize) -> Self {
        WordlistReader {
            mode,
            reader: ByteReader::at(data, start),
            end,
            last_id: 0,
            last_keyword: Vec::new(),
            last_doclist_offset: 0,
        }
    }
}

impl Iterator for WordlistReader<'_> {
    type Item = WordEntry;

    fn next(&mut self) -> Option<WordEntry> {
        if self.reader.pos() >= self.end {
            return None;
        }

        let key = match self.mode {
            DictMode::Crc => {
                let delta = self.reader.read_varint()?;
                self.last_id += delta;
                WordKey::Id(self.last_id)
            }
            DictMode::Keywords => {
                let first = self.reader.read_byte()?;
                let (delta, matched) = if first & 0x80 != 0 {
                    ((((first >> 4) & 0x07) + 1) as usize, (first & 0x0F) as usize)
                } else {
                    (first as usize, self.reader.read_byte()? as usize)
                };
                let suffix = self.reader.read_bytes(delta)?;
                self.last_keyword.truncate(matched);
                self.last_keyword.extend_from_slice(suffix);
                WordKey::Keyword(self.last_keyword.clone())
            }
        };

        let raw_doc_count = self.reader.read_varint()?;
        let has_hitlist = raw_doc_count & HITLESS_FLAG == 0;
        let doc_count = (raw_doc_count & !HITLESS_FLAG) as u32;
        let hit_count = self.reader.read_varint()?;
        let offset_delta = self.reader.read_varint()?;
        self.last_doclist_offset += offset_delta;

        Some(WordEntry {
            key,
            doc_count,
            hit_count,
            doclist_offset: self.last_doclist_offset,
            has_hitlist,
        })
    }
}

/// Iterate every word of an encoded wordlist by chaining checkpoint spans
pub fn iter_words<'a>(
    data: &'a [u8],
    checkpoints: &'a [Checkpoint],
    mode: DictMode,
) -> impl Iterator<Item = WordEntry> + 'a {
    let spans: Vec<(usize, usize)> = checkpoints
        .iter()
        .enumerate()
        .map(|(i, cp)| {
            let end = checkpoints.get(i + 1).map_or(data.len(), |next| next.offset);
            (cp.offset, end)
        })
        .collect();
    spans
        .into_iter()
        .flat_map(move |(start, end)| WordlistReader::span(data, mode, start, end))
}

/// Index of the checkpoint span that could contain `key`: the greatest
/// checkpoint whose first word is <= `key`. None if `key` sorts below the
/// first checkpoint.
pub fn find_checkpoint(checkpoints: &[Checkpoint], key: &WordKey) -> Option<usize> {
    match checkpoints.binary_search_by(|cp| cp.key.cmp(key)) {
        Ok(idx) => Some(idx),
        Err(0) => None,
        Err(idx) => Some(idx - 1),
    }
}

/// End offset of the checkpoint span `idx`
pub fn span_end(checkpoints: &[Checkpoint], idx: usize, data_len: usize) -> usize {
    checkpoints.get(idx + 1).map_or(data_len, |cp| cp.offset)
}

/// Serialize checkpoints. Keyword checkpoints store the word
/// length-prefixed and null-terminated for plain byte comparisons.
pub fn write_checkpoints(out: &mut Vec<u8>, checkpoints: &[Checkpoint]) {
    write_varint(out, checkpoints.len() as u64);
    for cp in checkpoints {
        match &cp.key {
            WordKey::Id(id) => {
                out.push(0);
                write_varint(out, *id);
            }
            WordKey::Keyword(word) => {
                out.push(1);
                out.push(word.len() as u8);
                out.extend_from_slice(word);
                out.push(0);
            }
        }
        write_varint(out, cp.offset as u64);
    }
}

pub fn read_checkpoints(reader: &mut ByteReader) -> Option<Vec<Checkpoint>> {
    let count = reader.read_varint()? as usize;
    let mut checkpoints = Vec::with_capacity(count);
    for _ in 0..count {
        let key = match reader.read_byte()? {
            0 => WordKey::Id(reader.read_varint()?),
            1 => {
                let len = reader.read_byte()? as usize;
                let word = reader.read_bytes(len)?.to_vec();
                if reader.read_byte()? != 0 {
                    return None;
                }
                WordKey::Keyword(word)
            }
            _ => return None,
        };
        let offset = reader.read_varint()? as usize;
        checkpoints.push(Checkpoint { key, offset });
    }
    Some(checkpoints)
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    let limit = a.len().min(b.len()).min(255);
    let mut i = 0;
    while i < limit && a[i] == b[i] {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: WordKey, doc_count: u32, doclist_offset: u64) -> WordEntry {
        WordEntry {
            key,
            doc_count,
            hit_count: doc_count as u64 * 2,
            doclist_offset,
            has_hitlist: true,
        }
    }

    #[test]
    fn test_numeric_wordlist_round_trip() {
        let entries: Vec<WordEntry> = (0..200)
            .map(|i| entry(WordKey::Id(i * 17 + 3), (i % 7 + 1) as u32, i * 31))
            .collect();

        let mut out = Vec::new();
        let mut writer = WordlistWriter::new(DictMode::Crc, 48);
        for e in &entries {
            writer.push(&mut out, e);
        }
        let checkpoints = writer.finish();
        // 200 words / 48 per checkpoint
        assert_eq!(checkpoints.len(), 5);

        let read: Vec<WordEntry> = iter_words(&out, &checkpoints, DictMode::Crc).collect();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_keyword_wordlist_round_trip() {
        let mut words: Vec<Vec<u8>> = ["alpha", "alphanumeric", "beta", "betamax", "gamma", "z"]
            .iter()
            .map(|w| w.as_bytes().to_vec())
            .collect();
        words.sort();
        let entries: Vec<WordEntry> = words
            .iter()
            .enumerate()
            .map(|(i, w)| entry(WordKey::Keyword(w.clone()), 1 + i as u32, i as u64 * 10))
            .collect();

        let mut out = Vec::new();
        let mut writer = WordlistWriter::new(DictMode::Keywords, 2);
        for e in &entries {
            writer.push(&mut out, e);
        }
        let checkpoints = writer.finish();

        let read: Vec<WordEntry> = iter_words(&out, &checkpoints, DictMode::Keywords).collect();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_hitless_flag_round_trip() {
        let mut out = Vec::new();
        let mut writer = WordlistWriter::new(DictMode::Crc, 48);
        writer.push(
            &mut out,
            &WordEntry {
                key: WordKey::Id(5),
                doc_count: 9,
                hit_count: 0,
                doclist_offset: 0,
                has_hitlist: false,
            },
        );
        let checkpoints = writer.finish();
        let read: Vec<WordEntry> = iter_words(&out, &checkpoints, DictMode::Crc).collect();
        assert_eq!(read.len(), 1);
        assert!(!read[0].has_hitlist);
        assert_eq!(read[0].doc_count, 9);
    }

    #[test]
    fn test_find_checkpoint() {
        let checkpoints = vec![
            Checkpoint {
                key: WordKey::Id(10),
                offset: 0,
            },
            Checkpoint {
                key: WordKey::Id(50),
                offset: 100,
            },
        ];
        assert_eq!(find_checkpoint(&checkpoints, &WordKey::Id(5)), None);
        assert_eq!(find_checkpoint(&checkpoints, &WordKey::Id(10)), Some(0));
        assert_eq!(find_checkpoint(&checkpoints, &WordKey::Id(49)), Some(0));
        assert_eq!(find_checkpoint(&checkpoints, &WordKey::Id(50)), Some(1));
        assert_eq!(find_checkpoint(&checkpoints, &WordKey::Id(999)), Some(1));
    }

    #[test]
    fn test_checkpoint_serialization_round_trip() {
        let checkpoints = vec![
            Checkpoint {
                key: WordKey::Keyword(b"alpha".to_vec()),
                offset: 0,
            },
            Checkpoint {
                key: WordKey::Keyword(b"omega".to_vec()),
                offset: 777,
            },
        ];
        let mut out = Vec::new();
        write_checkpoints(&mut out, &checkpoints);
        let read = read_checkpoints(&mut ByteReader::new(&out)).unwrap();
        assert_eq!(read, checkpoints);
    }
}
