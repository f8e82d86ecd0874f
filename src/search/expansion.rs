use crate::codec::wordlist::{Checkpoint, WordKey, WordlistReader, find_checkpoint, span_end};
use crate::segment::PostingsView;

/// Expand `prefix*` against one segment's dictionary: walk checkpoint
/// spans whose boundaries can contain the prefix and collect matching
/// keywords. Keywords-mode dictionaries only.
pub fn expand_prefix(view: &dyn PostingsView, prefix: &[u8], limit: usize) -> Vec<WordKey> {
    let checkpoints = view.checkpoints();
    if checkpoints.is_empty() || prefix.is_empty() {
        return Vec::new();
    }
    let start_idx =
        find_checkpoint(checkpoints, &WordKey::Keyword(prefix.to_vec())).unwrap_or(0);

    let mut found: Vec<(WordKey, u32)> = Vec::new();
    for cp_idx in start_idx..checkpoints.len() {
        // Past the last span that can hold the prefix
        let first_word = checkpoints[cp_idx].key.keyword_bytes();
        if first_word > prefix && !first_word.starts_with(prefix) {
            break;
        }
        scan_span(view, checkpoints, cp_idx, &mut |key, doc_count| {
            let word = key.keyword_bytes();
            if word.starts_with(prefix) {
                found.push((key.clone(), doc_count));
            }
            // Keep scanning until the span walks past the prefix range
            word <= prefix || word.starts_with(prefix)
        });
    }
    cap_by_frequency(found, limit)
}

/// Expand `*infix*`: the per-checkpoint bloom filter prunes spans that
/// cannot contain the n-grams, the survivors are scanned
pub fn expand_infix(view: &dyn PostingsView, infix: &[u8], limit: usize) -> Vec<WordKey> {
    let checkpoints = view.checkpoints();
    if checkpoints.is_empty() || infix.is_empty() {
        return Vec::new();
    }
    let bloom = view.infix_bloom();

    let mut found: Vec<(WordKey, u32)> = Vec::new();
    for cp_idx in 0..checkpoints.len() {
        if let Some(bloom) = bloom
            && !bloom.may_match(cp_idx, infix)
        {
            continue;
        }
        scan_span(view, checkpoints, cp_idx, &mut |key, doc_count| {
            if contains(key.keyword_bytes(), infix) {
                found.push((key.clone(), doc_count));
            }
            true
        });
    }
    cap_by_frequency(found, limit)
}

fn scan_span(
    view: &dyn PostingsView,
    checkpoints: &[Checkpoint],
    cp_idx: usize,
    visit: &mut dyn FnMut(&WordKey, u32) -> bool,
) {
    let start = checkpoints[cp_idx].offset;
    let end = span_end(checkpoints, cp_idx, view.words().len());
    for entry in WordlistReader::span(view.words(), view.dict_mode(), start, end) {
        if !visit(&entry.key, entry.doc_count) {
            break;
        }
    }
}

/// Oversize expansions keep the most frequent terms
fn cap_by_frequency(mut found: Vec<(WordKey, u32)>, limit: usize) -> Vec<WordKey> {
    if limit > 0 && found.len() > limit {
        found.sort_by(|a, b| b.1.cmp(&a.1));
        found.truncate(limit);
    }
    found.into_iter().map(|(key, _)| key).collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accum::Accumulator;
    use crate::analysis::PlainDictionary;
    use crate::core::config::RtSettings;
    use crate::core::types::{AttrDef, AttrType, DocId, Document, FieldDef, Schema, pack_position};
    use std::sync::Arc;

    fn indexed_segment(words: &[&str]) -> Arc<crate::segment::ram_segment::RamSegment> {
        let schema = Schema::new(
            vec![AttrDef::new("price", AttrType::Uint)],
            vec![FieldDef::new("title")],
        )
        .unwrap();
        let settings = RtSettings {
            min_infix_len: 2,
            checkpoint_interval: 2,
            ..RtSettings::default()
        };
        let dict = PlainDictionary::default();
        let mut accum = Accumulator::new();
        accum.bind(1, &schema, &settings).unwrap();
        for (i, word) in words.iter().enumerate() {
            let doc = Document::new(DocId(i as u64 + 1));
            let terms = vec![(word.to_string(), pack_position(0, 1))];
            accum.add_document(&doc, false, &terms, &dict).unwrap();
        }
        accum.commit(schema.fingerprint()).unwrap().0.unwrap()
    }

    fn words_of(keys: &[WordKey]) -> Vec<String> {
        let mut words: Vec<String> = keys
            .iter()
            .map(|k| String::from_utf8_lossy(k.keyword_bytes()).to_string())
            .collect();
        words.sort();
        words
    }

    #[test]
    fn test_prefix_expansion() {
        let segment = indexed_segment(&["alpha", "alphanumeric", "beta", "numeric"]);
        let keys = expand_prefix(segment.as_ref(), b"alpha", 0);
        assert_eq!(words_of(&keys), vec!["alpha", "alphanumeric"]);
        assert!(expand_prefix(segment.as_ref(), b"zz", 0).is_empty());
    }

    #[test]
    fn test_infix_expansion_with_bloom() {
        let segment = indexed_segment(&["alpha", "beta", "alphanumeric", "numeric"]);
        let keys = expand_infix(segment.as_ref(), b"lpha", 0);
        assert_eq!(words_of(&keys), vec!["alpha", "alphanumeric"]);
        let keys = expand_infix(segment.as_ref(), b"meri", 0);
        assert_eq!(words_of(&keys), vec!["alphanumeric", "numeric"]);
    }

    #[test]
    fn test_expansion_cap_keeps_frequent() {
        let found = vec![
            (WordKey::Keyword(b"rare".to_vec()), 1),
            (WordKey::Keyword(b"common".to_vec()), 100),
            (WordKey::Keyword(b"mid".to_vec()), 10),
        ];
        let capped = cap_by_frequency(found, 2);
        assert_eq!(words_of(&capped), vec!["common", "mid"]);
    }
}
