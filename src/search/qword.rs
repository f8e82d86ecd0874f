use crate::codec::doclist::{DocEntry, DoclistReader, HitRef};
use crate::codec::hitlist::{HitlistReader, InlineHits};
use crate::codec::wordlist::{
    WordEntry, WordKey, WordlistReader, find_checkpoint, span_end,
};
use crate::core::types::RowId;
use crate::segment::PostingsView;

/// Locate one word in a segment's dictionary: binary search the
/// checkpoint array, then linear-scan the span decoding deltas
pub fn lookup_word(view: &dyn PostingsView, key: &WordKey) -> Option<WordEntry> {
    let checkpoints = view.checkpoints();
    let cp_idx = find_checkpoint(checkpoints, key)?;
    let start = checkpoints[cp_idx].offset;
    let end = span_end(checkpoints, cp_idx, view.words().len());
    WordlistReader::span(view.words(), view.dict_mode(), start, end)
        .take_while(|entry| entry.key <= *key)
        .find(|entry| entry.key == *key)
}

/// Hit-position stream of one doc entry
pub enum HitIter<'a> {
    Inline(InlineHits),
    Stream(HitlistReader<'a>),
    Empty,
}

impl Iterator for HitIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self {
            HitIter::Inline(iter) => iter.next(),
            HitIter::Stream(iter) => iter.next(),
            HitIter::Empty => None,
        }
    }
}

/// Reader state for one query keyword inside one segment or chunk:
/// streams the word's doclist, skipping killed rows, and exposes the hit
/// stream of the current document
pub struct Qword<'a> {
    view: &'a dyn PostingsView,
    pub doc_count: u32,
    pub hit_count: u64,
    pub has_hitlist: bool,
    pub query_pos: u16,
    doclist_offset: u64,
    doclist: DoclistReader<'a>,
    consumed: u32,
    current: Option<DocEntry>,
}

impl<'a> Qword<'a> {
    pub fn open(view: &'a dyn PostingsView, key: &WordKey, query_pos: u16) -> Option<Self> {
        let entry = lookup_word(view, key)?;
        Some(Self::from_entry(view, &entry, query_pos))
    }

    pub fn from_entry(view: &'a dyn PostingsView, entry: &WordEntry, query_pos: u16) -> Self {
        Qword {
            view,
            doc_count: entry.doc_count,
            hit_count: entry.hit_count,
            has_hitlist: entry.has_hitlist,
            query_pos,
            doclist_offset: entry.doclist_offset,
            doclist: DoclistReader::new(view.docs(), entry.doclist_offset as usize, entry.doc_count),
            consumed: 0,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&DocEntry> {
        self.current.as_ref()
    }

    /// Next alive document
    pub fn advance(&mut self) -> Option<&DocEntry> {
        loop {
            let entry = self.doclist.next()?;
            self.consumed += 1;
            if !self.view.is_row_dead(entry.row_id) {
                self.current = Some(entry);
                return self.current.as_ref();
            }
        }
    }

    /// First alive document with `row_id >= target`, jumping through the
    /// skiplist when the gap is large enough to matter
    pub fn seek(&mut self, target: RowId) -> Option<&DocEntry> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        if let Some(block) = self.view.skiplist_block(self.doclist_offset) {
            // Jump to the last waypoint strictly before the target that
            // is also ahead of the decoder
            let mut jump = None;
            for entry in &block {
                if entry.row_id >= target {
                    break;
                }
                if entry.docs_consumed > self.consumed {
                    jump = Some(*entry);
                }
            }
            if let Some(entry) = jump {
                self.doclist = DoclistReader::resume(
                    self.view.docs(),
                    entry.doclist_offset as usize,
                    self.doc_count - entry.docs_consumed,
                    entry.row_id,
                );
                self.consumed = entry.docs_consumed;
            }
        }
        loop {
            self.advance()?;
            if self.current.as_ref().is_some_and(|e| e.row_id >= target) {
                return self.current.as_ref();
            }
        }
    }

    /// Hit stream of the current document
    pub fn hits(&self) -> HitIter<'a> {
        match self.current {
            Some(DocEntry {
                hit_ref: HitRef::Inline(pos),
                ..
            }) => HitIter::Inline(HitlistReader::inline(pos)),
            Some(DocEntry {
                hit_ref: HitRef::Offset(offset),
                hit_count,
                ..
            }) if hit_count > 0 && self.has_hitlist => {
                HitIter::Stream(HitlistReader::new(self.view.hits(), offset as usize))
            }
            _ => HitIter::Empty,
        }
    }
}
