use crate::core::error::Result;
use crate::core::types::RowId;
use crate::search::expr::{CompiledExpr, RankerHook};
use crate::search::extended::{ExtMatch, MatchStream};
use crate::search::factors::{DocFactors, QueryContext, compute_factors, pack_factors};

/// Candidate matches are pulled in blocks of at most this many documents
pub const MAX_BLOCK_DOCS: usize = 32;

/// Ranking mode selected by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum RankerKind {
    /// Constant weight 1
    None,
    /// Field-weighted hit count
    WordCount,
    Bm25,
    /// Field-weighted LCS only
    Proximity,
    /// Default: field-weighted LCS plus BM25
    ProximityBm25,
    MatchAny,
    /// The matched-fields mask as the weight
    Fieldmask,
    /// Proximity with field-start and exact-hit bonuses
    Sph04,
    /// User expression over ranking factors
    Expr(String),
    /// Like Expr, but each match also carries the packed factor blob
    Export(String),
}

/// One scored candidate produced by a ranker block
#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub row_id: RowId,
    pub score: f32,
    pub fields_mask: u32,
    pub factors: Option<Vec<u8>>,
}

/// Drives one segment's extended-node tree and scores its matches.
/// `get_matches` fills the shared block buffer with up to
/// `MAX_BLOCK_DOCS` scored candidates.
pub struct Ranker<'a> {
    root: Box<dyn MatchStream + 'a>,
    ctx: QueryContext,
    kind: RankerKind,
    expr: Option<CompiledExpr>,
    hook: Option<&'a dyn RankerHook>,
    next_target: RowId,
    done: bool,
}

impl<'a> Ranker<'a> {
    pub fn new(
        root: Box<dyn MatchStream + 'a>,
        ctx: QueryContext,
        kind: RankerKind,
        hook: Option<&'a dyn RankerHook>,
    ) -> Result<Self> {
        let expr = match &kind {
            RankerKind::Expr(text) | RankerKind::Export(text) => {
                Some(CompiledExpr::parse(text, hook)?)
            }
            _ => None,
        };
        Ok(Ranker {
            root,
            ctx,
            kind,
            expr,
            hook,
            next_target: 0,
            done: false,
        })
    }

    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    /// Pull the next block; returns the number of matches delivered,
    /// zero when the segment is exhausted
    pub fn get_matches(&mut self, out: &mut Vec<ScoredMatch>) -> usize {
        out.clear();
        if self.done {
            return 0;
        }
        while out.len() < MAX_BLOCK_DOCS {
            let Some(m) = self.root.advance(self.next_target) else {
                self.done = true;
                break;
            };
            let m = m.clone();
            self.next_target = m.row_id + 1;
            let (score, factors) = self.score(&m);
            out.push(ScoredMatch {
                row_id: m.row_id,
                score,
                fields_mask: m.fields_mask,
                factors,
            });
        }
        out.len()
    }

    fn score(&self, m: &ExtMatch) -> (f32, Option<Vec<u8>>) {
        match &self.kind {
            RankerKind::None => (1.0, None),
            RankerKind::Fieldmask => (m.fields_mask as f32, None),
            RankerKind::WordCount => {
                let score = m
                    .hits
                    .iter()
                    .map(|h| {
                        self.ctx
                            .field_weight(crate::core::types::position_field(h.position))
                    })
                    .sum();
                (score, None)
            }
            _ => {
                let doc = compute_factors(m, &self.ctx);
                let score = self.score_factors(&doc);
                let factors = matches!(self.kind, RankerKind::Export(_))
                    .then(|| pack_factors(&doc));
                (score, factors)
            }
        }
    }

    fn score_factors(&self, doc: &DocFactors) -> f32 {
        match &self.kind {
            RankerKind::Bm25 => doc.bm25,
            RankerKind::Proximity => self.proximity_sum(doc, false),
            RankerKind::ProximityBm25 => self.proximity_sum(doc, false) * 1000.0 + doc.bm25,
            RankerKind::Sph04 => self.proximity_sum(doc, true) * 1000.0 + doc.bm25,
            RankerKind::MatchAny => doc
                .fields
                .iter()
                .map(|f| {
                    self.ctx.field_weight(f.field)
                        * (f.lcs as f32
                            + f.word_count as f32 / self.ctx.num_terms.max(1) as f32)
                })
                .sum(),
            RankerKind::Expr(_) | RankerKind::Export(_) => self
                .expr
                .as_ref()
                .map_or(0.0, |e| e.eval(doc, &self.ctx, self.hook)),
            RankerKind::None | RankerKind::Fieldmask | RankerKind::WordCount => 0.0,
        }
    }

    /// Σ lcs × field weight, with sph04's field-start and whole-field
    /// bonuses when requested
    fn proximity_sum(&self, doc: &DocFactors, sph04_bonuses: bool) -> f32 {
        doc.fields
            .iter()
            .map(|f| {
                let mut lcs = f.lcs as f32;
                if sph04_bonuses {
                    if f.min_best_span_pos == 1 {
                        lcs += 2.0;
                    }
                    if f.exact_hit {
                        lcs += 1.0;
                    }
                }
                lcs * self.ctx.field_weight(f.field)
            })
            .sum()
    }
}
