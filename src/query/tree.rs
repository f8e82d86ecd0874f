//! Parsed query tree handed to the executor. Protocol front ends build
//! this in-process; the core never parses query text itself beyond the
//! convenience constructors below.

/// Wildcard expansion requested for one term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermExpand {
    Exact,
    /// `foo*`
    Prefix,
    /// `*foo*`
    Infix,
}

/// One keyword leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermNode {
    /// Normalized keyword text (without wildcard markers)
    pub word: String,
    /// Restrict matching to these fields; None means all
    pub fields: Option<u32>,
    pub expand: TermExpand,
}

impl TermNode {
    pub fn new(word: impl Into<String>) -> Self {
        let word = word.into();
        // Convenience: wildcard markers in the text select the expansion
        let (word, expand) = match (word.starts_with('*'), word.ends_with('*')) {
            (true, _) => (word.trim_matches('*').to_string(), TermExpand::Infix),
            (false, true) => (word.trim_end_matches('*').to_string(), TermExpand::Prefix),
            (false, false) => (word, TermExpand::Exact),
        };
        TermNode {
            word,
            fields: None,
            expand,
        }
    }

    pub fn in_fields(mut self, mask: u32) -> Self {
        self.fields = Some(mask);
        self
    }
}

/// Boolean/positional combinators over keyword terms
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    Term(TermNode),
    /// Terms adjacent, in order
    Phrase(Vec<TermNode>),
    /// All terms within a window, any order (`"..."~N`)
    Proximity { terms: Vec<TermNode>, window: u32 },
    /// Terms in order, each within `distance` of the previous (NEAR/N)
    Near { terms: Vec<TermNode>, distance: u32 },
    /// Terms in order, any distance (`a << b`)
    Before(Vec<TermNode>),
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    AndNot {
        include: Box<QueryNode>,
        exclude: Box<QueryNode>,
    },
    /// Matches `main`; `boost` only contributes ranking signal
    Maybe {
        main: Box<QueryNode>,
        boost: Box<QueryNode>,
    },
    /// At least `min_match` of the terms present
    Quorum { terms: Vec<TermNode>, min_match: u32 },
    /// Sub-query constrained to hits inside the named zone
    Zone { name: String, node: Box<QueryNode> },
    /// Sub-query constrained to one sentence
    Sentence(Box<QueryNode>),
    /// Sub-query constrained to one paragraph
    Paragraph(Box<QueryNode>),
    MatchAll,
}

impl QueryNode {
    /// Bag-of-words helper: OR of the given keywords
    pub fn any_of(words: &[&str]) -> QueryNode {
        QueryNode::Or(
            words
                .iter()
                .map(|w| QueryNode::Term(TermNode::new(*w)))
                .collect(),
        )
    }

    /// All keywords required
    pub fn all_of(words: &[&str]) -> QueryNode {
        QueryNode::And(
            words
                .iter()
                .map(|w| QueryNode::Term(TermNode::new(*w)))
                .collect(),
        )
    }

    /// Every distinct term in the tree, in query order; gives each leaf
    /// its query position for ranking factors
    pub fn collect_terms(&self) -> Vec<TermNode> {
        let mut terms = Vec::new();
        self.walk_terms(&mut terms);
        terms
    }

    fn walk_terms(&self, out: &mut Vec<TermNode>) {
        match self {
            QueryNode::Term(t) => out.push(t.clone()),
            QueryNode::Phrase(ts)
            | QueryNode::Proximity { terms: ts, .. }
            | QueryNode::Near { terms: ts, .. }
            | QueryNode::Before(ts)
            | QueryNode::Quorum { terms: ts, .. } => out.extend(ts.iter().cloned()),
            QueryNode::And(children) | QueryNode::Or(children) => {
                for child in children {
                    child.walk_terms(out);
                }
            }
            QueryNode::AndNot { include, .. } => include.walk_terms(out),
            QueryNode::Maybe { main, boost } => {
                main.walk_terms(out);
                boost.walk_terms(out);
            }
            QueryNode::Zone { node, .. }
            | QueryNode::Sentence(node)
            | QueryNode::Paragraph(node) => node.walk_terms(out),
            QueryNode::MatchAll => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_detection() {
        assert_eq!(TermNode::new("plain").expand, TermExpand::Exact);
        let prefix = TermNode::new("pre*");
        assert_eq!(prefix.expand, TermExpand::Prefix);
        assert_eq!(prefix.word, "pre");
        let infix = TermNode::new("*fix*");
        assert_eq!(infix.expand, TermExpand::Infix);
        assert_eq!(infix.word, "fix");
    }

    #[test]
    fn test_collect_terms_orders_leaves() {
        let tree = QueryNode::And(vec![
            QueryNode::Term(TermNode::new("a")),
            QueryNode::Phrase(vec![TermNode::new("b"), TermNode::new("c")]),
        ]);
        let words: Vec<String> = tree.collect_terms().into_iter().map(|t| t.word).collect();
        assert_eq!(words, vec!["a", "b", "c"]);
    }
}
