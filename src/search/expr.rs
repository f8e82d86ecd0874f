//! Arithmetic expressions over ranking factors, used by the expression
//! and export rankers. Doc-level factors are plain identifiers; field
//! factors live inside an aggregation like `sum(lcs*user_weight)`.

use crate::core::error::{Error, ErrorKind, Result};
use crate::search::factors::{DocFactors, FieldFactors, QueryContext};

/// Embedder extension point: resolves unknown identifiers to custom
/// factor ids and evaluates them per document
pub trait RankerHook: Send + Sync {
    fn resolve(&self, name: &str) -> Option<u32>;

    fn value(&self, id: u32, doc: &DocFactors) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocSel {
    Bm25,
    Bm25a,
    Bm25f,
    FieldMask,
    DocWordCount,
    DocHitCount,
    QueryWordCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldSel {
    Lcs,
    Lccs,
    Wlccs,
    Atc,
    MinGaps,
    MaxWindowHits,
    HitCount,
    WordCount,
    TfIdf,
    ExactHit,
    ExactOrder,
    MinBestSpanPos,
    SumIdf,
    UserWeight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Agg {
    Sum,
    Max,
    Min,
    Avg,
}

#[derive(Debug, Clone)]
enum Expr {
    Const(f32),
    Doc(DocSel),
    Agg(Agg, Box<FieldExpr>),
    Hook(u32),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum FieldExpr {
    Const(f32),
    Sel(FieldSel),
    Add(Box<FieldExpr>, Box<FieldExpr>),
    Sub(Box<FieldExpr>, Box<FieldExpr>),
    Mul(Box<FieldExpr>, Box<FieldExpr>),
    Div(Box<FieldExpr>, Box<FieldExpr>),
}

/// A parsed, reusable ranking expression
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: Expr,
}

impl CompiledExpr {
    pub fn parse(text: &str, hook: Option<&dyn RankerHook>) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            hook,
        };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("trailing input in ranking expression '{text}'"),
            ));
        }
        Ok(CompiledExpr { root })
    }

    pub fn eval(
        &self,
        doc: &DocFactors,
        ctx: &QueryContext,
        hook: Option<&dyn RankerHook>,
    ) -> f32 {
        eval_expr(&self.root, doc, ctx, hook)
    }
}

fn eval_expr(
    expr: &Expr,
    doc: &DocFactors,
    ctx: &QueryContext,
    hook: Option<&dyn RankerHook>,
) -> f32 {
    match expr {
        Expr::Const(v) => *v,
        Expr::Doc(sel) => match sel {
            DocSel::Bm25 => doc.bm25,
            DocSel::Bm25a => doc.bm25a,
            DocSel::Bm25f => doc.bm25f,
            DocSel::FieldMask => doc.field_mask as f32,
            DocSel::DocWordCount => doc.doc_word_count as f32,
            DocSel::DocHitCount => doc.doc_hit_count as f32,
            DocSel::QueryWordCount => ctx.num_terms as f32,
        },
        Expr::Agg(agg, inner) => {
            let values = doc
                .fields
                .iter()
                .map(|f| eval_field(inner, f, ctx))
                .collect::<Vec<f32>>();
            if values.is_empty() {
                return 0.0;
            }
            match agg {
                Agg::Sum => values.iter().sum(),
                Agg::Max => values.iter().cloned().fold(f32::MIN, f32::max),
                Agg::Min => values.iter().cloned().fold(f32::MAX, f32::min),
                Agg::Avg => values.iter().sum::<f32>() / values.len() as f32,
            }
        }
        Expr::Hook(id) => hook.map_or(0.0, |h| h.value(*id, doc)),
        Expr::Add(a, b) => eval_expr(a, doc, ctx, hook) + eval_expr(b, doc, ctx, hook),
        Expr::Sub(a, b) => eval_expr(a, doc, ctx, hook) - eval_expr(b, doc, ctx, hook),
        Expr::Mul(a, b) => eval_expr(a, doc, ctx, hook) * eval_expr(b, doc, ctx, hook),
        Expr::Div(a, b) => {
            let d = eval_expr(b, doc, ctx, hook);
            if d == 0.0 {
                0.0
            } else {
                eval_expr(a, doc, ctx, hook) / d
            }
        }
    }
}

fn eval_field(expr: &FieldExpr, f: &FieldFactors, ctx: &QueryContext) -> f32 {
    match expr {
        FieldExpr::Const(v) => *v,
        FieldExpr::Sel(sel) => match sel {
            FieldSel::Lcs => f.lcs as f32,
            FieldSel::Lccs => f.lccs as f32,
            FieldSel::Wlccs => f.wlccs,
            FieldSel::Atc => f.atc,
            FieldSel::MinGaps => f.min_gaps as f32,
            FieldSel::MaxWindowHits => f.max_window_hits as f32,
            FieldSel::HitCount => f.hit_count as f32,
            FieldSel::WordCount => f.word_count as f32,
            FieldSel::TfIdf => f.sum_idf * f.hit_count as f32 / f.hit_count.max(1) as f32,
            FieldSel::ExactHit => f.exact_hit as u32 as f32,
            FieldSel::ExactOrder => f.exact_order as u32 as f32,
            FieldSel::MinBestSpanPos => f.min_best_span_pos as f32,
            FieldSel::SumIdf => f.sum_idf,
            FieldSel::UserWeight => ctx.field_weight(f.field),
        },
        FieldExpr::Add(a, b) => eval_field(a, f, ctx) + eval_field(b, f, ctx),
        FieldExpr::Sub(a, b) => eval_field(a, f, ctx) - eval_field(b, f, ctx),
        FieldExpr::Mul(a, b) => eval_field(a, f, ctx) * eval_field(b, f, ctx),
        FieldExpr::Div(a, b) => {
            let d = eval_field(b, f, ctx);
            if d == 0.0 { 0.0 } else { eval_field(a, f, ctx) / d }
        }
    }
}

// --- parsing ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f32),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num.parse::<f32>().map_err(|_| {
                    Error::new(ErrorKind::Parse, format!("bad number '{num}' in expression"))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("unexpected character '{other}' in expression"),
                ));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    hook: Option<&'a dyn RankerHook>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(Error::new(
                ErrorKind::Parse,
                format!("expected {token:?}, found {other:?}"),
            )),
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    left = Expr::Add(Box::new(left), Box::new(self.term()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    left = Expr::Sub(Box::new(left), Box::new(self.term()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    left = Expr::Mul(Box::new(left), Box::new(self.factor()?));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    left = Expr::Div(Box::new(left), Box::new(self.factor()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn factor(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Const(v)),
            Some(Token::Minus) => Ok(Expr::Sub(
                Box::new(Expr::Const(0.0)),
                Box::new(self.factor()?),
            )),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.ident(&name),
            other => Err(Error::new(
                ErrorKind::Parse,
                format!("unexpected token {other:?} in expression"),
            )),
        }
    }

    fn ident(&mut self, name: &str) -> Result<Expr> {
        let agg = match name {
            "sum" => Some(Agg::Sum),
            "max" => Some(Agg::Max),
            "min" => Some(Agg::Min),
            "avg" => Some(Agg::Avg),
            _ => None,
        };
        if let Some(agg) = agg {
            self.expect(Token::LParen)?;
            let inner = self.field_expr()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::Agg(agg, Box::new(inner)));
        }

        let doc = match name {
            "bm25" => Some(DocSel::Bm25),
            "bm25a" => Some(DocSel::Bm25a),
            "bm25f" => Some(DocSel::Bm25f),
            "field_mask" => Some(DocSel::FieldMask),
            "doc_word_count" => Some(DocSel::DocWordCount),
            "doc_hit_count" => Some(DocSel::DocHitCount),
            "query_word_count" => Some(DocSel::QueryWordCount),
            _ => None,
        };
        if let Some(sel) = doc {
            return Ok(Expr::Doc(sel));
        }

        if let Some(hook) = self.hook
            && let Some(id) = hook.resolve(name)
        {
            return Ok(Expr::Hook(id));
        }
        Err(Error::new(
            ErrorKind::Parse,
            format!("unknown factor '{name}' in ranking expression"),
        ))
    }

    fn field_expr(&mut self) -> Result<FieldExpr> {
        let mut left = self.field_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    left = FieldExpr::Add(Box::new(left), Box::new(self.field_term()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    left = FieldExpr::Sub(Box::new(left), Box::new(self.field_term()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn field_term(&mut self) -> Result<FieldExpr> {
        let mut left = self.field_factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    left = FieldExpr::Mul(Box::new(left), Box::new(self.field_factor()?));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    left = FieldExpr::Div(Box::new(left), Box::new(self.field_factor()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn field_factor(&mut self) -> Result<FieldExpr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(FieldExpr::Const(v)),
            Some(Token::LParen) => {
                let inner = self.field_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let sel = match name.as_str() {
                    "lcs" => FieldSel::Lcs,
                    "lccs" => FieldSel::Lccs,
                    "wlccs" => FieldSel::Wlccs,
                    "atc" => FieldSel::Atc,
                    "min_gaps" => FieldSel::MinGaps,
                    "max_window_hits" => FieldSel::MaxWindowHits,
                    "hit_count" => FieldSel::HitCount,
                    "word_count" => FieldSel::WordCount,
                    "tf_idf" => FieldSel::TfIdf,
                    "exact_hit" => FieldSel::ExactHit,
                    "exact_order" => FieldSel::ExactOrder,
                    "min_best_span_pos" => FieldSel::MinBestSpanPos,
                    "sum_idf" => FieldSel::SumIdf,
                    "user_weight" => FieldSel::UserWeight,
                    other => {
                        return Err(Error::new(
                            ErrorKind::Parse,
                            format!("unknown field factor '{other}'"),
                        ));
                    }
                };
                Ok(FieldExpr::Sel(sel))
            }
            other => Err(Error::new(
                ErrorKind::Parse,
                format!("unexpected token {other:?} in field expression"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::factors::FieldFactors;

    fn sample() -> (DocFactors, QueryContext) {
        let doc = DocFactors {
            field_mask: 0b11,
            doc_hit_count: 4,
            doc_word_count: 2,
            bm25: 1.5,
            bm25a: 1.2,
            bm25f: 1.8,
            fields: vec![
                FieldFactors {
                    field: 0,
                    lcs: 2,
                    hit_count: 3,
                    ..FieldFactors::default()
                },
                FieldFactors {
                    field: 1,
                    lcs: 1,
                    hit_count: 1,
                    ..FieldFactors::default()
                },
            ],
        };
        let ctx = QueryContext {
            num_terms: 2,
            idf: vec![0.5, 0.5],
            field_weights: vec![1.0, 3.0],
            total_docs: 10,
            avg_doc_hits: 2.0,
        };
        (doc, ctx)
    }

    #[test]
    fn test_default_proximity_expression() {
        let (doc, ctx) = sample();
        let expr = CompiledExpr::parse("sum(lcs*user_weight)*1000 + bm25", None).unwrap();
        // field 0: 2*1, field 1: 1*3 => 5 * 1000 + 1.5
        let score = expr.eval(&doc, &ctx, None);
        assert!((score - 5001.5).abs() < 0.01);
    }

    #[test]
    fn test_precedence_and_parens() {
        let (doc, ctx) = sample();
        let expr = CompiledExpr::parse("2 + 3 * 4", None).unwrap();
        assert_eq!(expr.eval(&doc, &ctx, None), 14.0);
        let expr = CompiledExpr::parse("(2 + 3) * 4", None).unwrap();
        assert_eq!(expr.eval(&doc, &ctx, None), 20.0);
    }

    #[test]
    fn test_hook_resolution() {
        struct Hook;
        impl RankerHook for Hook {
            fn resolve(&self, name: &str) -> Option<u32> {
                (name == "my_factor").then_some(7)
            }
            fn value(&self, id: u32, _doc: &DocFactors) -> f32 {
                id as f32
            }
        }
        let (doc, ctx) = sample();
        let hook = Hook;
        let expr = CompiledExpr::parse("my_factor * 2", Some(&hook)).unwrap();
        assert_eq!(expr.eval(&doc, &ctx, Some(&hook)), 14.0);

        assert!(CompiledExpr::parse("nonsense", None).is_err());
    }
}
