// dtype.rs — Element types and the dtype expression language
//
// Schemas name sets of dtypes with short expressions: a family name, an
// optional bit width, and an optional `+` (that width and wider) or `-`
// (that width and narrower). Examples: `int32`, `float`, `uint16+`, `qint8-`.
// Several terms may be joined with commas. Expressions are lexed with `logos`
// and parsed with `chumsky`.
//
// Preconditions: none.
// Postconditions: `parse_dtype_expr` returns a non-empty, de-duplicated set
//                 in canonical dtype order.
// Failure modes: unknown characters, bad grammar, or terms matching no dtype
//                → `DTypeExprError`.
// Side effects: none.

use std::fmt;

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;
use logos::Logos;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── DType ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
    BFloat16,
    Complex64,
    Complex128,
    QInt8,
    QInt16,
    QInt32,
    QUInt8,
    QUInt16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Bool,
    Int,
    UInt,
    Float,
    BFloat,
    Complex,
    QInt,
    QUInt,
}

pub const ALL_DTYPES: [DType; 20] = [
    DType::Bool,
    DType::Int8,
    DType::Int16,
    DType::Int32,
    DType::Int64,
    DType::UInt8,
    DType::UInt16,
    DType::UInt32,
    DType::UInt64,
    DType::Float16,
    DType::Float32,
    DType::Float64,
    DType::BFloat16,
    DType::Complex64,
    DType::Complex128,
    DType::QInt8,
    DType::QInt16,
    DType::QInt32,
    DType::QUInt8,
    DType::QUInt16,
];

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::BFloat16 => "bfloat16",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
            DType::QInt8 => "qint8",
            DType::QInt16 => "qint16",
            DType::QInt32 => "qint32",
            DType::QUInt8 => "quint8",
            DType::QUInt16 => "quint16",
        }
    }

    pub fn from_name(name: &str) -> Option<DType> {
        ALL_DTYPES.into_iter().find(|d| d.name() == name)
    }

    pub fn family(self) -> Family {
        match self {
            DType::Bool => Family::Bool,
            DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64 => Family::Int,
            DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64 => Family::UInt,
            DType::Float16 | DType::Float32 | DType::Float64 => Family::Float,
            DType::BFloat16 => Family::BFloat,
            DType::Complex64 | DType::Complex128 => Family::Complex,
            DType::QInt8 | DType::QInt16 | DType::QInt32 => Family::QInt,
            DType::QUInt8 | DType::QUInt16 => Family::QUInt,
        }
    }

    /// Bit width, or `None` for `bool`.
    pub fn bits(self) -> Option<u32> {
        match self {
            DType::Bool => None,
            DType::Int8 | DType::UInt8 | DType::QInt8 | DType::QUInt8 => Some(8),
            DType::Int16 | DType::UInt16 | DType::QInt16 | DType::QUInt16 => Some(16),
            DType::Float16 | DType::BFloat16 => Some(16),
            DType::Int32 | DType::UInt32 | DType::QInt32 | DType::Float32 => Some(32),
            DType::Int64 | DType::UInt64 | DType::Float64 | DType::Complex64 => Some(64),
            DType::Complex128 => Some(128),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DType {
    type Err = DTypeExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::from_name(s).ok_or_else(|| DTypeExprError::NoMatch(s.to_string()))
    }
}

// ── Lexer ───────────────────────────────────────────────────────────────────

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t]+")]
pub enum Token {
    #[token("bool")]
    Bool,
    #[token("int")]
    Int,
    #[token("uint")]
    UInt,
    #[token("float")]
    Float,
    #[token("bfloat")]
    BFloat,
    #[token("complex")]
    Complex,
    #[token("qint")]
    QInt,
    #[token("quint")]
    QUInt,
    #[regex("[0-9]+", |lex| lex.slice().parse::<u32>().ok())]
    Bits(u32),
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token(",")]
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Bool => write!(f, "bool"),
            Token::Int => write!(f, "int"),
            Token::UInt => write!(f, "uint"),
            Token::Float => write!(f, "float"),
            Token::BFloat => write!(f, "bfloat"),
            Token::Complex => write!(f, "complex"),
            Token::QInt => write!(f, "qint"),
            Token::QUInt => write!(f, "quint"),
            Token::Bits(n) => write!(f, "{n}"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Comma => write!(f, ","),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DTypeExprError {
    #[error("unexpected text {text:?} at offset {offset} in dtype expression")]
    Lex { offset: usize, text: String },
    #[error("malformed dtype expression '{expr}': {message}")]
    Syntax { expr: String, message: String },
    #[error("'{0}' does not name any dtype")]
    NoMatch(String),
}

fn lex(source: &str) -> Result<Vec<(Token, SimpleSpan)>, DTypeExprError> {
    let mut tokens = Vec::new();
    for (result, range) in Token::lexer(source).spanned() {
        match result {
            Ok(token) => tokens.push((token, (range.start..range.end).into())),
            Err(()) => {
                return Err(DTypeExprError::Lex {
                    offset: range.start,
                    text: source[range].to_string(),
                })
            }
        }
    }
    Ok(tokens)
}

// ── Parser ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Exact,
    AtLeast,
    AtMost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Term {
    family: Family,
    width: Option<(u32, Bound)>,
}

impl Term {
    fn matches(&self, dtype: DType) -> bool {
        if dtype.family() != self.family {
            return false;
        }
        match (self.width, dtype.bits()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((w, Bound::Exact)), Some(b)) => b == w,
            (Some((w, Bound::AtLeast)), Some(b)) => b >= w,
            (Some((w, Bound::AtMost)), Some(b)) => b <= w,
        }
    }
}

fn expr_parser<'tokens, I>() -> impl Parser<'tokens, I, Vec<Term>, extra::Err<Rich<'tokens, Token, SimpleSpan>>>
where
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let family = select! {
        Token::Bool => Family::Bool,
        Token::Int => Family::Int,
        Token::UInt => Family::UInt,
        Token::Float => Family::Float,
        Token::BFloat => Family::BFloat,
        Token::Complex => Family::Complex,
        Token::QInt => Family::QInt,
        Token::QUInt => Family::QUInt,
    };
    let bits = select! { Token::Bits(n) => n };
    let bound = select! {
        Token::Plus => Bound::AtLeast,
        Token::Minus => Bound::AtMost,
    };
    let width = bits
        .then(bound.or_not())
        .map(|(w, b)| (w, b.unwrap_or(Bound::Exact)));
    let term = family
        .then(width.or_not())
        .map(|(family, width)| Term { family, width });

    term.separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .then_ignore(end())
}

/// Expand a dtype expression into the set of dtypes it names.
pub fn parse_dtype_expr(source: &str) -> Result<Vec<DType>, DTypeExprError> {
    let tokens = lex(source)?;
    let len = source.len();
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(tokens).map(eoi, |(t, s): (_, _)| (t, s));

    let terms = expr_parser().parse(stream).into_result().map_err(|errs| {
        DTypeExprError::Syntax {
            expr: source.to_string(),
            message: errs
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        }
    })?;

    let mut out = Vec::new();
    for term in &terms {
        let before = out.len();
        for d in ALL_DTYPES {
            if term.matches(d) && !out.contains(&d) {
                out.push(d);
            }
        }
        if out.len() == before && !ALL_DTYPES.iter().any(|&d| term.matches(d)) {
            return Err(DTypeExprError::NoMatch(source.to_string()));
        }
    }
    out.sort();
    Ok(out)
}

/// Expand several expressions and union the results.
pub fn parse_dtype_exprs(sources: &[&str]) -> Result<Vec<DType>, DTypeExprError> {
    let mut out = Vec::new();
    for s in sources {
        for d in parse_dtype_expr(s)? {
            if !out.contains(&d) {
                out.push(d);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_width() {
        assert_eq!(parse_dtype_expr("int32").unwrap(), vec![DType::Int32]);
        assert_eq!(parse_dtype_expr("bfloat16").unwrap(), vec![DType::BFloat16]);
    }

    #[test]
    fn bare_family_is_every_width() {
        assert_eq!(
            parse_dtype_expr("float").unwrap(),
            vec![DType::Float16, DType::Float32, DType::Float64]
        );
        assert_eq!(parse_dtype_expr("bool").unwrap(), vec![DType::Bool]);
    }

    #[test]
    fn plus_and_minus_bounds() {
        assert_eq!(
            parse_dtype_expr("uint16+").unwrap(),
            vec![DType::UInt16, DType::UInt32, DType::UInt64]
        );
        assert_eq!(
            parse_dtype_expr("int16-").unwrap(),
            vec![DType::Int8, DType::Int16]
        );
        assert_eq!(
            parse_dtype_expr("qint8-").unwrap(),
            vec![DType::QInt8]
        );
    }

    #[test]
    fn comma_list_unions() {
        assert_eq!(
            parse_dtype_expr("float64, bfloat16").unwrap(),
            vec![DType::Float64, DType::BFloat16]
        );
    }

    #[test]
    fn uint_is_not_int() {
        assert_eq!(parse_dtype_expr("uint8").unwrap(), vec![DType::UInt8]);
    }

    #[test]
    fn unknown_width_rejected() {
        assert_eq!(
            parse_dtype_expr("int7"),
            Err(DTypeExprError::NoMatch("int7".into()))
        );
    }

    #[test]
    fn bound_without_width_rejected() {
        assert!(matches!(
            parse_dtype_expr("int+"),
            Err(DTypeExprError::Syntax { .. })
        ));
    }

    #[test]
    fn stray_characters_rejected() {
        assert!(matches!(
            parse_dtype_expr("float32?"),
            Err(DTypeExprError::Lex { offset: 7, .. })
        ));
    }

    #[test]
    fn names_round_trip() {
        for d in ALL_DTYPES {
            assert_eq!(DType::from_name(d.name()), Some(d));
        }
    }
}
