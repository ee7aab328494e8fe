// diag.rs — Diagnostics and user-facing reports
//
// Shared diagnostic types used by the checker and the CLI, the local
// `ErrorReport`s raised by argument predicates, and the tabular fix report
// that shows how each argument was interpreted and what must change.
//
// Preconditions: none (types and pure renderers).
// Postconditions: rendering is deterministic for a given input.
// Failure modes: none.
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::args::CallArgs;
use crate::fix::{split_key, Fix, Slot, WorkingShape};
use crate::model::IndexCode;
use crate::schema::{ArgKind, OpDef};

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0400`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // Local argument errors.
    pub const MISSING_ARGUMENT: DiagCode = DiagCode("E0100");
    pub const WRONG_KIND: DiagCode = DiagCode("E0101");
    pub const NEGATIVE_DIM: DiagCode = DiagCode("E0102");
    pub const OUT_OF_RANGE: DiagCode = DiagCode("E0103");
    pub const NON_RECTANGULAR: DiagCode = DiagCode("E0104");
    // Search outcomes.
    pub const SUGGESTED_FIX: DiagCode = DiagCode("E0200");
    pub const NO_FIX_FOUND: DiagCode = DiagCode("E0201");
    // Return values.
    pub const RETURN_COUNT: DiagCode = DiagCode("E0300");
    pub const RETURN_KIND: DiagCode = DiagCode("E0301");
    pub const RETURN_SHAPE: DiagCode = DiagCode("E0302");
    // Schema inventory.
    pub const UNUSED_INDEX: DiagCode = DiagCode("W0400");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related argument ─────────────────────────────────────────────────────

/// An argument providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedArg {
    pub arg: String,
    pub label: String,
}

/// One link in a cause chain, e.g. a step of a formula derivation.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub arg: Option<String>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub arg: Option<String>,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<RelatedArg>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, arg: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            arg: arg.map(str::to_string),
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, arg: &str, label: impl Into<String>) -> Self {
        self.related.push(RelatedArg {
            arg: arg.to_string(),
            label: label.into(),
        });
        self
    }

    pub fn with_cause(mut self, message: impl Into<String>, arg: Option<&str>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            arg: arg.map(str::to_string),
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        match &self.code {
            Some(code) => write!(f, "{}[{}]: {}", level, code, self.message)?,
            None => write!(f, "{}: {}", level, self.message)?,
        }
        for r in &self.related {
            write!(f, "\n  --> {}: {}", r.arg, r.label)?;
        }
        for c in &self.cause_chain {
            write!(f, "\n  = {}", c.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Local error reports ──────────────────────────────────────────────────

/// Unrepairable problem with a single argument, found before any search.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorReport {
    #[error("argument '{arg}' is required")]
    MissingArgument { arg: String },
    #[error("argument '{arg}' must be {expected}, got {got}")]
    WrongKind {
        arg: String,
        expected: &'static str,
        got: String,
    },
    #[error("argument '{arg}' has negative dimension {dim} at position {pos}")]
    NegativeDim { arg: String, pos: usize, dim: i64 },
    #[error("argument '{arg}' = {value} is outside [{lo}, {hi}]")]
    OutOfRange { arg: String, value: i64, lo: i64, hi: i64 },
    #[error("argument '{arg}' must be a rectangular 2-D shape tensor with {cols} columns")]
    NonRectangular { arg: String, cols: usize },
    #[error("expected {expected} return values, got {got}")]
    ReturnCount { expected: usize, got: usize },
    #[error("return value {index} must be a tensor, got {got}")]
    ReturnKind { index: usize, got: String },
    #[error("return value {index} has shape {got}, expected {expected}")]
    ReturnShape {
        index: usize,
        expected: String,
        got: String,
    },
}

impl ErrorReport {
    pub fn arg(&self) -> Option<&str> {
        match self {
            ErrorReport::MissingArgument { arg }
            | ErrorReport::WrongKind { arg, .. }
            | ErrorReport::NegativeDim { arg, .. }
            | ErrorReport::OutOfRange { arg, .. }
            | ErrorReport::NonRectangular { arg, .. } => Some(arg),
            _ => None,
        }
    }

    pub fn code(&self) -> DiagCode {
        match self {
            ErrorReport::MissingArgument { .. } => codes::MISSING_ARGUMENT,
            ErrorReport::WrongKind { .. } => codes::WRONG_KIND,
            ErrorReport::NegativeDim { .. } => codes::NEGATIVE_DIM,
            ErrorReport::OutOfRange { .. } => codes::OUT_OF_RANGE,
            ErrorReport::NonRectangular { .. } => codes::NON_RECTANGULAR,
            ErrorReport::ReturnCount { .. } => codes::RETURN_COUNT,
            ErrorReport::ReturnKind { .. } => codes::RETURN_KIND,
            ErrorReport::ReturnShape { .. } => codes::RETURN_SHAPE,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        Diagnostic::new(DiagLevel::Error, self.arg(), self.to_string()).with_code(self.code())
    }
}

// ── Fix reports ──────────────────────────────────────────────────────────

/// Diagnostic summarising one suggested fix.
pub fn fix_diagnostic(op: &str, fix: &Fix, rank: usize) -> Diagnostic {
    let mut d = Diagnostic::new(
        DiagLevel::Error,
        None,
        format!("{op}: suggested fix #{rank} (cost {})", fix.cost()),
    )
    .with_code(codes::SUGGESTED_FIX);
    for e in fix.edits() {
        d = d.with_related(&e.arg, e.describe());
    }
    if let Some((combo, _)) = &fix.dtypes.excluded {
        d = d.with_cause(format!("dtype combination {combo} is not implemented"), None);
    }
    for v in &fix.shape.violations {
        d = d.with_cause(format!("{} fails: {}", v.predicate, v.detail), None);
        for t in &v.trail {
            d = d.with_cause(format!("{} = {}  ({})", t.index, t.code, t.dims), None);
        }
    }
    d
}

/// Table of every shape argument: submitted dims, the index each position
/// was read as, `^` under positions that change, and the corrected dims.
pub fn fix_table(fix: &Fix, args: &CallArgs) -> String {
    let mut header = vec![String::new()];
    let mut submitted = vec!["submitted".to_string()];
    let mut interp = vec!["interpretation".to_string()];
    let mut marks = vec![String::new()];
    let mut corrected = vec!["corrected".to_string()];

    for (key, sig) in fix.shape.sigs.iter() {
        let Some(working) = fix.shape.working.iter().find(|(k, _)| k == key).map(|(_, w)| w) else {
            continue;
        };
        let repaired = fix.shape.repaired(key).unwrap_or_default();
        let letters: Vec<IndexCode> = sig
            .iter()
            .flat_map(|c| {
                let r = fix.shape.index_ranks.get(&c).copied().unwrap_or(0) as usize;
                std::iter::repeat(c).take(r)
            })
            .collect();
        let slots: Vec<Option<i64>> = match working {
            WorkingShape::Dims(s) => s
                .iter()
                .map(|s| match s {
                    Slot::Observed(v) => Some(*v),
                    Slot::Inserted => None,
                })
                .collect(),
            WorkingShape::Bcast(v) => vec![Some(*v); letters.len()],
        };

        let mut cols: Vec<[String; 4]> = Vec::new();
        for (p, slot) in slots.iter().enumerate() {
            let fixed = repaired.get(p).copied();
            let changed = slot.is_none() || *slot != fixed;
            cols.push([
                slot.map_or("_".to_string(), |v| v.to_string()),
                letters.get(p).map_or("?".to_string(), |c| c.to_string()),
                if changed { "^".to_string() } else { String::new() },
                fixed.map_or("?".to_string(), |v| v.to_string()),
            ]);
        }
        let width = |i: usize| cols.iter().map(|c| c[i].len()).max().unwrap_or(0);
        let w = (0..4).map(width).max().unwrap_or(0);
        let row = |i: usize| {
            let cells: Vec<String> = cols.iter().map(|c| format!("{:<w$}", c[i])).collect();
            cells.join(" ")
        };

        let (name, _) = split_key(key);
        let label = match args.get(name) {
            Some(v) if v.kind() == "tensor" => format!("{key} ({sig})"),
            _ => format!("{key} [{sig}]"),
        };
        header.push(label);
        submitted.push(row(0));
        interp.push(row(1));
        marks.push(row(2));
        corrected.push(row(3));
    }

    tabulate(&[header, submitted, interp, marks, corrected])
}

/// Left-aligned text table, columns separated by ` | `.
pub fn tabulate(rows: &[Vec<String>]) -> String {
    let ncols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let widths: Vec<usize> = (0..ncols)
        .map(|c| {
            rows.iter()
                .filter_map(|r| r.get(c))
                .map(|s| s.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();
    let mut out = String::new();
    for r in rows {
        let cells: Vec<String> = (0..ncols)
            .map(|c| {
                let cell = r.get(c).map(String::as_str).unwrap_or("");
                format!("{:<w$}", cell, w = widths[c])
            })
            .collect();
        out.push_str(cells.join(" | ").trim_end());
        out.push('\n');
    }
    out
}

/// Full human-readable report for a list of fixes.
pub fn render_fixes(op: &str, fixes: &[Fix], args: &CallArgs) -> String {
    let mut out = String::new();
    for (i, fix) in fixes.iter().enumerate() {
        out.push_str(&fix_diagnostic(op, fix, i + 1).to_string());
        out.push('\n');
        out.push_str(&fix_table(fix, args));
        out.push('\n');
    }
    out
}

/// Warnings for declared indices that no argument, return value or
/// formula refers to.
pub fn unused_index_warnings(def: &OpDef) -> Vec<Diagnostic> {
    let mut used: BTreeSet<IndexCode> = BTreeSet::new();
    for a in &def.args {
        used.extend(a.sigs.iter().flat_map(|s| s.iter()));
        if let ArgKind::ShapeTensor2D { columns } = &a.kind {
            used.extend(columns.iter().flatten().flat_map(|s| s.iter()));
        }
    }
    used.extend(def.returns.iter().flatten().flat_map(|s| s.iter()));
    for ci in &def.computed {
        used.insert(ci.out);
        used.extend(ci.inputs.iter());
    }
    def.indices
        .iter()
        .filter(|i| !used.contains(&i.code))
        .map(|i| {
            Diagnostic::new(
                DiagLevel::Warning,
                None,
                format!("index '{}' ({}) is never used", i.code, i.desc),
            )
            .with_code(codes::UNUSED_INDEX)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, None, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_related() {
        let d = Diagnostic::new(DiagLevel::Warning, None, "index never used")
            .with_code(codes::UNUSED_INDEX)
            .with_related("input", "declared here")
            .with_hint("remove the index");
        assert_eq!(
            format!("{d}"),
            "warning[W0400]: index never used\n  --> input: declared here\n  hint: remove the index"
        );
    }

    #[test]
    fn error_report_diagnostic() {
        let r = ErrorReport::NegativeDim {
            arg: "x".into(),
            pos: 1,
            dim: -2,
        };
        let d = r.diagnostic();
        assert_eq!(d.code, Some(codes::NEGATIVE_DIM));
        assert_eq!(d.arg.as_deref(), Some("x"));
        assert_eq!(d.message, "argument 'x' has negative dimension -2 at position 1");
    }

    #[test]
    fn unused_index_is_reported() {
        let mut b = crate::schema::SchemaBuilder::new("op");
        b.add_index('i', "input", 1u32).unwrap();
        b.add_index('q', "spare", 1u32).unwrap();
        b.arg_tensor("x", &["i"]).unwrap();
        let s = b.build().unwrap();
        let w = unused_index_warnings(s.def());
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].to_string(), "warning[W0400]: index 'q' (spare) is never used");
    }

    #[test]
    fn tabulate_aligns_columns() {
        let t = tabulate(&[
            vec!["".into(), "x".into()],
            vec!["submitted".into(), "1 2".into()],
        ]);
        assert_eq!(t, "          | x\nsubmitted | 1 2\n");
    }
}
