// schema.rs — Declaration API and the finalised operation schema
//
// A `SchemaBuilder` collects the declarations of one operation: indices and
// their rank constraints, arguments with their signatures, data formats,
// dtype rules, computed indices, generators, predicates and return
// signatures. `build` validates the declarations as a whole and finalises
// them into an immutable `OpSchema` carrying its predicate, inference and
// generation graphs.
//
// Preconditions: indices are declared before the signatures that use them.
// Postconditions: every signature list has one entry or one per layout;
//                 every formula argument names a declared argument.
// Failure modes: malformed declarations → `SchemaError`, raised by the
//                declaring call or by `build`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::args::ArgValue;
use crate::dims::{ComputedIndex, DimsError, DimsGraph, DimsSampler, Formula, FormulaArgs, IndexGenerator, LAYOUT_ARG};
use crate::dtype::{parse_dtype_exprs, DTypeExprError};
use crate::gen::GenGraph;
use crate::graph::GraphError;
use crate::infer::InferGraph;
use crate::model::{
    DataFormats, Dims, FormatEntry, Index, IndexCode, IndexDims, IndexPredicate, IndexRanks, PredFunc,
    RankConstraint, RankRange, Signature,
};
use crate::pred::PredGraph;
use crate::rules::{ComboField, DTypeRules, ExcludedCombo};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("index '{0}' is declared twice")]
    DuplicateIndex(IndexCode),
    #[error("index '{0}' is not declared")]
    UnknownIndex(IndexCode),
    #[error("index '{index}' cannot share the rank of '{target}', which is itself a shadow index")]
    ShadowOfShadow { index: IndexCode, target: IndexCode },
    #[error("index '{index}' has empty rank range {lo}..{hi}")]
    EmptyRankRange { index: IndexCode, lo: u32, hi: u32 },
    #[error("argument '{0}' is declared twice")]
    DuplicateArgument(String),
    #[error("argument '{0}' is not declared")]
    UnknownArgument(String),
    #[error("argument '{0}' is not a tensor")]
    NotATensor(String),
    #[error("tensor '{0}' already has a dtype rule")]
    DuplicateDTypeRule(String),
    #[error("argument '{arg}' has {got} signatures but the schema has {layouts} layouts")]
    SignatureCount { arg: String, got: usize, layouts: usize },
    #[error("argument '{arg}': {message}")]
    BadSignature { arg: String, message: String },
    #[error("a data format argument is already declared")]
    DuplicateDataFormat,
    #[error("combo field '{0}' names neither a tensor, an index, nor the layout")]
    BadComboField(String),
    #[error("invalid value '{value}' for combo field '{field}'")]
    BadComboValue { field: String, value: String },
    #[error(transparent)]
    DType(#[from] DTypeExprError),
    #[error(transparent)]
    Dims(#[from] DimsError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ── Arguments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    Tensor,
    /// Integer list holding a shape; with `bcast` a length-1 list (or a
    /// bare integer) broadcasts across the rank of its single index.
    ShapeList { bcast: bool },
    /// Single integer broadcast across a single-index signature.
    ShapeInt { lo: i64, hi: Option<i64> },
    ShapeTensor,
    /// Each column is the shape of one signature (one list per layout).
    ShapeTensor2D { columns: Vec<Vec<Signature>> },
    Options(Vec<String>),
    DataFormat,
    /// Integer equal to the total rank of a signature.
    Rank,
    Int { lo: i64, hi: i64 },
    Unchecked,
}

impl ArgKind {
    pub fn label(&self) -> &'static str {
        match self {
            ArgKind::Tensor => "tensor",
            ArgKind::ShapeList { bcast: false } => "shape list",
            ArgKind::ShapeList { bcast: true } => "bcast shape list",
            ArgKind::ShapeInt { .. } => "shape int",
            ArgKind::ShapeTensor => "shape tensor",
            ArgKind::ShapeTensor2D { .. } => "shape tensor 2d",
            ArgKind::Options(_) => "option",
            ArgKind::DataFormat => "data format",
            ArgKind::Rank => "rank",
            ArgKind::Int { .. } => "int",
            ArgKind::Unchecked => "unchecked",
        }
    }

    /// Whether generation may change this argument's rank or dims freely.
    pub fn is_mutable_shape(&self) -> bool {
        matches!(
            self,
            ArgKind::Tensor | ArgKind::ShapeList { bcast: false } | ArgKind::ShapeTensor
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDecl {
    pub name: String,
    pub kind: ArgKind,
    /// One signature, or one per layout. Empty for non-shape arguments and
    /// 2-D shape tensors (whose signatures live in the kind).
    pub sigs: Vec<Signature>,
}

/// Signature of a list for `layout`: its own entry, or the single shared one.
pub fn sig_for_layout(sigs: &[Signature], layout: usize) -> Option<&Signature> {
    match sigs.len() {
        1 => sigs.first(),
        _ => sigs.get(layout),
    }
}

// ── Finalised declarations ──────────────────────────────────────────────────

/// Declarations of one operation, shared read-only by every graph node.
#[derive(Debug, Clone)]
pub struct OpDef {
    pub op_path: String,
    pub indices: Vec<Index>,
    pub args: Vec<ArgDecl>,
    pub formats: DataFormats,
    pub dtype_rules: DTypeRules,
    pub computed: Vec<ComputedIndex>,
    pub generators: Vec<IndexGenerator>,
    pub dims: DimsGraph,
    pub predicates: Vec<IndexPredicate>,
    pub rank_limits: Vec<(Signature, RankRange)>,
    pub returns: Vec<Vec<Signature>>,
}

impl OpDef {
    pub fn index(&self, c: IndexCode) -> Option<&Index> {
        self.indices.iter().find(|i| i.code == c)
    }

    pub fn primary(&self, c: IndexCode) -> IndexCode {
        self.index(c).map(|i| i.primary).unwrap_or(c)
    }

    pub fn primaries(&self) -> impl Iterator<Item = IndexCode> + '_ {
        self.indices.iter().filter(|i| i.is_primary()).map(|i| i.code)
    }

    pub fn arg(&self, name: &str) -> Option<&ArgDecl> {
        self.args.iter().find(|a| a.name == name)
    }

    pub fn tensors(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .filter(|a| a.kind == ArgKind::Tensor)
            .map(|a| a.name.as_str())
    }

    pub fn num_layouts(&self) -> usize {
        self.formats.num_layouts()
    }

    /// Every shape-bearing key with its signatures: argument names, plus
    /// `name.j` for column j of a 2-D shape tensor.
    pub fn shape_keys(&self) -> Vec<(String, &[Signature])> {
        let mut out = Vec::new();
        for a in &self.args {
            match &a.kind {
                ArgKind::Tensor
                | ArgKind::ShapeList { .. }
                | ArgKind::ShapeInt { .. }
                | ArgKind::ShapeTensor => out.push((a.name.clone(), a.sigs.as_slice())),
                ArgKind::ShapeTensor2D { columns } => {
                    for (j, col) in columns.iter().enumerate() {
                        out.push((format!("{}.{j}", a.name), col.as_slice()));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// For `sig` and primary `c`: how many of its indices share `c`'s rank,
    /// the summed ranks of the others found in `known`, and whether every
    /// other index was found.
    pub fn split_rank_sum(&self, sig: &Signature, c: IndexCode, known: &IndexRanks) -> (u32, u32, bool) {
        let mut k = 0;
        let mut sum = 0;
        let mut complete = true;
        for x in sig.iter() {
            let p = self.primary(x);
            if p == c {
                k += 1;
            } else {
                match known.get(&p) {
                    Some(r) => sum += r,
                    None => complete = false,
                }
            }
        }
        (k, sum, complete)
    }

    /// Declared rank range of primary `c`, narrowed by every rank limit
    /// given the primaries already ranked in `known`.
    pub fn rank_bounds(&self, c: IndexCode, known: &IndexRanks) -> RankRange {
        let mut range = self.index(c).and_then(|i| i.ranks).unwrap_or_else(RankRange::any);
        for (sig, limit) in &self.rank_limits {
            let (k, sum, complete) = self.split_rank_sum(sig, c, known);
            if k == 0 {
                continue;
            }
            if sum > limit.hi {
                return RankRange::new(1, 0);
            }
            range.hi = range.hi.min((limit.hi - sum) / k);
            if complete && limit.lo > sum {
                range.lo = range.lo.max((limit.lo - sum).div_ceil(k));
            }
        }
        range
    }

    /// Scalar argument values visible to formulas under `layout`.
    pub fn formula_args(&self, values: &BTreeMap<String, ArgValue>, layout: usize) -> FormulaArgs {
        let mut args = values.clone();
        args.insert(LAYOUT_ARG.to_string(), ArgValue::int(layout as i64));
        args
    }

    /// Predicates that fail on `dims` (those lacking dims are skipped).
    pub fn violated(&self, dims: &IndexDims) -> Vec<&IndexPredicate> {
        self.predicates
            .iter()
            .filter(|p| p.holds(dims) == Some(false))
            .collect()
    }

    /// Computed indices `p` depends on, directly or through other formulas,
    /// in declaration order.
    pub fn formula_trail(&self, p: &IndexPredicate) -> Vec<IndexCode> {
        let mut needed: BTreeSet<IndexCode> = BTreeSet::new();
        let mut stack: Vec<IndexCode> = p.indices.iter().collect();
        while let Some(c) = stack.pop() {
            if let Some(ci) = self.dims.computed(c) {
                if needed.insert(c) {
                    stack.extend(ci.inputs.iter());
                }
            }
        }
        self.computed
            .iter()
            .map(|ci| ci.out)
            .filter(|c| needed.contains(c))
            .collect()
    }

    fn canonical_summary(&self) -> String {
        let mut lines = vec![format!("op {}", self.op_path)];
        for i in &self.indices {
            let ranks = i.ranks.map(|r| r.to_string()).unwrap_or_default();
            lines.push(format!("index {} {} {} {ranks}", i.code, i.desc, i.primary));
        }
        for a in &self.args {
            let sigs: Vec<String> = a.sigs.iter().map(|s| s.to_string()).collect();
            lines.push(format!("arg {} {:?} {}", a.name, a.kind, sigs.join(",")));
        }
        lines.push(format!("formats {:?}", self.formats));
        lines.push(format!("dtypes {:?}", self.dtype_rules));
        for ci in &self.computed {
            lines.push(format!("computed {ci:?}"));
        }
        for g in &self.generators {
            lines.push(format!("generator {g:?}"));
        }
        for p in &self.predicates {
            lines.push(format!("pred {p:?}"));
        }
        for (sig, r) in &self.rank_limits {
            lines.push(format!("limit {sig} {r}"));
        }
        for sigs in &self.returns {
            let sigs: Vec<String> = sigs.iter().map(|s| s.to_string()).collect();
            lines.push(format!("return {}", sigs.join(",")));
        }
        lines.join("\n")
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

pub struct SchemaBuilder {
    op_path: String,
    indices: Vec<Index>,
    args: Vec<ArgDecl>,
    formats: Option<DataFormats>,
    rules: DTypeRules,
    computed: Vec<ComputedIndex>,
    generators: Vec<IndexGenerator>,
    predicates: Vec<IndexPredicate>,
    rank_limits: Vec<(Signature, RankRange)>,
    returns: Vec<Vec<Signature>>,
}

impl SchemaBuilder {
    pub fn new(op_path: &str) -> Self {
        Self {
            op_path: op_path.to_string(),
            indices: Vec::new(),
            args: Vec::new(),
            formats: None,
            rules: DTypeRules::new(),
            computed: Vec::new(),
            generators: Vec::new(),
            predicates: Vec::new(),
            rank_limits: Vec::new(),
            returns: Vec::new(),
        }
    }

    fn index(&self, c: IndexCode) -> Option<&Index> {
        self.indices.iter().find(|i| i.code == c)
    }

    fn sig(&self, text: &str) -> Result<Signature, SchemaError> {
        let sig = Signature::parse(text);
        let unknown = sig.iter().find(|c| self.index(*c).is_none());
        match unknown {
            Some(c) => Err(SchemaError::UnknownIndex(c)),
            None => Ok(sig),
        }
    }

    fn sigs(&self, arg: &str, texts: &[&str]) -> Result<Vec<Signature>, SchemaError> {
        if texts.is_empty() {
            return Err(SchemaError::BadSignature {
                arg: arg.to_string(),
                message: "no signature given".into(),
            });
        }
        texts.iter().map(|t| self.sig(t)).collect()
    }

    fn push_arg(&mut self, name: &str, kind: ArgKind, sigs: Vec<Signature>) -> Result<&mut Self, SchemaError> {
        if self.args.iter().any(|a| a.name == name) {
            return Err(SchemaError::DuplicateArgument(name.to_string()));
        }
        self.args.push(ArgDecl {
            name: name.to_string(),
            kind,
            sigs,
        });
        Ok(self)
    }

    pub fn add_index(
        &mut self,
        code: IndexCode,
        desc: &str,
        rank: impl Into<RankConstraint>,
    ) -> Result<&mut Self, SchemaError> {
        if self.index(code).is_some() {
            return Err(SchemaError::DuplicateIndex(code));
        }
        let (primary, ranks) = match rank.into() {
            RankConstraint::Fixed(r) => (code, Some(RankRange::new(r, r))),
            RankConstraint::Range(lo, hi) if lo > hi => {
                return Err(SchemaError::EmptyRankRange { index: code, lo, hi })
            }
            RankConstraint::Range(lo, hi) => (code, Some(RankRange::new(lo, hi))),
            RankConstraint::Free => (code, Some(RankRange::any())),
            RankConstraint::Equate(target) => {
                let t = self.index(target).ok_or(SchemaError::UnknownIndex(target))?;
                if !t.is_primary() {
                    return Err(SchemaError::ShadowOfShadow { index: code, target });
                }
                (target, None)
            }
        };
        self.indices.push(Index {
            code,
            desc: desc.to_string(),
            primary,
            ranks,
        });
        Ok(self)
    }

    pub fn arg_tensor(&mut self, name: &str, sigs: &[&str]) -> Result<&mut Self, SchemaError> {
        let sigs = self.sigs(name, sigs)?;
        self.push_arg(name, ArgKind::Tensor, sigs)
    }

    pub fn arg_shape_list(&mut self, name: &str, sigs: &[&str]) -> Result<&mut Self, SchemaError> {
        let sigs = self.sigs(name, sigs)?;
        self.push_arg(name, ArgKind::ShapeList { bcast: false }, sigs)
    }

    pub fn arg_shape_bcast_list(&mut self, name: &str, sigs: &[&str]) -> Result<&mut Self, SchemaError> {
        let sigs = self.sigs(name, sigs)?;
        if sigs.iter().any(|s| s.len() != 1) {
            return Err(SchemaError::BadSignature {
                arg: name.to_string(),
                message: "a broadcast list needs single-index signatures".into(),
            });
        }
        self.push_arg(name, ArgKind::ShapeList { bcast: true }, sigs)
    }

    pub fn arg_shape_int(
        &mut self,
        name: &str,
        index: IndexCode,
        lo: i64,
        hi: Option<i64>,
    ) -> Result<&mut Self, SchemaError> {
        let sig = self.sig(&index.to_string())?;
        self.push_arg(name, ArgKind::ShapeInt { lo, hi }, vec![sig])
    }

    pub fn arg_shape_tensor(&mut self, name: &str, sigs: &[&str]) -> Result<&mut Self, SchemaError> {
        let sigs = self.sigs(name, sigs)?;
        self.push_arg(name, ArgKind::ShapeTensor, sigs)
    }

    /// `columns[j]` lists the signatures (one, or one per layout) of
    /// column j.
    pub fn arg_shape_tensor2d(&mut self, name: &str, columns: &[&[&str]]) -> Result<&mut Self, SchemaError> {
        let columns = columns
            .iter()
            .map(|c| self.sigs(name, c))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(SchemaError::BadSignature {
                arg: name.to_string(),
                message: "a 2-D shape tensor needs at least one column".into(),
            });
        }
        self.push_arg(name, ArgKind::ShapeTensor2D { columns }, Vec::new())
    }

    pub fn arg_option(&mut self, name: &str, options: &[&str]) -> Result<&mut Self, SchemaError> {
        let options = options.iter().map(|o| o.to_string()).collect();
        self.push_arg(name, ArgKind::Options(options), Vec::new())
    }

    /// Data format argument from name → (layout, rank) entries.
    pub fn arg_layout(
        &mut self,
        name: &str,
        entries: Vec<FormatEntry>,
        rank_index: IndexCode,
    ) -> Result<&mut Self, SchemaError> {
        if self.formats.is_some() {
            return Err(SchemaError::DuplicateDataFormat);
        }
        self.sig(&rank_index.to_string())?;
        self.formats = Some(DataFormats {
            arg: Some(name.to_string()),
            entries,
            rank_index: Some(rank_index),
        });
        self.push_arg(name, ArgKind::DataFormat, Vec::new())
    }

    /// Data format argument from per-layout tables: `table[l]` lists the
    /// (rank, name) pairs that select layout `l`. `default` is the layout
    /// implied when the argument is omitted.
    pub fn arg_layout_table(
        &mut self,
        name: &str,
        table: &[&[(u32, &str)]],
        rank_index: IndexCode,
        default: Option<usize>,
    ) -> Result<&mut Self, SchemaError> {
        let mut entries: Vec<FormatEntry> = table
            .iter()
            .enumerate()
            .flat_map(|(l, row)| row.iter().map(move |(r, n)| FormatEntry::new(n, l, *r)))
            .collect();
        entries.extend(default.map(FormatEntry::omitted));
        self.arg_layout(name, entries, rank_index)
    }

    pub fn arg_rank(&mut self, name: &str, sig: &str) -> Result<&mut Self, SchemaError> {
        let sig = self.sig(sig)?;
        self.push_arg(name, ArgKind::Rank, vec![sig])
    }

    pub fn arg_int(&mut self, name: &str, lo: i64, hi: i64) -> Result<&mut Self, SchemaError> {
        self.push_arg(name, ArgKind::Int { lo, hi }, Vec::new())
    }

    pub fn arg_unchecked(&mut self, name: &str) -> Result<&mut Self, SchemaError> {
        self.push_arg(name, ArgKind::Unchecked, Vec::new())
    }

    fn tensor_decl(&self, tensor: &str) -> Result<&ArgDecl, SchemaError> {
        let a = self
            .args
            .iter()
            .find(|a| a.name == tensor)
            .ok_or_else(|| SchemaError::UnknownArgument(tensor.to_string()))?;
        match a.kind {
            ArgKind::Tensor => Ok(a),
            _ => Err(SchemaError::NotATensor(tensor.to_string())),
        }
    }

    pub fn valid_dtypes(&mut self, tensor: &str, exprs: &[&str]) -> Result<&mut Self, SchemaError> {
        self.tensor_decl(tensor)?;
        if self.rules.has_rule(tensor) {
            return Err(SchemaError::DuplicateDTypeRule(tensor.to_string()));
        }
        let dtypes = parse_dtype_exprs(exprs)?;
        self.rules.set_valid(tensor, dtypes);
        Ok(self)
    }

    pub fn equate_dtypes(&mut self, tensor: &str, source: &str) -> Result<&mut Self, SchemaError> {
        self.tensor_decl(tensor)?;
        self.tensor_decl(source)?;
        if self.rules.has_rule(tensor) {
            return Err(SchemaError::DuplicateDTypeRule(tensor.to_string()));
        }
        self.rules.set_equate(tensor, source);
        Ok(self)
    }

    /// Exclude a combination. Each field is a tensor name (value: dtype
    /// expression), a single index code (value: rank), or `LAYOUT` (value:
    /// layout number).
    pub fn exclude_combos(&mut self, fields: &[(&str, &str)]) -> Result<&mut Self, SchemaError> {
        let bad_value = |field: &str, value: &str| SchemaError::BadComboValue {
            field: field.to_string(),
            value: value.to_string(),
        };
        let mut combo = Vec::new();
        for &(field, value) in fields {
            if self.tensor_decl(field).is_ok() {
                combo.push(ComboField::Tensor(field.to_string(), parse_dtype_exprs(&[value])?));
            } else if field == "LAYOUT" {
                let l = value.parse().map_err(|_| bad_value(field, value))?;
                combo.push(ComboField::Layout(l));
            } else {
                let mut chars = field.chars();
                let (Some(c), None) = (chars.next(), chars.next()) else {
                    return Err(SchemaError::BadComboField(field.to_string()));
                };
                if self.index(c).is_none() {
                    return Err(SchemaError::BadComboField(field.to_string()));
                }
                let r = value.parse().map_err(|_| bad_value(field, value))?;
                combo.push(ComboField::Rank(c, r));
            }
        }
        self.rules.add_combo(ExcludedCombo(combo));
        Ok(self)
    }

    fn push_computed(
        &mut self,
        out: IndexCode,
        formula: Formula,
        template: impl Fn(&[String], &[ArgValue]) -> String + Send + Sync + 'static,
        inputs: &str,
        extra_args: &[&str],
    ) -> Result<&mut Self, SchemaError> {
        let out_sig = self.sig(&out.to_string())?;
        let inputs = self.sig(inputs)?;
        self.computed.push(ComputedIndex {
            out,
            inputs,
            formula,
            template: Arc::new(template),
            extra_args: extra_args.iter().map(|a| a.to_string()).collect(),
        });
        let name = format!("{out} >= 0");
        self.predicates.push(IndexPredicate {
            name,
            indices: out_sig,
            func: PredFunc::ComponentWise(Arc::new(|v: &[i64]| v[0] >= 0)),
            template: Arc::new(|l: &[String]| format!("{} >= 0", l[0])),
        });
        Ok(self)
    }

    /// Index `out` computed from the whole dims of `inputs` (and the values
    /// of `extra_args`). Adds an implicit non-negativity predicate on `out`.
    pub fn computed_index(
        &mut self,
        out: IndexCode,
        formula: impl Fn(&[Dims], &[ArgValue]) -> Dims + Send + Sync + 'static,
        template: impl Fn(&[String], &[ArgValue]) -> String + Send + Sync + 'static,
        inputs: &str,
        extra_args: &[&str],
    ) -> Result<&mut Self, SchemaError> {
        self.push_computed(out, Formula::Whole(Arc::new(formula)), template, inputs, extra_args)
    }

    /// Component-wise variant: `formula` sees one (broadcast) component of
    /// each input at a time.
    pub fn computed_index_cw(
        &mut self,
        out: IndexCode,
        formula: impl Fn(&[i64], &[ArgValue]) -> i64 + Send + Sync + 'static,
        template: impl Fn(&[String], &[ArgValue]) -> String + Send + Sync + 'static,
        inputs: &str,
        extra_args: &[&str],
    ) -> Result<&mut Self, SchemaError> {
        self.push_computed(
            out,
            Formula::ComponentWise(Arc::new(formula)),
            template,
            inputs,
            extra_args,
        )
    }

    pub fn add_index_generator(&mut self, outputs: &str, sampler: DimsSampler) -> Result<&mut Self, SchemaError> {
        let outputs = self.sig(outputs)?;
        self.generators.push(IndexGenerator { outputs, sampler });
        Ok(self)
    }

    pub fn dims_pred(
        &mut self,
        name: &str,
        pred: impl Fn(&[Dims]) -> bool + Send + Sync + 'static,
        template: impl Fn(&[String]) -> String + Send + Sync + 'static,
        indices: &str,
    ) -> Result<&mut Self, SchemaError> {
        let indices = self.sig(indices)?;
        self.predicates.push(IndexPredicate {
            name: name.to_string(),
            indices,
            func: PredFunc::Whole(Arc::new(pred)),
            template: Arc::new(template),
        });
        Ok(self)
    }

    pub fn dims_pred_cw(
        &mut self,
        name: &str,
        pred: impl Fn(&[i64]) -> bool + Send + Sync + 'static,
        template: impl Fn(&[String]) -> String + Send + Sync + 'static,
        indices: &str,
    ) -> Result<&mut Self, SchemaError> {
        let indices = self.sig(indices)?;
        self.predicates.push(IndexPredicate {
            name: name.to_string(),
            indices,
            func: PredFunc::ComponentWise(Arc::new(pred)),
            template: Arc::new(template),
        });
        Ok(self)
    }

    /// Every component of `index` within `[lo, hi]` (either bound optional).
    pub fn dims_pred_rng(&mut self, index: IndexCode, lo: Option<i64>, hi: Option<i64>) -> Result<&mut Self, SchemaError> {
        let name = match (lo, hi) {
            (Some(lo), Some(hi)) => format!("{lo} <= {index} <= {hi}"),
            (Some(lo), None) => format!("{index} >= {lo}"),
            (None, Some(hi)) => format!("{index} <= {hi}"),
            (None, None) => return Ok(self),
        };
        self.dims_pred_cw(
            &name,
            move |v: &[i64]| !lo.is_some_and(|lo| v[0] < lo) && !hi.is_some_and(|hi| v[0] > hi),
            move |l: &[String]| match (lo, hi) {
                (Some(lo), Some(hi)) => format!("{lo} <= {} <= {hi}", l[0]),
                (Some(lo), None) => format!("{} >= {lo}", l[0]),
                (_, hi) => format!("{} <= {}", l[0], hi.unwrap_or_default()),
            },
            &index.to_string(),
        )
    }

    /// Total rank of `sig` must lie in `[lo, hi]`.
    pub fn limit_ranks(&mut self, sig: &str, lo: u32, hi: u32) -> Result<&mut Self, SchemaError> {
        let sig = self.sig(sig)?;
        self.rank_limits.push((sig, RankRange::new(lo, hi)));
        Ok(self)
    }

    pub fn return_tensor(&mut self, sigs: &[&str]) -> Result<&mut Self, SchemaError> {
        let sigs = self.sigs("return", sigs)?;
        self.returns.push(sigs);
        Ok(self)
    }

    fn check_counts(&self, layouts: usize) -> Result<(), SchemaError> {
        let check = |arg: &str, got: usize| {
            if got == 1 || got == layouts {
                Ok(())
            } else {
                Err(SchemaError::SignatureCount {
                    arg: arg.to_string(),
                    got,
                    layouts,
                })
            }
        };
        for a in &self.args {
            match &a.kind {
                ArgKind::ShapeTensor2D { columns } => {
                    for col in columns {
                        check(&a.name, col.len())?;
                    }
                }
                _ if !a.sigs.is_empty() => check(&a.name, a.sigs.len())?,
                _ => {}
            }
        }
        for (i, sigs) in self.returns.iter().enumerate() {
            check(&format!("return {i}"), sigs.len())?;
        }
        Ok(())
    }

    pub fn build(self) -> Result<OpSchema, SchemaError> {
        let formats = self.formats.clone().unwrap_or_else(DataFormats::single);
        self.check_counts(formats.num_layouts())?;
        for ci in &self.computed {
            if let Some(a) = ci.extra_args.iter().find(|a| {
                a.as_str() != LAYOUT_ARG && !self.args.iter().any(|d| &d.name == *a)
            }) {
                return Err(SchemaError::UnknownArgument(a.clone()));
            }
        }
        let dims = DimsGraph::build(&self.generators, &self.computed)?;
        let def = OpDef {
            op_path: self.op_path,
            indices: self.indices,
            args: self.args,
            formats,
            dtype_rules: self.rules,
            computed: self.computed,
            generators: self.generators,
            dims,
            predicates: self.predicates,
            rank_limits: self.rank_limits,
            returns: self.returns,
        };
        let fingerprint = {
            let mut hasher = Sha256::new();
            hasher.update(def.canonical_summary().as_bytes());
            let result = hasher.finalize();
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&result);
            hash
        };
        let pred = crate::pred::build(&def)?;
        let infer = crate::infer::build(&def)?;
        let gen = crate::gen::build(&def)?;
        debug!(
            op = %def.op_path,
            indices = def.indices.len(),
            args = def.args.len(),
            layouts = def.num_layouts(),
            "schema finalised"
        );
        Ok(OpSchema {
            def,
            pred,
            infer,
            gen,
            fingerprint,
        })
    }
}

// ── Finalised schema ────────────────────────────────────────────────────────

/// Immutable schema of one operation with its three evaluation graphs.
pub struct OpSchema {
    pub(crate) def: OpDef,
    pub(crate) pred: PredGraph,
    pub(crate) infer: InferGraph,
    pub(crate) gen: GenGraph,
    fingerprint: [u8; 32],
}

impl fmt::Debug for OpSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpSchema")
            .field("op", &self.def.op_path)
            .field("fingerprint", &self.fingerprint_hex())
            .finish()
    }
}

impl OpSchema {
    pub fn def(&self) -> &OpDef {
        &self.def
    }

    pub fn op_path(&self) -> &str {
        &self.def.op_path
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// First 8 bytes of the fingerprint as 16 hex chars.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Generation seed: `seed` mixed with the fingerprint.
    pub fn seed_for(&self, seed: u64) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.fingerprint[..8]);
        seed ^ u64::from_le_bytes(head)
    }

    /// Human-readable summary of every declaration.
    pub fn explain(&self) -> String {
        let d = &self.def;
        let mut out = vec![format!("op: {}", d.op_path), "indices:".to_string()];
        let w = d.indices.iter().map(|i| i.desc.len()).max().unwrap_or(0);
        for i in &d.indices {
            let rank = match i.ranks {
                Some(r) => r.to_string(),
                None => format!("= {}", i.primary),
            };
            out.push(format!("  {}  {:<w$}  {rank}", i.code, i.desc));
        }

        out.push("arguments:".to_string());
        let w = d.args.iter().map(|a| a.name.len()).max().unwrap_or(0);
        for a in &d.args {
            let detail = match &a.kind {
                ArgKind::ShapeTensor2D { columns } => {
                    let cols: Vec<String> = columns.iter().map(|c| join_sigs(c)).collect();
                    cols.join(", ")
                }
                ArgKind::Options(opts) => opts.join(", "),
                ArgKind::ShapeInt { lo, hi: Some(hi) } => format!("{} in [{lo}, {hi}]", join_sigs(&a.sigs)),
                ArgKind::ShapeInt { lo, hi: None } => format!("{} >= {lo}", join_sigs(&a.sigs)),
                ArgKind::Int { lo, hi } => format!("[{lo}, {hi}]"),
                _ => join_sigs(&a.sigs),
            };
            let line = format!("  {:<w$}  {}  {detail}", a.name, a.kind.label());
            out.push(line.trim_end().to_string());
        }

        if d.formats.is_configured() {
            out.push("formats:".to_string());
            for e in &d.formats.entries {
                let name = e.name.as_deref().unwrap_or("(omitted)");
                let rank = match (e.rank, d.formats.rank_index) {
                    (Some(r), Some(c)) => format!(" when rank({c}) = {r}"),
                    _ => String::new(),
                };
                out.push(format!("  {name} -> layout {}{rank}", e.layout));
            }
        }

        out.push("dtypes:".to_string());
        for t in d.tensors() {
            let rule = match d.dtype_rules.equated_to(t) {
                Some(src) => format!("same as {src}"),
                None if d.dtype_rules.has_rule(t) => {
                    let names: Vec<&str> = d.dtype_rules.allowed(t).iter().map(|x| x.name()).collect();
                    names.join(", ")
                }
                None => "any".to_string(),
            };
            out.push(format!("  {t}: {rule}"));
        }
        for combo in d.dtype_rules.combos() {
            out.push(format!("  excluded: {combo}"));
        }

        if !d.computed.is_empty() {
            out.push("computed:".to_string());
            let labels: BTreeMap<IndexCode, String> =
                d.indices.iter().map(|i| (i.code, i.code.to_string())).collect();
            let rendered = d
                .dims
                .render(&labels, &IndexRanks::new(), &FormulaArgs::new())
                .unwrap_or_default();
            for ci in &d.computed {
                let text = rendered.get(&ci.out).cloned().unwrap_or_default();
                out.push(format!("  {} = {text}", ci.out));
            }
        }

        if !d.predicates.is_empty() {
            out.push("predicates:".to_string());
            for p in &d.predicates {
                out.push(format!("  {}", p.name));
            }
        }
        for (sig, r) in &d.rank_limits {
            out.push(format!("rank({sig}) in {}..{}", r.lo, r.hi));
        }
        if !d.returns.is_empty() {
            out.push("returns:".to_string());
            for (i, sigs) in d.returns.iter().enumerate() {
                out.push(format!("  {i}: {}", join_sigs(sigs)));
            }
        }
        out.push(format!("fingerprint: {}", self.fingerprint_hex()));
        out.join("\n")
    }
}

fn join_sigs(sigs: &[Signature]) -> String {
    let parts: Vec<String> = sigs.iter().map(|s| s.to_string()).collect();
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_builder() -> SchemaBuilder {
        let mut b = SchemaBuilder::new("pool");
        b.add_index('b', "batch", 1u32)
            .unwrap()
            .add_index('i', "input spatial", (1u32, 3u32))
            .unwrap()
            .add_index('k', "kernel", 'i')
            .unwrap()
            .add_index('c', "channel", 1u32)
            .unwrap();
        b.arg_tensor("input", &["bic"]).unwrap();
        b.arg_shape_bcast_list("ksize", &["k"]).unwrap();
        b
    }

    #[test]
    fn signatures_name_declared_indices() {
        let mut b = SchemaBuilder::new("op");
        b.add_index('i', "input", 1u32).unwrap();
        assert_eq!(
            b.arg_tensor("x", &["iq"]).err(),
            Some(SchemaError::UnknownIndex('q'))
        );
        b.arg_tensor("x", &["i"]).unwrap();
        assert!(b.build().is_ok());
    }

    #[test]
    fn duplicate_and_unknown_indices_rejected() {
        let mut b = SchemaBuilder::new("op");
        b.add_index('i', "input", 1u32).unwrap();
        assert_eq!(
            b.add_index('i', "again", 1u32).err(),
            Some(SchemaError::DuplicateIndex('i'))
        );
        assert_eq!(
            b.add_index('k', "kernel", 'z').err(),
            Some(SchemaError::UnknownIndex('z'))
        );
        b.add_index('k', "kernel", 'i').unwrap();
        assert_eq!(
            b.add_index('m', "more", 'k').err(),
            Some(SchemaError::ShadowOfShadow { index: 'm', target: 'k' })
        );
        assert_eq!(b.arg_tensor("x", &["iq"]).err(), Some(SchemaError::UnknownIndex('q')));
    }

    #[test]
    fn dtype_rules_need_tensors() {
        let mut b = pool_builder();
        assert_eq!(
            b.valid_dtypes("ksize", &["float"]).err(),
            Some(SchemaError::NotATensor("ksize".into()))
        );
        b.valid_dtypes("input", &["float"]).unwrap();
        assert_eq!(
            b.valid_dtypes("input", &["int"]).err(),
            Some(SchemaError::DuplicateDTypeRule("input".into()))
        );
        assert!(matches!(
            b.exclude_combos(&[("input", "float64"), ("zz", "3")]).err(),
            Some(SchemaError::BadComboField(_))
        ));
    }

    #[test]
    fn signature_count_must_match_layouts() {
        let mut b = SchemaBuilder::new("op");
        b.add_index('b', "batch", 1u32).unwrap();
        b.add_index('i', "spatial", (1u32, 2u32)).unwrap();
        b.arg_tensor("x", &["bi", "ib", "bb"]).unwrap();
        b.arg_layout_table("fmt", &[&[(1, "NW")], &[(1, "WN")]], 'i', Some(0))
            .unwrap();
        assert_eq!(
            b.build().err(),
            Some(SchemaError::SignatureCount {
                arg: "x".into(),
                got: 3,
                layouts: 2
            })
        );
    }

    #[test]
    fn rank_bounds_apply_limits() {
        let mut b = SchemaBuilder::new("op");
        b.add_index('b', "batch", RankConstraint::Free).unwrap();
        b.add_index('i', "spatial", RankConstraint::Free).unwrap();
        b.arg_tensor("x", &["bi"]).unwrap();
        b.limit_ranks("bi", 2, 4).unwrap();
        let s = b.build().unwrap();
        let none = IndexRanks::new();
        assert_eq!(s.def().rank_bounds('b', &none), RankRange::new(0, 4));
        let b3: IndexRanks = [('b', 3)].into_iter().collect();
        assert_eq!(s.def().rank_bounds('i', &b3), RankRange::new(0, 1));
        let b0: IndexRanks = [('b', 0)].into_iter().collect();
        assert_eq!(s.def().rank_bounds('i', &b0), RankRange::new(2, 4));
    }

    #[test]
    fn computed_index_adds_nonnegativity() {
        let mut b = pool_builder();
        b.add_index('o', "output", 'i').unwrap();
        b.computed_index_cw(
            'o',
            |v: &[i64], _: &[ArgValue]| v[0] - v[1] + 1,
            |l: &[String], _: &[ArgValue]| format!("{} - {} + 1", l[0], l[1]),
            "ik",
            &[],
        )
        .unwrap();
        let s = b.build().unwrap();
        assert_eq!(s.def().predicates.len(), 1);
        assert_eq!(s.def().predicates[0].name, "o >= 0");
        assert!(s.explain().contains("  o = i - k + 1"));
    }

    #[test]
    fn unknown_formula_argument_rejected() {
        let mut b = pool_builder();
        b.add_index('o', "output", 'i').unwrap();
        b.computed_index_cw(
            'o',
            |v: &[i64], _: &[ArgValue]| v[0],
            |l: &[String], _: &[ArgValue]| l[0].clone(),
            "i",
            &["padding"],
        )
        .unwrap();
        assert_eq!(
            b.build().err(),
            Some(SchemaError::UnknownArgument("padding".into()))
        );
    }

    #[test]
    fn fingerprint_depends_on_declarations() {
        let a = pool_builder().build().unwrap();
        let b = pool_builder().build().unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let mut c = pool_builder();
        c.arg_int("axis", 0, 3).unwrap();
        let c = c.build().unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint_hex().len(), 16);
    }
}
