// pred.rs — Predicate graph: local checks on observed arguments
//
// One node per argument (two more per tensor, splitting shape and dtype)
// checks the observed value on its own: presence, kind, non-negative dims,
// integer ranges and rectangular 2-D shapes. Three aggregator nodes collect
// the observed shapes, dtypes and scalar values that the inference graph
// consumes.
//
// Preconditions: the `call` node is supplied as an observed value.
// Postconditions: `observe` returns either the aggregated observation or
//                 the first local failure in argument declaration order.
// Failure modes: a local failure is a value (`ErrorReport`), never retried;
//                wrong parent variants are internal `EvalError`s.
// Side effects: none.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::args::{ArgValue, CallArgs};
use crate::budget::EditBudget;
use crate::diag::ErrorReport;
use crate::dtype::DType;
use crate::eval::{take, EvalConfig, EvalError, NodeFunc, ParentValues, Yield};
use crate::graph::{Graph, GraphError, NodeId};
use crate::model::Shape;
use crate::schema::{ArgKind, OpDef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredFailure {
    #[error(transparent)]
    Report(#[from] ErrorReport),
    #[error(transparent)]
    Internal(#[from] EvalError),
}

#[derive(Debug, Clone)]
pub enum PredNode {
    Call,
    Tensor(String),
    TensorShape(String),
    TensorDType(String),
    ShapeList { arg: String, bcast: bool },
    ShapeInt { arg: String, lo: i64, hi: Option<i64> },
    ShapeTensor(String),
    ShapeTensor2D { arg: String, columns: usize },
    Column { arg: String, col: usize },
    Options(String),
    DataFormat(String),
    Rank(String),
    Int { arg: String, lo: i64, hi: i64 },
    Unchecked(String),
    Shapes,
    DTypes,
    Values,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredValue {
    Call(CallArgs),
    Tensor { shape: Vec<i64>, dtype: DType },
    Shape(Shape),
    Rows(Vec<Vec<i64>>),
    DType(DType),
    Value(ArgValue),
    Shapes(BTreeMap<String, Shape>),
    DTypes(Vec<(String, DType)>),
    Values(BTreeMap<String, ArgValue>),
}

/// Everything the inference graph needs from a call that passed the
/// local checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedCall {
    pub shapes: BTreeMap<String, Shape>,
    /// Tensor dtypes in declaration order.
    pub dtypes: Vec<(String, DType)>,
    pub values: BTreeMap<String, ArgValue>,
}

fn no_negatives(arg: &str, dims: &[i64]) -> Result<(), ErrorReport> {
    match dims.iter().position(|&d| d < 0) {
        Some(pos) => Err(ErrorReport::NegativeDim {
            arg: arg.to_string(),
            pos,
            dim: dims[pos],
        }),
        None => Ok(()),
    }
}

fn wrong_kind(arg: &str, expected: &'static str, got: &ArgValue) -> ErrorReport {
    ErrorReport::WrongKind {
        arg: arg.to_string(),
        expected,
        got: got.kind().to_string(),
    }
}

fn missing(arg: &str) -> ErrorReport {
    ErrorReport::MissingArgument { arg: arg.to_string() }
}

fn in_range(arg: &str, value: i64, lo: i64, hi: i64) -> Result<(), ErrorReport> {
    if value < lo || value > hi {
        return Err(ErrorReport::OutOfRange {
            arg: arg.to_string(),
            value,
            lo,
            hi,
        });
    }
    Ok(())
}

impl PredNode {
    fn name(&self) -> &str {
        match self {
            PredNode::Call => "call",
            PredNode::Shapes => "shapes",
            PredNode::DTypes => "dtypes",
            PredNode::Values => "values",
            PredNode::Tensor(a)
            | PredNode::TensorShape(a)
            | PredNode::TensorDType(a)
            | PredNode::ShapeList { arg: a, .. }
            | PredNode::ShapeInt { arg: a, .. }
            | PredNode::ShapeTensor(a)
            | PredNode::ShapeTensor2D { arg: a, .. }
            | PredNode::Column { arg: a, .. }
            | PredNode::Options(a)
            | PredNode::DataFormat(a)
            | PredNode::Rank(a)
            | PredNode::Int { arg: a, .. }
            | PredNode::Unchecked(a) => a,
        }
    }

    /// Local check of one observed argument.
    fn check(&self, call: &CallArgs) -> Result<PredValue, ErrorReport> {
        let arg = self.name();
        let value = call.get(arg);
        match self {
            PredNode::Tensor(_) => match value {
                Some(ArgValue::Tensor { shape, dtype }) => {
                    no_negatives(arg, shape)?;
                    Ok(PredValue::Tensor {
                        shape: shape.clone(),
                        dtype: *dtype,
                    })
                }
                Some(v) => Err(wrong_kind(arg, "a tensor", v)),
                None => Err(missing(arg)),
            },
            PredNode::ShapeList { bcast, .. } => match value {
                Some(ArgValue::IntList { values }) => {
                    no_negatives(arg, values)?;
                    Ok(PredValue::Shape(match (bcast, values.as_slice()) {
                        (true, [v]) => Shape::Bcast(*v),
                        _ => Shape::Dims(values.clone()),
                    }))
                }
                Some(ArgValue::Int { value }) if *bcast => {
                    no_negatives(arg, &[*value])?;
                    Ok(PredValue::Shape(Shape::Bcast(*value)))
                }
                Some(v) => Err(wrong_kind(arg, "an integer list", v)),
                None => Err(missing(arg)),
            },
            PredNode::ShapeInt { lo, hi, .. } => match value {
                Some(ArgValue::Int { value }) => {
                    in_range(arg, *value, *lo, hi.unwrap_or(i64::MAX))?;
                    Ok(PredValue::Shape(Shape::Bcast(*value)))
                }
                Some(v) => Err(wrong_kind(arg, "an integer", v)),
                None => Err(missing(arg)),
            },
            PredNode::ShapeTensor(_) => match value {
                Some(ArgValue::IntTensor { values }) => {
                    no_negatives(arg, values)?;
                    Ok(PredValue::Shape(Shape::Dims(values.clone())))
                }
                Some(v) => Err(wrong_kind(arg, "an integer tensor", v)),
                None => Err(missing(arg)),
            },
            PredNode::ShapeTensor2D { columns, .. } => match value {
                Some(ArgValue::IntTensor2D { rows }) => {
                    if rows.iter().any(|r| r.len() != *columns) {
                        return Err(ErrorReport::NonRectangular {
                            arg: arg.to_string(),
                            cols: *columns,
                        });
                    }
                    for row in rows {
                        no_negatives(arg, row)?;
                    }
                    Ok(PredValue::Rows(rows.clone()))
                }
                Some(v) => Err(wrong_kind(arg, "a 2-D integer tensor", v)),
                None => Err(missing(arg)),
            },
            PredNode::Options(_) | PredNode::DataFormat(_) => match value {
                Some(v @ (ArgValue::Str { .. } | ArgValue::None)) => Ok(PredValue::Value(v.clone())),
                Some(v) => Err(wrong_kind(arg, "a string", v)),
                None => Ok(PredValue::Value(ArgValue::None)),
            },
            PredNode::Rank(_) => match value {
                Some(ArgValue::Int { value }) => {
                    in_range(arg, *value, 0, i64::MAX)?;
                    Ok(PredValue::Value(ArgValue::int(*value)))
                }
                Some(v) => Err(wrong_kind(arg, "an integer", v)),
                None => Err(missing(arg)),
            },
            PredNode::Int { lo, hi, .. } => match value {
                Some(ArgValue::Int { value }) => {
                    in_range(arg, *value, *lo, *hi)?;
                    Ok(PredValue::Value(ArgValue::int(*value)))
                }
                Some(v) => Err(wrong_kind(arg, "an integer", v)),
                None => Err(missing(arg)),
            },
            PredNode::Unchecked(_) => Ok(PredValue::Value(value.cloned().unwrap_or(ArgValue::None))),
            _ => Ok(PredValue::Call(call.clone())),
        }
    }
}

impl NodeFunc<()> for PredNode {
    type Value = PredValue;
    type Error = PredFailure;

    fn eval(
        &self,
        _ctx: &mut (),
        parents: &ParentValues<'_, PredValue>,
        _budget: &EditBudget,
    ) -> Result<Vec<Yield<PredValue>>, PredFailure> {
        let node = self.name();
        let value = match self {
            PredNode::Call => return Ok(Vec::new()),
            PredNode::TensorShape(_) | PredNode::TensorDType(_) => {
                let (shape, dtype) = take(parents.at(0), node, "tensor", "a tensor", |v| match v {
                    PredValue::Tensor { shape, dtype } => Some((shape, *dtype)),
                    _ => None,
                })?;
                match self {
                    PredNode::TensorShape(_) => PredValue::Shape(Shape::Dims(shape.clone())),
                    _ => PredValue::DType(dtype),
                }
            }
            PredNode::Column { col, .. } => {
                let rows = take(parents.at(0), node, "rows", "2-D rows", |v| match v {
                    PredValue::Rows(r) => Some(r),
                    _ => None,
                })?;
                PredValue::Shape(Shape::Dims(rows.iter().map(|r| r[*col]).collect()))
            }
            PredNode::Shapes => PredValue::Shapes(
                parents
                    .named()
                    .filter_map(|(k, v)| match v {
                        PredValue::Shape(s) => Some((k.to_string(), s.clone())),
                        _ => None,
                    })
                    .collect(),
            ),
            PredNode::DTypes => PredValue::DTypes(
                parents
                    .named()
                    .filter_map(|(k, v)| match v {
                        PredValue::DType(d) => Some((k.to_string(), *d)),
                        _ => None,
                    })
                    .collect(),
            ),
            PredNode::Values => PredValue::Values(
                parents
                    .named()
                    .filter_map(|(k, v)| match v {
                        PredValue::Value(a) => Some((k.to_string(), a.clone())),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => {
                let call = take(parents.at(0), node, "call", "the call arguments", |v| match v {
                    PredValue::Call(c) => Some(c),
                    _ => None,
                })?;
                self.check(call)?
            }
        };
        Ok(vec![Yield::free(value)])
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PredGraph {
    graph: Graph<PredNode>,
    call: NodeId,
    shapes: NodeId,
    dtypes: NodeId,
    values: NodeId,
}

pub fn build(def: &OpDef) -> Result<PredGraph, GraphError> {
    let mut g = Graph::new();
    let call = g.add_node("call", PredNode::Call, &[])?;
    let mut shape_nodes = Vec::new();
    let mut dtype_nodes = Vec::new();
    let mut value_nodes = Vec::new();

    for a in &def.args {
        let name = a.name.clone();
        let shape_node = |kind: PredNode| (format!("shape:{name}"), kind);
        match &a.kind {
            ArgKind::Tensor => {
                let t = g.add_node(format!("tensor:{name}"), PredNode::Tensor(name.clone()), &[call])?;
                let s = g.add_node(format!("shape:{name}"), PredNode::TensorShape(name.clone()), &[t])?;
                let d = g.add_node(format!("dtype:{name}"), PredNode::TensorDType(name.clone()), &[t])?;
                shape_nodes.push((name.clone(), s));
                dtype_nodes.push((name.clone(), d));
            }
            ArgKind::ShapeList { bcast } => {
                let (n, k) = shape_node(PredNode::ShapeList {
                    arg: name.clone(),
                    bcast: *bcast,
                });
                shape_nodes.push((name.clone(), g.add_node(n, k, &[call])?));
            }
            ArgKind::ShapeInt { lo, hi } => {
                let (n, k) = shape_node(PredNode::ShapeInt {
                    arg: name.clone(),
                    lo: *lo,
                    hi: *hi,
                });
                shape_nodes.push((name.clone(), g.add_node(n, k, &[call])?));
            }
            ArgKind::ShapeTensor => {
                let (n, k) = shape_node(PredNode::ShapeTensor(name.clone()));
                shape_nodes.push((name.clone(), g.add_node(n, k, &[call])?));
            }
            ArgKind::ShapeTensor2D { columns } => {
                let rows = g.add_node(
                    format!("rows:{name}"),
                    PredNode::ShapeTensor2D {
                        arg: name.clone(),
                        columns: columns.len(),
                    },
                    &[call],
                )?;
                for col in 0..columns.len() {
                    let key = format!("{name}.{col}");
                    let c = g.add_node(
                        format!("shape:{key}"),
                        PredNode::Column {
                            arg: name.clone(),
                            col,
                        },
                        &[rows],
                    )?;
                    shape_nodes.push((key, c));
                }
            }
            kind => {
                let node = match kind {
                    ArgKind::Options(_) => PredNode::Options(name.clone()),
                    ArgKind::DataFormat => PredNode::DataFormat(name.clone()),
                    ArgKind::Rank => PredNode::Rank(name.clone()),
                    ArgKind::Int { lo, hi } => PredNode::Int {
                        arg: name.clone(),
                        lo: *lo,
                        hi: *hi,
                    },
                    _ => PredNode::Unchecked(name.clone()),
                };
                value_nodes.push((name.clone(), g.add_node(format!("value:{name}"), node, &[call])?));
            }
        }
    }

    let shapes = g.add_node("shapes", PredNode::Shapes, &[])?;
    let dtypes = g.add_node("dtypes", PredNode::DTypes, &[])?;
    let values = g.add_node("values", PredNode::Values, &[])?;
    for (agg, nodes) in [(shapes, shape_nodes), (dtypes, dtype_nodes), (values, value_nodes)] {
        for (key, node) in nodes {
            g.append_named(agg, node, key)?;
        }
    }
    Ok(PredGraph {
        graph: g,
        call,
        shapes,
        dtypes,
        values,
    })
}

impl PredGraph {
    /// Run the local checks on `args`.
    pub fn observe(&self, args: &CallArgs) -> Result<Result<ObservedCall, ErrorReport>, EvalError> {
        let observed = HashMap::from([(self.call, PredValue::Call(args.clone()))]);
        let config = EvalConfig {
            budget: 0,
            max_yield: 1,
        };
        let mut ev = self
            .graph
            .evaluate((), &[self.shapes, self.dtypes, self.values], observed, config)?;
        let comb = match ev.next() {
            Some(Ok(comb)) => comb,
            Some(Err(PredFailure::Report(r))) => return Ok(Err(r)),
            Some(Err(PredFailure::Internal(e))) => return Err(e),
            None => return Err(EvalError::NoValue("predicate")),
        };
        let mut out = ObservedCall::default();
        for v in comb.values {
            match v {
                PredValue::Shapes(s) => out.shapes = s,
                PredValue::DTypes(d) => out.dtypes = d,
                PredValue::Values(v) => out.values = v,
                _ => {}
            }
        }
        Ok(Ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;

    fn schema() -> crate::schema::OpSchema {
        let mut b = SchemaBuilder::new("op");
        b.add_index('b', "batch", 1u32).unwrap();
        b.add_index('i', "spatial", (1u32, 2u32)).unwrap();
        b.add_index('k', "kernel", 'i').unwrap();
        b.arg_tensor("x", &["bi"]).unwrap();
        b.arg_shape_bcast_list("ksize", &["k"]).unwrap();
        b.arg_shape_tensor2d("pads", &[&["i"], &["i"]]).unwrap();
        b.arg_option("padding", &["VALID", "SAME"]).unwrap();
        b.arg_int("axis", 0, 1).unwrap();
        b.build().unwrap()
    }

    fn good() -> CallArgs {
        CallArgs::new()
            .with("x", ArgValue::tensor(&[2, 5], DType::Float32))
            .with("ksize", ArgValue::ints(&[3]))
            .with("pads", ArgValue::IntTensor2D { rows: vec![vec![1, 2]] })
            .with("axis", ArgValue::int(1))
    }

    #[test]
    fn observes_shapes_dtypes_and_values() {
        let s = schema();
        let obs = s.pred.observe(&good()).unwrap().unwrap();
        assert_eq!(obs.shapes.get("x"), Some(&Shape::Dims(vec![2, 5])));
        assert_eq!(obs.shapes.get("ksize"), Some(&Shape::Bcast(3)));
        assert_eq!(obs.shapes.get("pads.1"), Some(&Shape::Dims(vec![2])));
        assert_eq!(obs.dtypes, vec![("x".to_string(), DType::Float32)]);
        assert_eq!(obs.values.get("padding"), Some(&ArgValue::None));
        assert_eq!(obs.values.get("axis"), Some(&ArgValue::int(1)));
    }

    #[test]
    fn missing_tensor_is_local_error() {
        let s = schema();
        let mut args = good();
        args.0.retain(|(n, _)| n != "x");
        let r = s.pred.observe(&args).unwrap();
        assert_eq!(r, Err(ErrorReport::MissingArgument { arg: "x".into() }));
    }

    #[test]
    fn local_failures() {
        let s = schema();
        let mut args = good();
        args.set("ksize", ArgValue::ints(&[3, -1]));
        assert_eq!(
            s.pred.observe(&args).unwrap(),
            Err(ErrorReport::NegativeDim {
                arg: "ksize".into(),
                pos: 1,
                dim: -1
            })
        );
        let mut args = good();
        args.set("axis", ArgValue::int(4));
        assert!(matches!(
            s.pred.observe(&args).unwrap(),
            Err(ErrorReport::OutOfRange { value: 4, .. })
        ));
        let mut args = good();
        args.set("pads", ArgValue::IntTensor2D { rows: vec![vec![1]] });
        assert!(matches!(
            s.pred.observe(&args).unwrap(),
            Err(ErrorReport::NonRectangular { cols: 2, .. })
        ));
        let mut args = good();
        args.set("padding", ArgValue::int(1));
        assert!(matches!(
            s.pred.observe(&args).unwrap(),
            Err(ErrorReport::WrongKind { .. })
        ));
    }
}
