// args.rs — Call arguments as the checker sees them
//
// Tensors are described by shape and dtype only; the checker never touches
// element data. `TensorFactory` is the hook generation uses to turn a
// description into a concrete value for a framework under test.
//
// Preconditions: none.
// Postconditions: `CallArgs` preserves insertion order.
// Failure modes: `ArgValue::parse_cli` → `ArgParseError` for malformed text.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dtype::DType;
use crate::model::dims_string;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgValue {
    Tensor { shape: Vec<i64>, dtype: DType },
    IntList { values: Vec<i64> },
    Int { value: i64 },
    /// 1-D integer tensor holding a shape.
    IntTensor { values: Vec<i64> },
    /// 2-D integer tensor; `rows[d][j]` is dimension `d` of column `j`.
    IntTensor2D { rows: Vec<Vec<i64>> },
    Str { value: String },
    None,
}

impl ArgValue {
    pub fn tensor(shape: &[i64], dtype: DType) -> Self {
        ArgValue::Tensor {
            shape: shape.to_vec(),
            dtype,
        }
    }

    pub fn ints(values: &[i64]) -> Self {
        ArgValue::IntList {
            values: values.to_vec(),
        }
    }

    pub fn int(value: i64) -> Self {
        ArgValue::Int { value }
    }

    pub fn str(value: &str) -> Self {
        ArgValue::Str {
            value: value.to_string(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int { value } => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str { value } => Some(value),
            _ => None,
        }
    }

    /// Short type name used in local error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ArgValue::Tensor { .. } => "tensor",
            ArgValue::IntList { .. } => "integer list",
            ArgValue::Int { .. } => "integer",
            ArgValue::IntTensor { .. } => "integer tensor",
            ArgValue::IntTensor2D { .. } => "2-D integer tensor",
            ArgValue::Str { .. } => "string",
            ArgValue::None => "None",
        }
    }

    /// Parse the command-line spelling of an argument value:
    /// `tensor:<dtype>:[d,..]`, `itensor:[..]`, `itensor2d:[[..],..]`,
    /// `[..]`, an integer, `none`, or any other text as a string.
    pub fn parse_cli(text: &str) -> Result<Self, ArgParseError> {
        let text = text.trim();
        if let Some(rest) = text.strip_prefix("tensor:") {
            let (dtype, shape) = rest
                .split_once(':')
                .ok_or_else(|| ArgParseError::Malformed(text.to_string()))?;
            let dtype: DType = dtype
                .parse()
                .map_err(|_| ArgParseError::UnknownDType(dtype.to_string()))?;
            return Ok(ArgValue::Tensor {
                shape: parse_list(shape)?,
                dtype,
            });
        }
        if let Some(rest) = text.strip_prefix("itensor2d:") {
            let rows: Vec<Vec<i64>> = serde_json::from_str(rest)
                .map_err(|_| ArgParseError::Malformed(text.to_string()))?;
            return Ok(ArgValue::IntTensor2D { rows });
        }
        if let Some(rest) = text.strip_prefix("itensor:") {
            return Ok(ArgValue::IntTensor {
                values: parse_list(rest)?,
            });
        }
        if text.starts_with('[') {
            return Ok(ArgValue::IntList {
                values: parse_list(text)?,
            });
        }
        if text.eq_ignore_ascii_case("none") {
            return Ok(ArgValue::None);
        }
        if let Ok(value) = text.parse::<i64>() {
            return Ok(ArgValue::Int { value });
        }
        Ok(ArgValue::Str {
            value: text.to_string(),
        })
    }
}

fn parse_list(text: &str) -> Result<Vec<i64>, ArgParseError> {
    serde_json::from_str(text.trim()).map_err(|_| ArgParseError::Malformed(text.to_string()))
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Tensor { shape, dtype } => write!(f, "tensor({}, {})", dtype, dims_string(shape)),
            ArgValue::IntList { values } => write!(f, "{}", dims_string(values)),
            ArgValue::Int { value } => write!(f, "{value}"),
            ArgValue::IntTensor { values } => write!(f, "itensor({})", dims_string(values)),
            ArgValue::IntTensor2D { rows } => {
                let rows: Vec<String> = rows.iter().map(|r| dims_string(r)).collect();
                write!(f, "itensor2d([{}])", rows.join(","))
            }
            ArgValue::Str { value } => write!(f, "'{value}'"),
            ArgValue::None => write!(f, "None"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgParseError {
    #[error("malformed argument value '{0}'")]
    Malformed(String),
    #[error("unknown dtype '{0}'")]
    UnknownDType(String),
    #[error("expected name=value, got '{0}'")]
    MissingName(String),
}

// ── CallArgs ────────────────────────────────────────────────────────────────

/// Named argument values of one operation call, in call order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs(pub Vec<(String, ArgValue)>);

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: ArgValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Replace the value of `name`, or append it.
    pub fn set(&mut self, name: &str, value: ArgValue) {
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArgValue> {
        self.0.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a `name=value` command-line pair and add it.
    pub fn push_cli(&mut self, pair: &str) -> Result<(), ArgParseError> {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| ArgParseError::MissingName(pair.to_string()))?;
        self.set(name.trim(), ArgValue::parse_cli(value)?);
        Ok(())
    }
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(n, v)| format!("{n}={v}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

// ── Materialisation ─────────────────────────────────────────────────────────

/// Turns generated tensor descriptions into concrete values.
pub trait TensorFactory {
    type Tensor;
    type Error;

    fn make(&mut self, shape: &[i64], dtype: DType) -> Result<Self::Tensor, Self::Error>;
}

/// A generated argument after materialisation.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized<T> {
    Tensor(T),
    Value(ArgValue),
}

/// Materialise every tensor in `args` with `factory`, passing other values
/// through unchanged.
pub fn materialize<F: TensorFactory>(
    args: &CallArgs,
    factory: &mut F,
) -> Result<Vec<(String, Materialized<F::Tensor>)>, F::Error> {
    args.iter()
        .map(|(name, v)| {
            let m = match v {
                ArgValue::Tensor { shape, dtype } => Materialized::Tensor(factory.make(shape, *dtype)?),
                other => Materialized::Value(other.clone()),
            };
            Ok((name.to_string(), m))
        })
        .collect()
}

/// Zero-filled host tensor, mainly for dry runs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostTensorError {
    #[error("shape {shape} has a negative dimension")]
    NegativeDim { shape: String },
    #[error("shape {shape} needs {nelem} elements, over the limit of {limit}")]
    TooLarge { shape: String, nelem: u64, limit: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct HostTensorFactory {
    pub max_elements: u64,
}

impl Default for HostTensorFactory {
    fn default() -> Self {
        Self {
            max_elements: 10_000_000,
        }
    }
}

impl TensorFactory for HostTensorFactory {
    type Tensor = HostTensor;
    type Error = HostTensorError;

    fn make(&mut self, shape: &[i64], dtype: DType) -> Result<HostTensor, HostTensorError> {
        let mut nelem: u64 = 1;
        for &d in shape {
            let d = u64::try_from(d).map_err(|_| HostTensorError::NegativeDim {
                shape: dims_string(shape),
            })?;
            nelem = nelem.saturating_mul(d);
        }
        if nelem > self.max_elements {
            return Err(HostTensorError::TooLarge {
                shape: dims_string(shape),
                nelem,
                limit: self.max_elements,
            });
        }
        Ok(HostTensor {
            shape: shape.to_vec(),
            dtype,
            data: vec![0.0; nelem as usize],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_forms() {
        assert_eq!(
            ArgValue::parse_cli("tensor:float32:[2,3]").unwrap(),
            ArgValue::tensor(&[2, 3], DType::Float32)
        );
        assert_eq!(ArgValue::parse_cli("[1, 2]").unwrap(), ArgValue::ints(&[1, 2]));
        assert_eq!(ArgValue::parse_cli("-3").unwrap(), ArgValue::int(-3));
        assert_eq!(ArgValue::parse_cli("VALID").unwrap(), ArgValue::str("VALID"));
        assert_eq!(ArgValue::parse_cli("None").unwrap(), ArgValue::None);
        assert_eq!(
            ArgValue::parse_cli("itensor2d:[[1,2],[3,4]]").unwrap(),
            ArgValue::IntTensor2D {
                rows: vec![vec![1, 2], vec![3, 4]]
            }
        );
    }

    #[test]
    fn parse_cli_errors() {
        assert_eq!(
            ArgValue::parse_cli("tensor:float31:[2]"),
            Err(ArgParseError::UnknownDType("float31".into()))
        );
        assert!(ArgValue::parse_cli("[1,x]").is_err());
        let mut args = CallArgs::new();
        assert!(args.push_cli("novalue").is_err());
    }

    #[test]
    fn call_args_keep_order_and_replace() {
        let mut args = CallArgs::new()
            .with("b", ArgValue::int(1))
            .with("a", ArgValue::int(2));
        args.set("b", ArgValue::int(5));
        let names: Vec<&str> = args.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(args.get("b"), Some(&ArgValue::int(5)));
        assert_eq!(args.to_string(), "b=5, a=2");
    }

    #[test]
    fn host_factory_limits_size() {
        let mut f = HostTensorFactory { max_elements: 10 };
        assert_eq!(f.make(&[2, 5], DType::Float32).unwrap().data.len(), 10);
        assert!(matches!(
            f.make(&[4, 4], DType::Float32),
            Err(HostTensorError::TooLarge { nelem: 16, .. })
        ));
        assert!(f.make(&[-1], DType::Int8).is_err());
    }

    #[test]
    fn materialize_passes_non_tensors_through() {
        let args = CallArgs::new()
            .with("x", ArgValue::tensor(&[2], DType::Int32))
            .with("k", ArgValue::int(3));
        let out = materialize(&args, &mut HostTensorFactory::default()).unwrap();
        assert!(matches!(out[0].1, Materialized::Tensor(_)));
        assert_eq!(out[1].1, Materialized::Value(ArgValue::int(3)));
    }
}
