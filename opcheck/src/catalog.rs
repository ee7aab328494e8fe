// catalog.rs — Built-in reference operation schemas
//
// A handful of tensor operations declared through `SchemaBuilder`: pooling,
// depthwise convolution, space-to-depth and elementwise addition. The CLI,
// the integration tests and the benches look them up by name.
//
// Preconditions: none.
// Postconditions: every entry builds into an `OpSchema`.
// Failure modes: a declaration error → `SchemaError` from `lookup`.
// Side effects: none.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::args::ArgValue;
use crate::dims::{gen_fixed, gen_range, DimsSampler};
use crate::model::Dims;
use crate::schema::{OpSchema, SchemaBuilder, SchemaError};

pub type SchemaFn = fn() -> Result<OpSchema, SchemaError>;

const OPS: &[(&str, SchemaFn)] = &[
    ("add", add),
    ("avg_pool", avg_pool),
    ("depthwise_conv2d", depthwise_conv2d),
    ("space_to_depth", space_to_depth),
];

pub fn names() -> impl Iterator<Item = &'static str> {
    OPS.iter().map(|(n, _)| *n)
}

/// Build the named schema; `None` if the catalog has no such op.
pub fn lookup(name: &str) -> Option<Result<OpSchema, SchemaError>> {
    OPS.iter().find(|(n, _)| *n == name).map(|(_, f)| f())
}

// ── Formula helpers ─────────────────────────────────────────────────────────

/// ceil(n / d). A non-positive divisor gives -1, which then fails the
/// output's non-negativity predicate.
pub fn ceil_div(n: i64, d: i64) -> i64 {
    if d <= 0 {
        return -1;
    }
    -(-n).div_euclid(d)
}

fn padding_of(extra: &[ArgValue]) -> &str {
    extra.first().and_then(ArgValue::as_str).unwrap_or("VALID")
}

/// Output extent of a strided window over `input` under `padding`.
pub fn window_output(input: i64, window: i64, stride: i64, padding: &str) -> i64 {
    match padding {
        "SAME" => ceil_div(input, stride),
        _ => ceil_div(input - window + 1, stride),
    }
}

fn window_template(l: &[String], extra: &[ArgValue]) -> String {
    match padding_of(extra) {
        "SAME" => format!("ceil({} / {})", l[0], l[2]),
        _ => format!("ceil(({} - {} + 1) / {})", l[0], l[1], l[2]),
    }
}

/// `(whole, block)` pairs where one block size, drawn from `block`, is
/// shared by every component and each whole component is a multiple of it.
fn uniform_blocks(block: (i64, i64), mult: (i64, i64)) -> DimsSampler {
    Arc::new(move |ranks: &[u32], rng: &mut StdRng| -> Vec<Vec<Dims>> {
        let (Some(&rw), Some(&rb)) = (ranks.first(), ranks.get(1)) else {
            return Vec::new();
        };
        let size = rng.gen_range(block.0..=block.1);
        let whole: Dims = (0..rw).map(|_| size * rng.gen_range(mult.0..=mult.1)).collect();
        vec![vec![whole, vec![size; rb as usize]]]
    })
}

// ── Operations ──────────────────────────────────────────────────────────────

pub fn add() -> Result<OpSchema, SchemaError> {
    let mut b = SchemaBuilder::new("add");
    b.add_index('e', "element", (1u32, 4u32))?;
    b.arg_tensor("x", &["e"])?;
    b.arg_tensor("y", &["e"])?;
    b.valid_dtypes("x", &["int32", "int64", "float"])?;
    b.equate_dtypes("y", "x")?;
    b.add_index_generator("e", gen_range(1, 6))?;
    b.return_tensor(&["e"])?;
    b.build()
}

pub fn avg_pool() -> Result<OpSchema, SchemaError> {
    let mut b = SchemaBuilder::new("avg_pool");
    b.add_index('b', "batch", 1u32)?
        .add_index('i', "input spatial", (1u32, 3u32))?
        .add_index('k', "kernel", 'i')?
        .add_index('s', "stride", 'i')?
        .add_index('o', "output spatial", 'i')?
        .add_index('c', "channel", 1u32)?;
    b.arg_tensor("input", &["bic", "bci"])?;
    b.arg_shape_bcast_list("ksize", &["k"])?;
    b.arg_shape_bcast_list("strides", &["s"])?;
    b.arg_option("padding", &["VALID", "SAME"])?;
    b.arg_layout_table(
        "data_format",
        &[
            &[(1, "NWC"), (2, "NHWC"), (3, "NDHWC")],
            &[(1, "NCW"), (2, "NCHW"), (3, "NCDHW")],
        ],
        'i',
        Some(0),
    )?;
    b.valid_dtypes("input", &["float16, bfloat16", "float32", "float64"])?;
    b.exclude_combos(&[("input", "bfloat16"), ("i", "3")])?;
    b.computed_index_cw(
        'o',
        |v: &[i64], extra: &[ArgValue]| window_output(v[0], v[1], v[2], padding_of(extra)),
        window_template,
        "iks",
        &["padding"],
    )?;
    b.add_index_generator("k", gen_range(1, 3))?;
    b.add_index_generator("s", gen_range(1, 3))?;
    b.dims_pred_rng('k', Some(1), None)?;
    b.dims_pred_rng('s', Some(1), None)?;
    b.return_tensor(&["boc", "bco"])?;
    b.build()
}

pub fn depthwise_conv2d() -> Result<OpSchema, SchemaError> {
    let mut b = SchemaBuilder::new("depthwise_conv2d");
    b.add_index('b', "batch", 1u32)?
        .add_index('i', "input spatial", 2u32)?
        .add_index('f', "filter spatial", 'i')?
        .add_index('s', "stride", 'i')?
        .add_index('o', "output spatial", 'i')?
        .add_index('c', "input channel", 1u32)?
        .add_index('m', "channel multiplier", 1u32)?
        .add_index('z', "output channel", 1u32)?;
    b.arg_tensor("input", &["bic", "bci"])?;
    b.arg_tensor("filter", &["fcm"])?;
    b.arg_shape_bcast_list("strides", &["s"])?;
    b.arg_option("padding", &["VALID", "SAME"])?;
    b.arg_layout_table("data_format", &[&[(2, "NHWC")], &[(2, "NCHW")]], 'i', Some(0))?;
    b.valid_dtypes("input", &["float16, bfloat16", "float32", "float64"])?;
    b.equate_dtypes("filter", "input")?;
    b.computed_index_cw(
        'o',
        |v: &[i64], extra: &[ArgValue]| window_output(v[0], v[1], v[2], padding_of(extra)),
        window_template,
        "ifs",
        &["padding"],
    )?;
    b.computed_index(
        'z',
        |d: &[Dims], _: &[ArgValue]| vec![d[0][0] * d[1][0]],
        |l: &[String], _: &[ArgValue]| format!("{} * {}", l[0], l[1]),
        "cm",
        &[],
    )?;
    b.add_index_generator("f", gen_range(1, 3))?;
    b.add_index_generator("s", gen_range(1, 2))?;
    b.add_index_generator("m", gen_fixed(vec![vec![vec![1]], vec![vec![2]]]))?;
    b.dims_pred_rng('s', Some(1), None)?;
    b.return_tensor(&["boz", "bzo"])?;
    b.build()
}

pub fn space_to_depth() -> Result<OpSchema, SchemaError> {
    let mut b = SchemaBuilder::new("space_to_depth");
    b.add_index('b', "batch", 1u32)?
        .add_index('i', "input spatial", 2u32)?
        .add_index('k', "block", 'i')?
        .add_index('o', "output spatial", 'i')?
        .add_index('c', "input channel", 1u32)?
        .add_index('z', "output channel", 1u32)?;
    b.arg_tensor("input", &["bic", "bci"])?;
    b.arg_shape_int("block_size", 'k', 2, None)?;
    b.arg_layout_table("data_format", &[&[(2, "NHWC")], &[(2, "NCHW")]], 'i', Some(0))?;
    b.computed_index_cw(
        'o',
        |v: &[i64], _: &[ArgValue]| if v[1] > 0 { v[0] / v[1] } else { -1 },
        |l: &[String], _: &[ArgValue]| format!("{} / {}", l[0], l[1]),
        "ik",
        &[],
    )?;
    b.computed_index(
        'z',
        |d: &[Dims], _: &[ArgValue]| vec![d[0][0] * d[1].iter().product::<i64>()],
        |l: &[String], _: &[ArgValue]| format!("{} * prod({})", l[0], l[1]),
        "ck",
        &[],
    )?;
    b.dims_pred_cw(
        "i % k == 0",
        |v: &[i64]| v[1] > 0 && v[0] % v[1] == 0,
        |l: &[String]| format!("{} % {} == 0", l[0], l[1]),
        "ik",
    )?;
    b.add_index_generator("ik", uniform_blocks((2, 3), (1, 4)))?;
    b.return_tensor(&["boz", "bzo"])?;
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn every_entry_builds() {
        for name in names() {
            let s = lookup(name).unwrap().unwrap();
            assert_eq!(s.op_path(), name);
        }
        assert!(lookup("conv9d").is_none());
    }

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(8, 2), 4);
        assert_eq!(ceil_div(7, 2), 4);
        assert_eq!(ceil_div(-1, 2), 0);
        assert_eq!(ceil_div(-3, 2), -1);
        assert_eq!(ceil_div(5, 0), -1);
    }

    #[test]
    fn window_output_by_padding() {
        assert_eq!(window_output(10, 3, 2, "VALID"), 4);
        assert_eq!(window_output(9, 3, 2, "VALID"), 4);
        assert_eq!(window_output(8, 3, 2, "VALID"), 3);
        assert_eq!(window_output(9, 3, 2, "SAME"), 5);
    }

    #[test]
    fn uniform_blocks_share_one_size() {
        let sampler = uniform_blocks((2, 3), (1, 4));
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let out = sampler(&[2, 2], &mut rng);
            let (whole, block) = (&out[0][0], &out[0][1]);
            assert_eq!(block[0], block[1]);
            assert!(whole.iter().all(|w| w % block[0] == 0));
        }
    }
}
