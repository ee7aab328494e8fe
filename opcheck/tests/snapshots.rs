// Snapshot tests: lock the user-facing text of `explain` and fix reports.
//
// Snapshots are inline `insta` literals. The schema fingerprint line is
// dropped before comparison since it hashes the full declaration summary.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use opcheck::args::{ArgValue, CallArgs};
use opcheck::catalog::{self, window_output};
use opcheck::check::CheckOutcome;
use opcheck::config::SearchConfig;
use opcheck::diag::render_fixes;
use opcheck::dtype::DType;
use opcheck::schema::{OpSchema, SchemaBuilder};

fn explain_text(s: &OpSchema) -> String {
    let explained = s.explain();
    let lines: Vec<&str> = explained
        .lines()
        .filter(|l| !l.starts_with("fingerprint:"))
        .collect();
    lines.join("\n")
}

fn pool_with_output() -> OpSchema {
    let mut b = SchemaBuilder::new("pool");
    b.add_index('b', "batch", 1u32).unwrap();
    b.add_index('i', "input spatial", (1u32, 3u32)).unwrap();
    b.add_index('k', "kernel", 'i').unwrap();
    b.add_index('s', "stride", 'i').unwrap();
    b.add_index('o', "output spatial", 'i').unwrap();
    b.add_index('c', "channel", 1u32).unwrap();
    b.arg_tensor("input", &["bic"]).unwrap();
    b.arg_shape_bcast_list("ksize", &["k"]).unwrap();
    b.arg_shape_bcast_list("strides", &["s"]).unwrap();
    b.arg_option("padding", &["VALID", "SAME"]).unwrap();
    b.arg_tensor("out", &["boc"]).unwrap();
    b.computed_index_cw(
        'o',
        |v: &[i64], extra: &[ArgValue]| {
            window_output(v[0], v[1], v[2], extra[0].as_str().unwrap_or("VALID"))
        },
        |l: &[String], _: &[ArgValue]| format!("ceil(({} - {} + 1) / {})", l[0], l[1], l[2]),
        "iks",
        &["padding"],
    )
    .unwrap();
    b.build().unwrap()
}

#[test]
fn explain_add() {
    let s = catalog::add().unwrap();
    insta::assert_snapshot!(explain_text(&s), @r"
op: add
indices:
  e  element  1..4
arguments:
  x  tensor  e
  y  tensor  e
dtypes:
  x: int32, int64, float16, float32, float64
  y: same as x
returns:
  0: e
");
}

#[test]
fn explain_avg_pool() {
    let s = catalog::avg_pool().unwrap();
    insta::assert_snapshot!(explain_text(&s), @r"
op: avg_pool
indices:
  b  batch           1
  i  input spatial   1..3
  k  kernel          = i
  s  stride          = i
  o  output spatial  = i
  c  channel         1
arguments:
  input        tensor  bic | bci
  ksize        bcast shape list  k
  strides      bcast shape list  s
  padding      option  VALID, SAME
  data_format  data format
formats:
  NWC -> layout 0 when rank(i) = 1
  NHWC -> layout 0 when rank(i) = 2
  NDHWC -> layout 0 when rank(i) = 3
  NCW -> layout 1 when rank(i) = 1
  NCHW -> layout 1 when rank(i) = 2
  NCDHW -> layout 1 when rank(i) = 3
  (omitted) -> layout 0
dtypes:
  input: float16, float32, float64, bfloat16
  excluded: input=bfloat16, rank(i)=3
computed:
  o = ceil((i - k + 1) / s)
predicates:
  o >= 0
  k >= 1
  s >= 1
returns:
  0: boc | bco
");
}

#[test]
fn pool_output_fix_report() {
    let s = pool_with_output();
    let args = CallArgs::new()
        .with("input", ArgValue::tensor(&[2, 8, 10, 3], DType::Float32))
        .with("ksize", ArgValue::ints(&[3]))
        .with("strides", ArgValue::ints(&[2]))
        .with("padding", ArgValue::str("VALID"))
        .with("out", ArgValue::tensor(&[2, 4, 4, 3], DType::Float32));
    let CheckOutcome::Fixes(fixes) = s.check_args(&args, &SearchConfig::default()).unwrap() else {
        panic!("expected fixes");
    };
    let report = render_fixes(s.op_path(), &fixes, &args);
    insta::assert_snapshot!(report.trim_end(), @r"
error[E0200]: pool: suggested fix #1 (cost 1)
  --> out: change dimension 1 of 'out' from 4 to 3
               | input (bic) | ksize [k] | strides [s] | out (boc)
submitted      | 2  8  10 3  | 3 3       | 2 2         | 2 4 4 3
interpretation | b  i  i  c  | k k       | s s         | b o o c
               |             |           |             |   ^
corrected      | 2  8  10 3  | 3 3       | 2 2         | 2 3 4 3
");
}
