// End-to-end tests of the `opcheck` binary.
//
// These run the built executable and check exit codes and that output is
// byte-identical across runs with the same seed.

use std::path::PathBuf;
use std::process::{Command, Output};

fn opcheck_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_opcheck"))
}

fn run(args: &[&str]) -> Output {
    Command::new(opcheck_binary())
        .args(args)
        .output()
        .expect("failed to run opcheck")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn list_names_catalog_ops() {
    let out = run(&["list"]);
    assert!(out.status.success());
    let text = stdout(&out);
    for op in ["add", "avg_pool", "depthwise_conv2d", "space_to_depth"] {
        assert!(text.lines().any(|l| l == op), "missing {op} in:\n{text}");
    }
}

#[test]
fn check_valid_call_exits_zero() {
    let out = run(&[
        "check",
        "avg_pool",
        "--arg",
        "input=tensor:float32:[2,10,10,3]",
        "--arg",
        "ksize=[3]",
        "--arg",
        "strides=[2]",
        "--arg",
        "padding=VALID",
    ]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout(&out).starts_with("avg_pool: valid"));
}

#[test]
fn check_bad_call_exits_one() {
    let out = run(&[
        "check",
        "add",
        "--arg",
        "x=tensor:float32:[2,3]",
        "--arg",
        "y=tensor:float32:[2,4]",
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout(&out).contains("E0200"));
}

#[test]
fn unknown_op_exits_two() {
    let out = run(&["explain", "conv9d"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn generate_is_reproducible() {
    let args = ["generate", "avg_pool", "--limit", "25", "--json", "--seed", "7"];
    let a = run(&args);
    let b = run(&args);
    assert!(a.status.success());
    assert_eq!(a.stdout, b.stdout);
    let first = stdout(&a);
    let line = first.lines().next().expect("no cases generated");
    let v: serde_json::Value = serde_json::from_str(line).unwrap();
    assert!(v.get("mutations").is_some());
}

#[test]
fn generate_materialize_reports_elements() {
    let out = run(&["generate", "add", "--limit", "5", "--materialize", "--edits", "0"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert_eq!(text.lines().count(), 5);
    assert!(text.lines().all(|l| l.starts_with("[0] ") && l.contains("x=") && l.contains(" elems")));
}
