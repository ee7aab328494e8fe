// opcheck — Op argument checker
//
// Library root. Schemas are declared in `schema`, evaluated by the graphs in
// `pred`, `infer` and `gen`, and exposed at call time through `check`.

pub mod args;
pub mod budget;
pub mod catalog;
pub mod check;
pub mod config;
pub mod diag;
pub mod dims;
pub mod dtype;
pub mod eval;
pub mod fix;
pub mod gen;
pub mod graph;
pub mod infer;
pub mod model;
pub mod pred;
pub mod rules;
pub mod schema;
