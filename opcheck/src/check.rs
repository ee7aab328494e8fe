// check.rs — Call-time boundary of a finalised schema
//
// `check_args` runs the predicate graph once over the observed arguments and,
// if every argument passes its local checks, searches the inference graph at
// edit budgets 0, 1, 2, ... up to `max_search_dist`. The first productive
// budget gives the outcome: a zero-cost interpretation means the call is
// valid, anything else is the list of minimal fixes. `check_return` compares
// returned tensors against the return signatures of that interpretation.
// Generation, the inventory and the self-validation loop live here too.
//
// Preconditions: the schema was finalised by `SchemaBuilder::build`.
// Postconditions: `Fixes` is non-empty and every fix in it has the same
//                 cost, the smallest for which any fix exists.
// Failure modes: evaluator faults → `EvalError`. Invalid calls are
//                `CheckOutcome` values, never errors.
// Side effects: none.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::args::{ArgValue, CallArgs};
use crate::budget::{deepen, Deepening};
use crate::config::SearchConfig;
use crate::diag::{codes, render_fixes, DiagLevel, Diagnostic, ErrorReport};
use crate::eval::EvalError;
use crate::fix::{Fix, ResolvedCall};
use crate::gen::{GeneratedCase, InventoryRow};
use crate::model::dims_string;
use crate::schema::{sig_for_layout, OpSchema};

// ── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Accepted with zero edits, under this interpretation.
    Valid(ResolvedCall),
    /// A single argument failed a check that no edit search can repair.
    Local(ErrorReport),
    /// Minimal-cost repairs, all of the same cost.
    Fixes(Vec<Fix>),
    /// Nothing found up to and including `max_dist`.
    Exhausted { max_dist: u32 },
}

impl CheckOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, CheckOutcome::Valid(_))
    }

    /// Cost of the suggested fixes, if any.
    pub fn fix_cost(&self) -> Option<u32> {
        match self {
            CheckOutcome::Fixes(fixes) => fixes.first().map(Fix::cost),
            _ => None,
        }
    }

    pub fn render(&self, op: &str, args: &CallArgs) -> String {
        match self {
            CheckOutcome::Valid(resolved) => format!("{op}: valid ({})\n", resolved.dims_summary()),
            CheckOutcome::Local(report) => format!("{}\n", report.diagnostic()),
            CheckOutcome::Fixes(fixes) => render_fixes(op, fixes, args),
            CheckOutcome::Exhausted { max_dist } => {
                let d = Diagnostic::new(
                    DiagLevel::Error,
                    None,
                    format!("{op}: no fix found within edit distance {max_dist}"),
                )
                .with_code(codes::NO_FIX_FOUND)
                .with_hint("raise --max-dist to search further");
                format!("{d}\n")
            }
        }
    }
}

/// Self-validation counts over generated cases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    /// Unmutated and accepted.
    pub true_neg: usize,
    /// Mutated and flagged.
    pub true_pos: usize,
    /// Unmutated but flagged.
    pub false_pos: usize,
    /// Mutated but accepted.
    pub false_neg: usize,
    /// Flagged with fixes whose cost differs from the mutation count.
    pub cost_mismatch: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.true_neg + self.true_pos + self.false_pos + self.false_neg
    }
}

// ── Call-time API ───────────────────────────────────────────────────────────

impl OpSchema {
    pub fn check_args(&self, args: &CallArgs, config: &SearchConfig) -> Result<CheckOutcome, EvalError> {
        let observed = match self.pred.observe(args)? {
            Ok(observed) => observed,
            Err(report) => {
                debug!(op = %self.def.op_path, %report, "local check failed");
                return Ok(CheckOutcome::Local(report));
            }
        };
        let search = deepen(config.max_search_dist, |dist| {
            self.infer.fixes(&self.def, &observed, config, dist)
        })?;
        Ok(match search {
            Deepening::Found { dist: 0, results } => match results.into_iter().next() {
                Some(fix) => CheckOutcome::Valid(ResolvedCall::from_fix(&fix)),
                None => CheckOutcome::Exhausted { max_dist: config.max_search_dist },
            },
            Deepening::Found { dist, results } => {
                let mut seen: BTreeSet<String> = BTreeSet::new();
                let fixes: Vec<Fix> = results.into_iter().filter(|fix| seen.insert(fix.to_string())).collect();
                debug!(op = %self.def.op_path, dist, fixes = fixes.len(), "fixes found");
                CheckOutcome::Fixes(fixes)
            }
            Deepening::Exhausted { max } => {
                debug!(op = %self.def.op_path, max, "search exhausted");
                CheckOutcome::Exhausted { max_dist: max }
            }
        })
    }

    /// Compare returned values against the return signatures under the
    /// interpretation `resolved` from a successful `check_args`.
    pub fn check_return(&self, resolved: &ResolvedCall, returned: &[ArgValue]) -> Option<ErrorReport> {
        let expected = &self.def.returns;
        if returned.len() != expected.len() {
            return Some(ErrorReport::ReturnCount {
                expected: expected.len(),
                got: returned.len(),
            });
        }
        for (index, (sigs, value)) in expected.iter().zip(returned).enumerate() {
            let ArgValue::Tensor { shape, .. } = value else {
                return Some(ErrorReport::ReturnKind {
                    index,
                    got: value.kind().to_string(),
                });
            };
            let want = sig_for_layout(sigs, resolved.layout).and_then(|s| s.shape(&resolved.index_dims));
            match want {
                Some(want) if &want != shape => {
                    return Some(ErrorReport::ReturnShape {
                        index,
                        expected: dims_string(&want),
                        got: dims_string(shape),
                    })
                }
                _ => {}
            }
        }
        None
    }

    /// Lazy stream of generated calls with at most `config.test_edits`
    /// mutations each. Restarting means calling again.
    pub fn generate_args<'s>(
        &'s self,
        config: &SearchConfig,
    ) -> Result<impl Iterator<Item = Result<GeneratedCase, EvalError>> + 's, EvalError> {
        self.gen.cases(&self.def, config, self.seed_for(config.seed))
    }

    /// Every valid rank / signature / dtype / layout combination.
    pub fn inventory(&self, config: &SearchConfig) -> Result<Vec<InventoryRow>, EvalError> {
        self.gen.inventory(&self.def, config, self.seed_for(config.seed))
    }

    /// Feed generated cases back through `check_args` and classify each.
    pub fn validate(&self, config: &SearchConfig, limit: Option<usize>) -> Result<Tally, EvalError> {
        let op = &self.def.op_path;
        let mut tally = Tally::default();
        let cases = self.generate_args(config)?;
        for case in cases.take(limit.unwrap_or(usize::MAX)) {
            let case = case?;
            let outcome = self.check_args(&case.args, config)?;
            match (case.mutations, outcome.is_valid()) {
                (0, true) => tally.true_neg += 1,
                (0, false) => {
                    warn!(op = %op, args = %case.args, "valid case flagged");
                    tally.false_pos += 1;
                }
                (_, true) => {
                    warn!(op = %op, args = %case.args, mutations = case.mutations, "mutated case accepted");
                    tally.false_neg += 1;
                }
                (m, false) => {
                    tally.true_pos += 1;
                    if let Some(cost) = outcome.fix_cost().filter(|&c| c != m) {
                        warn!(op = %op, args = %case.args, mutations = m, cost, "fix cost differs");
                        tally.cost_mismatch += 1;
                    }
                }
            }
        }
        debug!(op = %op, total = tally.total(), "validation finished");
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::dtype::DType;
    use crate::fix::{EditKind, EditValue};

    fn pool() -> OpSchema {
        catalog::avg_pool().unwrap()
    }

    fn pool_args(input: &[i64], dtype: DType) -> CallArgs {
        CallArgs::new()
            .with("input", ArgValue::tensor(input, dtype))
            .with("ksize", ArgValue::ints(&[3]))
            .with("strides", ArgValue::ints(&[2]))
            .with("padding", ArgValue::str("VALID"))
    }

    #[test]
    fn valid_call_resolves_output_dims() {
        let s = pool();
        let out = s
            .check_args(&pool_args(&[2, 10, 10, 3], DType::Float32), &SearchConfig::default())
            .unwrap();
        let CheckOutcome::Valid(resolved) = out else {
            panic!("expected a valid call, got {out:?}");
        };
        assert_eq!(resolved.layout, 0);
        assert_eq!(resolved.index_dims.get(&'o'), Some(&vec![4, 4]));
        assert_eq!(resolved.index_dims.get(&'k'), Some(&vec![3, 3]));
    }

    #[test]
    fn missing_argument_is_local() {
        let s = pool();
        let mut args = pool_args(&[2, 10, 10, 3], DType::Float32);
        args.0.retain(|(n, _)| n != "ksize");
        let out = s.check_args(&args, &SearchConfig::default()).unwrap();
        assert_eq!(
            out,
            CheckOutcome::Local(ErrorReport::MissingArgument { arg: "ksize".into() })
        );
    }

    #[test]
    fn wrong_dtype_gives_one_unit_fix() {
        let s = pool();
        let out = s
            .check_args(&pool_args(&[2, 10, 10, 3], DType::Int32), &SearchConfig::default())
            .unwrap();
        assert_eq!(out.fix_cost(), Some(1));
        let CheckOutcome::Fixes(fixes) = out else {
            panic!("expected fixes");
        };
        let edits = fixes[0].edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].kind, EditKind::ChangeDType);
        assert_eq!(edits[0].before, EditValue::DType(DType::Int32));
    }

    #[test]
    fn zero_budget_cannot_repair() {
        let s = pool();
        let config = SearchConfig {
            max_search_dist: 0,
            ..SearchConfig::default()
        };
        let out = s
            .check_args(&pool_args(&[2, 10, 10, 3], DType::Int32), &config)
            .unwrap();
        assert_eq!(out, CheckOutcome::Exhausted { max_dist: 0 });
        assert!(out.render("avg_pool", &CallArgs::new()).contains("E0201"));
    }

    #[test]
    fn return_shape_follows_resolution() {
        let s = pool();
        let out = s
            .check_args(&pool_args(&[2, 10, 10, 3], DType::Float32), &SearchConfig::default())
            .unwrap();
        let CheckOutcome::Valid(resolved) = out else {
            panic!("expected a valid call");
        };
        assert_eq!(
            s.check_return(&resolved, &[ArgValue::tensor(&[2, 4, 4, 3], DType::Float32)]),
            None
        );
        assert_eq!(
            s.check_return(&resolved, &[ArgValue::tensor(&[2, 5, 4, 3], DType::Float32)]),
            Some(ErrorReport::ReturnShape {
                index: 0,
                expected: dims_string(&[2, 4, 4, 3]),
                got: dims_string(&[2, 5, 4, 3]),
            })
        );
        assert_eq!(
            s.check_return(&resolved, &[]),
            Some(ErrorReport::ReturnCount { expected: 1, got: 0 })
        );
        assert!(matches!(
            s.check_return(&resolved, &[ArgValue::int(3)]),
            Some(ErrorReport::ReturnKind { index: 0, .. })
        ));
    }

    #[test]
    fn generated_valid_cases_pass() {
        let s = catalog::add().unwrap();
        let config = SearchConfig {
            test_edits: 0,
            ..SearchConfig::default()
        };
        let tally = s.validate(&config, Some(40)).unwrap();
        assert!(tally.total() > 0);
        assert_eq!(tally.true_neg, tally.total());
    }

    #[test]
    fn generation_is_seeded_per_schema() {
        let a = catalog::add().unwrap();
        let config = SearchConfig::default();
        let first: Vec<GeneratedCase> = a
            .generate_args(&config)
            .unwrap()
            .take(10)
            .collect::<Result<_, _>>()
            .unwrap();
        let again: Vec<GeneratedCase> = a
            .generate_args(&config)
            .unwrap()
            .take(10)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(first, again);
        assert!(!a.inventory(&config).unwrap().is_empty());
    }

    #[test]
    fn fixes_are_listed_once() {
        let s = pool();
        let out = s.check_args(&pool_args(&[2, 10, 10], DType::Int32), &SearchConfig::default()).unwrap();
        let CheckOutcome::Fixes(fixes) = out else {
            panic!("expected fixes, got {out:?}");
        };
        let texts: BTreeSet<String> = fixes.iter().map(|f| f.to_string()).collect();
        assert_eq!(texts.len(), fixes.len());
    }
}
