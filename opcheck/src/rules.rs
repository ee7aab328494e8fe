// rules.rs — Dtype constraints of a schema
//
// Three kinds of rule: a per-tensor whitelist, an equate rule making one
// tensor's dtype follow another's, and excluded combinations (dtype sets
// together with index ranks and/or layout) that the op does not implement.
// `DTypeRules::edit` finds the cheapest dtype correction for observed dtypes.
//
// Preconditions: equate rules form chains ending at a root tensor.
// Postconditions: `edit` changes the fewest tensors while avoiding excluded
//                 combinations whenever a dtype change alone can.
// Failure modes: none at query time; malformed declarations are rejected by
//                the schema builder.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use crate::dtype::{DType, ALL_DTYPES};
use crate::fix::{DTypesEdit, Edit};
use crate::model::{IndexCode, IndexRanks};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComboField {
    Tensor(String, Vec<DType>),
    Rank(IndexCode, u32),
    Layout(usize),
}

impl fmt::Display for ComboField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComboField::Tensor(name, dtypes) => {
                let names: Vec<&str> = dtypes.iter().map(|d| d.name()).collect();
                write!(f, "{name}={}", names.join("|"))
            }
            ComboField::Rank(idx, r) => write!(f, "rank({idx})={r}"),
            ComboField::Layout(l) => write!(f, "layout={l}"),
        }
    }
}

/// A combination of dtypes, ranks and layout the op does not implement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedCombo(pub Vec<ComboField>);

impl ExcludedCombo {
    pub fn matches(&self, dtypes: &BTreeMap<String, DType>, ranks: &IndexRanks, layout: usize) -> bool {
        self.0.iter().all(|field| match field {
            ComboField::Tensor(name, set) => dtypes.get(name).is_some_and(|d| set.contains(d)),
            ComboField::Rank(idx, r) => ranks.get(idx) == Some(r),
            ComboField::Layout(l) => *l == layout,
        })
    }
}

impl fmt::Display for ExcludedCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DTypeRules {
    valid: BTreeMap<String, Vec<DType>>,
    equate: BTreeMap<String, String>,
    combos: Vec<ExcludedCombo>,
}

impl DTypeRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_rule(&self, tensor: &str) -> bool {
        self.valid.contains_key(tensor) || self.equate.contains_key(tensor)
    }

    pub fn set_valid(&mut self, tensor: &str, dtypes: Vec<DType>) {
        self.valid.insert(tensor.to_string(), dtypes);
    }

    pub fn set_equate(&mut self, tensor: &str, source: &str) {
        self.equate.insert(tensor.to_string(), source.to_string());
    }

    pub fn add_combo(&mut self, combo: ExcludedCombo) {
        self.combos.push(combo);
    }

    pub fn combos(&self) -> &[ExcludedCombo] {
        &self.combos
    }

    /// Tensor whose dtype `tensor` ultimately follows.
    pub fn root<'a>(&'a self, tensor: &'a str) -> &'a str {
        let mut cur = tensor;
        let mut hops = 0;
        while let Some(next) = self.equate.get(cur) {
            cur = next;
            hops += 1;
            if hops > self.equate.len() {
                break;
            }
        }
        cur
    }

    pub fn equated_to(&self, tensor: &str) -> Option<&str> {
        self.equate.get(tensor).map(String::as_str)
    }

    /// Dtypes permitted for `tensor` (through its equate root).
    pub fn allowed(&self, tensor: &str) -> &[DType] {
        self.valid
            .get(self.root(tensor))
            .map(Vec::as_slice)
            .unwrap_or(&ALL_DTYPES)
    }

    pub fn matched_combo(
        &self,
        dtypes: &BTreeMap<String, DType>,
        ranks: &IndexRanks,
        layout: usize,
    ) -> Option<&ExcludedCombo> {
        self.combos.iter().find(|c| c.matches(dtypes, ranks, layout))
    }

    /// Cheapest dtype correction for `observed` (tensors in call order).
    ///
    /// Each equate class takes one dtype. Assignments matching an excluded
    /// combination are skipped; if every assignment matches one, the
    /// cheapest is returned with the combination left in `excluded`.
    pub fn edit(&self, observed: &[(String, DType)], ranks: &IndexRanks, layout: usize) -> DTypesEdit {
        let mut classes: Vec<(&str, Vec<(&str, DType)>)> = Vec::new();
        for (name, dtype) in observed {
            let root = self.root(name);
            match classes.iter_mut().find(|(r, _)| *r == root) {
                Some((_, members)) => members.push((name.as_str(), *dtype)),
                None => classes.push((root, vec![(name.as_str(), *dtype)])),
            }
        }
        let options: Vec<Vec<(DType, u32)>> = classes
            .iter()
            .map(|(root, members)| self.class_options(root, members))
            .collect();
        let (classes, options): (Vec<_>, Vec<_>) = classes
            .into_iter()
            .zip(options)
            .filter(|(_, opts)| !opts.is_empty())
            .unzip();

        let assign = |choice: &[usize]| -> BTreeMap<String, DType> {
            let mut out = BTreeMap::new();
            for ((_, members), (opts, &k)) in classes.iter().zip(options.iter().zip(choice)) {
                for (name, _) in members {
                    out.insert(name.to_string(), opts[k].0);
                }
            }
            out
        };
        let cost_of = |choice: &[usize]| -> u32 { options.iter().zip(choice).map(|(o, &k)| o[k].1).sum() };

        // Leftmost class varies slowest, so ties keep candidate order.
        let mut allowed: Option<(u32, Vec<usize>)> = None;
        let mut cheapest: Option<(u32, Vec<usize>)> = None;
        let mut choice = vec![0usize; options.len()];
        loop {
            let cost = cost_of(&choice);
            if cheapest.as_ref().map_or(true, |(c, _)| cost < *c) {
                cheapest = Some((cost, choice.clone()));
            }
            if allowed.as_ref().map_or(true, |(c, _)| cost < *c)
                && self.matched_combo(&assign(&choice), ranks, layout).is_none()
            {
                allowed = Some((cost, choice.clone()));
            }
            if !advance(&mut choice, &options) {
                break;
            }
        }

        let (choice, excluded) = match (allowed, cheapest) {
            (Some((_, c)), _) => (c, None),
            (None, Some((_, c))) => {
                let combo = self.matched_combo(&assign(&c), ranks, layout).map(|m| (m.to_string(), None));
                (c, combo)
            }
            (None, None) => return DTypesEdit::default(),
        };
        let free = excluded.is_some();

        let mut changes = Vec::new();
        for (k, (_, members)) in classes.iter().enumerate() {
            let (chosen, cost) = options[k][choice[k]];
            let alternatives: Vec<DType> = options[k]
                .iter()
                .enumerate()
                .filter(|(_, (_, c))| *c == cost)
                .filter(|&(j, _)| {
                    let mut alt = choice.clone();
                    alt[k] = j;
                    free || self.matched_combo(&assign(&alt), ranks, layout).is_none()
                })
                .map(|(_, (d, _))| *d)
                .collect();
            for (name, d) in members {
                if *d != chosen {
                    changes.push(Edit::change_dtype(name, *d, chosen, &alternatives));
                }
            }
        }

        DTypesEdit { changes, excluded }
    }

    /// Candidate dtypes for one equate class with the number of members each
    /// would change. Values already present come first, then whitelist order.
    fn class_options(&self, root: &str, members: &[(&str, DType)]) -> Vec<(DType, u32)> {
        let allowed = self.allowed(root);
        let mut opts: Vec<(DType, u32)> = Vec::new();
        let present = members.iter().map(|(_, d)| *d).filter(|d| allowed.contains(d));
        for d in present.chain(allowed.iter().copied()) {
            if !opts.iter().any(|(o, _)| *o == d) {
                let cost = members.iter().filter(|(_, m)| *m != d).count() as u32;
                opts.push((d, cost));
            }
        }
        if self.combos.is_empty() {
            if let Some(min) = opts.iter().map(|(_, c)| *c).min() {
                opts.retain(|(_, c)| *c == min);
            }
        }
        opts
    }
}

fn advance(choice: &mut [usize], options: &[Vec<(DType, u32)>]) -> bool {
    for k in (0..choice.len()).rev() {
        choice[k] += 1;
        if choice[k] < options[k].len() {
            return true;
        }
        choice[k] = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::EditValue;

    fn obs(pairs: &[(&str, DType)]) -> Vec<(String, DType)> {
        pairs.iter().map(|(n, d)| (n.to_string(), *d)).collect()
    }

    #[test]
    fn whitelist_violation_costs_one() {
        let mut r = DTypeRules::new();
        r.set_valid("x", vec![DType::Int32, DType::Float32]);
        let e = r.edit(&obs(&[("x", DType::Float64)]), &IndexRanks::new(), 0);
        assert_eq!(e.cost(), 1);
        assert_eq!(e.changes[0].after, EditValue::DType(DType::Int32));
        assert_eq!(e.changes[0].alternatives.len(), 2);
    }

    #[test]
    fn equate_class_changes_minority() {
        let mut r = DTypeRules::new();
        r.set_valid("a", vec![DType::Float32, DType::Float64]);
        r.set_equate("b", "a");
        r.set_equate("c", "b");
        assert_eq!(r.root("c"), "a");
        let e = r.edit(
            &obs(&[("a", DType::Float32), ("b", DType::Float64), ("c", DType::Float64)]),
            &IndexRanks::new(),
            0,
        );
        assert_eq!(e.cost(), 1);
        assert_eq!(e.changes[0].arg, "a");
        assert_eq!(e.changes[0].after, EditValue::DType(DType::Float64));
    }

    #[test]
    fn valid_dtypes_cost_nothing() {
        let mut r = DTypeRules::new();
        r.set_valid("x", vec![DType::Float32]);
        r.set_equate("y", "x");
        let e = r.edit(
            &obs(&[("x", DType::Float32), ("y", DType::Float32)]),
            &IndexRanks::new(),
            0,
        );
        assert_eq!(e.cost(), 0);
    }

    #[test]
    fn excluded_combo_matches_rank() {
        let mut r = DTypeRules::new();
        r.set_valid("x", vec![DType::Float32, DType::Float64]);
        r.add_combo(ExcludedCombo(vec![
            ComboField::Tensor("x".into(), vec![DType::Float64]),
            ComboField::Rank('i', 3),
        ]));
        let ranks3: IndexRanks = [('i', 3)].into_iter().collect();
        let ranks2: IndexRanks = [('i', 2)].into_iter().collect();
        let o = obs(&[("x", DType::Float64)]);
        assert_eq!(r.edit(&o, &ranks2, 0).cost(), 0);
        let e = r.edit(&o, &ranks3, 0);
        assert_eq!(e.cost(), 1);
        assert_eq!(e.excluded, None);
        assert_eq!(e.changes[0].after, EditValue::DType(DType::Float32));
    }

    #[test]
    fn excluded_dtype_is_skipped_in_one_change() {
        let mut r = DTypeRules::new();
        r.set_valid("x", vec![DType::Float32, DType::Float64]);
        r.add_combo(ExcludedCombo(vec![ComboField::Tensor("x".into(), vec![DType::Float32])]));
        let e = r.edit(&obs(&[("x", DType::Int8)]), &IndexRanks::new(), 0);
        assert_eq!(e.cost(), 1);
        assert_eq!(e.excluded, None);
        assert_eq!(e.changes.len(), 1);
        assert_eq!(e.changes[0].before, EditValue::DType(DType::Int8));
        assert_eq!(e.changes[0].after, EditValue::DType(DType::Float64));
        assert_eq!(e.changes[0].alternatives, vec![EditValue::DType(DType::Float64)]);
    }

    #[test]
    fn escape_moves_the_whole_equate_class() {
        let mut r = DTypeRules::new();
        r.set_valid("x", vec![DType::Float16, DType::Float32]);
        r.set_equate("y", "x");
        r.add_combo(ExcludedCombo(vec![
            ComboField::Tensor("x".into(), vec![DType::Float16]),
            ComboField::Rank('i', 3),
        ]));
        let ranks3: IndexRanks = [('i', 3)].into_iter().collect();
        let e = r.edit(&obs(&[("x", DType::Float16), ("y", DType::Float16)]), &ranks3, 0);
        assert_eq!(e.cost(), 2);
        assert_eq!(e.excluded, None);
        assert!(e
            .changes
            .iter()
            .all(|c| c.after == EditValue::DType(DType::Float32)));
        let names: Vec<&str> = e.changes.iter().map(|c| c.arg.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn unavoidable_combo_is_reported() {
        let mut r = DTypeRules::new();
        r.set_valid("x", vec![DType::Float32]);
        r.add_combo(ExcludedCombo(vec![
            ComboField::Tensor("x".into(), vec![DType::Float32]),
            ComboField::Layout(1),
        ]));
        let e = r.edit(&obs(&[("x", DType::Float32)]), &IndexRanks::new(), 1);
        assert!(e.changes.is_empty());
        assert_eq!(e.excluded, Some(("x=float32, layout=1".to_string(), None)));
        assert_eq!(e.cost(), 1);
    }
}
