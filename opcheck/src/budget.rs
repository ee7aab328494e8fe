// budget.rs — Edit budgets and the iterative-deepening driver
//
// `EditBudget` is the per-node view of how many edits remain on the current
// path. Nodes take a `Reservation` for each cost they charge; dropping the
// reservation returns the edits. `deepen` runs an attempt at distances
// 0, 1, …, max and stops at the first distance that produces results.
//
// Preconditions: none.
// Postconditions: a `Reservation` never outlives its budget and always
//                 restores exactly the amount it took.
// Failure modes: `deepen` forwards the attempt's error unchanged.
// Side effects: debug tracing per search level.

use std::cell::Cell;

use tracing::debug;

/// Edits still available to a node while it produces its results.
#[derive(Debug)]
pub struct EditBudget {
    remaining: Cell<u32>,
}

impl EditBudget {
    pub fn new(avail: u32) -> Self {
        Self {
            remaining: Cell::new(avail),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.get()
    }

    /// Take `cost` edits for the lifetime of the returned guard, or `None`
    /// when fewer than `cost` remain.
    pub fn reserve(&self, cost: u32) -> Option<Reservation<'_>> {
        let left = self.remaining.get();
        if cost > left {
            return None;
        }
        self.remaining.set(left - cost);
        Some(Reservation { budget: self, cost })
    }
}

/// Scoped hold on part of an `EditBudget`.
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a EditBudget,
    cost: u32,
}

impl Reservation<'_> {
    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let left = self.budget.remaining.get();
        self.budget.remaining.set(left + self.cost);
    }
}

// ── Iterative deepening ─────────────────────────────────────────────────────

/// Result of a bounded minimal-cost search.
#[derive(Debug, Clone, PartialEq)]
pub enum Deepening<T> {
    /// `results` were all found at `dist`, the smallest productive distance.
    Found { dist: u32, results: Vec<T> },
    /// No distance up to and including `max` produced anything.
    Exhausted { max: u32 },
}

/// Run `attempt(d)` for d = 0..=max, returning at the first non-empty result.
pub fn deepen<T, E>(
    max: u32,
    mut attempt: impl FnMut(u32) -> Result<Vec<T>, E>,
) -> Result<Deepening<T>, E> {
    for dist in 0..=max {
        let results = attempt(dist)?;
        debug!(dist, found = results.len(), "search level finished");
        if !results.is_empty() {
            return Ok(Deepening::Found { dist, results });
        }
    }
    Ok(Deepening::Exhausted { max })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_restores_on_drop() {
        let budget = EditBudget::new(2);
        {
            let r = budget.reserve(1).unwrap();
            assert_eq!(r.cost(), 1);
            assert_eq!(budget.remaining(), 1);
            let inner = budget.reserve(1).unwrap();
            assert_eq!(budget.remaining(), 0);
            assert!(budget.reserve(1).is_none());
            drop(inner);
            assert_eq!(budget.remaining(), 1);
        }
        assert_eq!(budget.remaining(), 2);
    }

    #[test]
    fn zero_cost_reservation_always_succeeds() {
        let budget = EditBudget::new(0);
        assert!(budget.reserve(0).is_some());
        assert!(budget.reserve(1).is_none());
    }

    #[test]
    fn deepen_stops_at_first_productive_level() {
        let mut seen = Vec::new();
        let out: Result<Deepening<u32>, ()> = deepen(5, |d| {
            seen.push(d);
            Ok(if d >= 2 { vec![d] } else { vec![] })
        });
        assert_eq!(out, Ok(Deepening::Found { dist: 2, results: vec![2] }));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn deepen_exhausts() {
        let out: Result<Deepening<u32>, ()> = deepen(1, |_| Ok(vec![]));
        assert_eq!(out, Ok(Deepening::Exhausted { max: 1 }));
    }

    #[test]
    fn deepen_forwards_errors() {
        let out: Result<Deepening<u32>, &str> = deepen(3, |d| if d == 1 { Err("boom") } else { Ok(vec![]) });
        assert_eq!(out, Err("boom"));
    }
}
