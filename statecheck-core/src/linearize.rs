//! Linearizability checking of concurrent branch traces.
//!
//! A run is linearizable when some merge of the branch traces, keeping each
//! branch in its own program order, replays through the model with every
//! postcondition holding. The search is exhaustive, so the number of
//! candidate orders grows with the multinomial coefficient of the branch
//! lengths; keep the combined length around a dozen steps.

use crate::state::{ActionRef, Environment, Observed};
use std::fmt;
use std::time::Instant;
use tracing::{trace, warn};

/// Combined branch length beyond which the search is likely to be slow.
pub const SEARCH_ADVISORY_STEPS: usize = 12;

/// An executed branch action and what it returned.
pub struct Operation<Sys, State> {
    pub action: ActionRef<Sys, State>,
    pub output: Observed,
    /// Monotonic start and end of the call, when recorded.
    pub interval: Option<(Instant, Instant)>,
}

impl<Sys, State> Operation<Sys, State> {
    /// An operation known only by its position in program order.
    pub fn new(action: ActionRef<Sys, State>, output: Observed) -> Self {
        Self {
            action,
            output,
            interval: None,
        }
    }

    pub fn with_interval(mut self, start: Instant, end: Instant) -> Self {
        self.interval = Some((start, end));
        self
    }

    /// `VarN = name(input) => output`.
    pub fn describe(&self) -> String {
        format!("{} => {}", self.action.display_action(), self.output)
    }

    /// Whether this call had returned before `other` was invoked.
    fn precedes(&self, other: &Self) -> bool {
        match (self.interval, other.interval) {
            (Some((_, end)), Some((start, _))) => end < start,
            _ => false,
        }
    }
}

impl<Sys, State> Clone for Operation<Sys, State> {
    fn clone(&self) -> Self {
        Self {
            action: self.action.clone(),
            output: self.output.clone(),
            interval: self.interval,
        }
    }
}

impl<Sys, State> fmt::Debug for Operation<Sys, State> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Verdict of the linearizability search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linearization {
    /// `order` is a sequential explanation of the observed outputs.
    Linearizable { order: Vec<String> },
    /// No order explains the outputs. `furthest` is the longest partial
    /// order that replayed successfully.
    NotLinearizable { furthest: Vec<String> },
}

impl Linearization {
    pub fn is_linearizable(&self) -> bool {
        matches!(self, Linearization::Linearizable { .. })
    }
}

/// Search for an order of `branches` that the model explains, starting from
/// the model `state` and environment left behind by the prefix.
pub fn linearize<Sys, State>(
    state: &State,
    env: &Environment,
    branches: &[Vec<Operation<Sys, State>>],
) -> Linearization
where
    State: Clone,
{
    let total: usize = branches.iter().map(Vec::len).sum();
    if total > SEARCH_ADVISORY_STEPS {
        warn!(
            steps = total,
            advisory = SEARCH_ADVISORY_STEPS,
            "combined branch length makes the interleaving search expensive"
        );
    }

    let mut search = Search {
        branches,
        positions: vec![0; branches.len()],
        path: Vec::with_capacity(total),
        furthest: Vec::new(),
        explored: 0,
    };

    let found = search.explore(state, env);
    trace!(explored = search.explored, found, "interleaving search finished");

    let describe = |path: &[(usize, usize)]| -> Vec<String> {
        path.iter()
            .map(|&(branch, index)| branches[branch][index].describe())
            .collect()
    };

    if found {
        Linearization::Linearizable {
            order: describe(&search.path),
        }
    } else {
        Linearization::NotLinearizable {
            furthest: describe(&search.furthest),
        }
    }
}

struct Search<'a, Sys, State> {
    branches: &'a [Vec<Operation<Sys, State>>],
    /// Next unplaced operation per branch.
    positions: Vec<usize>,
    /// `(branch, index)` of each placed operation.
    path: Vec<(usize, usize)>,
    furthest: Vec<(usize, usize)>,
    explored: usize,
}

impl<Sys, State: Clone> Search<'_, Sys, State> {
    fn explore(&mut self, state: &State, env: &Environment) -> bool {
        self.explored += 1;
        if self.path.len() > self.furthest.len() {
            self.furthest = self.path.clone();
        }
        if self.is_complete() {
            return true;
        }

        for branch in 0..self.branches.len() {
            let index = self.positions[branch];
            let Some(op) = self.branches[branch].get(index) else {
                continue;
            };
            if self.must_wait(branch, op) {
                continue;
            }
            // An order whose prefix fails cannot be rescued by extending it.
            let Some((next_state, next_env)) = replay(op, state, env) else {
                continue;
            };

            self.positions[branch] += 1;
            self.path.push((branch, index));
            if self.explore(&next_state, &next_env) {
                return true;
            }
            self.path.pop();
            self.positions[branch] -= 1;
        }

        false
    }

    fn is_complete(&self) -> bool {
        self.positions
            .iter()
            .zip(self.branches)
            .all(|(&position, branch)| position == branch.len())
    }

    /// Whether some other branch's next operation returned before `op`
    /// started, and so has to be placed first.
    fn must_wait(&self, branch: usize, op: &Operation<Sys, State>) -> bool {
        self.branches
            .iter()
            .zip(&self.positions)
            .enumerate()
            .filter(|&(other, _)| other != branch)
            .filter_map(|(_, (ops, &position))| ops.get(position))
            .any(|pending| pending.precedes(op))
    }
}

/// Apply `op` to the model and check its postcondition.
fn replay<Sys, State: Clone>(
    op: &Operation<Sys, State>,
    state: &State,
    env: &Environment,
) -> Option<(State, Environment)> {
    let mut env = env.clone();
    env.bind(op.action.output_id(), op.output.value()).ok()?;
    let next_state = op.action.next_state(state);
    op.action
        .check(&env, state, &next_state, &op.output)
        .ok()?;
    Some((next_state, env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ensure_eq, CommandError};
    use crate::gen::Gen;
    use crate::state::{Action, Command, SymbolicId, Var};
    use std::sync::Arc;
    use std::time::Duration;

    struct Increment;
    struct Decrement;
    struct Get;

    impl Command<(), i64> for Increment {
        type Input = ();
        type Output = ();

        fn name(&self) -> &str {
            "increment"
        }

        fn generate(&self, _state: &i64) -> Gen<()> {
            Gen::constant(())
        }

        fn execute(
            &self,
            _system: &(),
            _env: &Environment,
            _state: &i64,
            _input: &(),
        ) -> Result<(), CommandError> {
            Ok(())
        }

        fn update(&self, state: &i64, _input: &(), _output: &Var<()>) -> i64 {
            state + 1
        }
    }

    impl Command<(), i64> for Decrement {
        type Input = ();
        type Output = ();

        fn name(&self) -> &str {
            "decrement"
        }

        fn generate(&self, _state: &i64) -> Gen<()> {
            Gen::constant(())
        }

        fn execute(
            &self,
            _system: &(),
            _env: &Environment,
            _state: &i64,
            _input: &(),
        ) -> Result<(), CommandError> {
            Ok(())
        }

        fn update(&self, state: &i64, _input: &(), _output: &Var<()>) -> i64 {
            state - 1
        }
    }

    impl Command<(), i64> for Get {
        type Input = ();
        type Output = i64;

        fn name(&self) -> &str {
            "get"
        }

        fn generate(&self, _state: &i64) -> Gen<()> {
            Gen::constant(())
        }

        fn execute(
            &self,
            _system: &(),
            _env: &Environment,
            state: &i64,
            _input: &(),
        ) -> Result<i64, CommandError> {
            Ok(*state)
        }

        fn update(&self, state: &i64, _input: &(), _output: &Var<i64>) -> i64 {
            *state
        }

        fn ensure(
            &self,
            _env: &Environment,
            old: &i64,
            _new: &i64,
            _input: &(),
            output: &i64,
        ) -> Result<(), CommandError> {
            ensure_eq(old, output)
        }
    }

    fn increment(id: u64) -> Operation<(), i64> {
        Operation::new(Action::shared(&Arc::new(Increment), (), SymbolicId(id)), Observed::new(()))
    }

    fn decrement(id: u64) -> Operation<(), i64> {
        Operation::new(Action::shared(&Arc::new(Decrement), (), SymbolicId(id)), Observed::new(()))
    }

    fn get(id: u64, observed: i64) -> Operation<(), i64> {
        Operation::new(Action::shared(&Arc::new(Get), (), SymbolicId(id)), Observed::new(observed))
    }

    /// Prefix [increment] left the model at 1; branch A = [increment, get],
    /// branch B = [decrement].
    fn scenario(observed: i64) -> Linearization {
        let branches = vec![vec![increment(1), get(2, observed)], vec![decrement(3)]];
        linearize(&1, &Environment::new(), &branches)
    }

    #[test]
    fn test_get_observing_one_is_linearizable() {
        match scenario(1) {
            Linearization::Linearizable { order } => {
                assert_eq!(order.len(), 3);
                assert_eq!(order[2], "Var2 = get(()) => 1");
            }
            other => panic!("expected a linearization, got {other:?}"),
        }
    }

    #[test]
    fn test_get_observing_two_is_linearizable() {
        assert!(scenario(2).is_linearizable());
    }

    #[test]
    fn test_get_observing_three_is_rejected() {
        match scenario(3) {
            Linearization::NotLinearizable { furthest } => {
                // Both increment and decrement fit, the get never does.
                assert_eq!(furthest.len(), 2);
                assert!(furthest.iter().all(|op| !op.contains("get")));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_branches_are_linearizable() {
        let branches: Vec<Vec<Operation<(), i64>>> = vec![vec![], vec![]];
        assert_eq!(
            linearize(&0, &Environment::new(), &branches),
            Linearization::Linearizable { order: vec![] }
        );
    }

    #[test]
    fn test_real_time_order_is_respected() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(1);
        let t2 = t0 + Duration::from_millis(2);
        let t3 = t0 + Duration::from_millis(3);

        // Without timings the get can be ordered before the increment.
        let untimed = vec![vec![get(0, 0)], vec![increment(1)]];
        assert!(linearize(&0, &Environment::new(), &untimed).is_linearizable());

        // The increment returned before the get was invoked, so the get must
        // have seen it.
        let timed = vec![
            vec![get(0, 0).with_interval(t2, t3)],
            vec![increment(1).with_interval(t0, t1)],
        ];
        assert!(!linearize(&0, &Environment::new(), &timed).is_linearizable());

        let overlapping = vec![
            vec![get(0, 0).with_interval(t0, t2)],
            vec![increment(1).with_interval(t1, t3)],
        ];
        assert!(linearize(&0, &Environment::new(), &overlapping).is_linearizable());
    }

    /// Increment that reports the value it wrote.
    struct Bump;

    impl Command<(), i64> for Bump {
        type Input = ();
        type Output = i64;

        fn name(&self) -> &str {
            "bump"
        }

        fn generate(&self, _state: &i64) -> Gen<()> {
            Gen::constant(())
        }

        fn execute(
            &self,
            _system: &(),
            _env: &Environment,
            state: &i64,
            _input: &(),
        ) -> Result<i64, CommandError> {
            Ok(state + 1)
        }

        fn update(&self, state: &i64, _input: &(), _output: &Var<i64>) -> i64 {
            state + 1
        }

        fn ensure(
            &self,
            _env: &Environment,
            _old: &i64,
            new: &i64,
            _input: &(),
            output: &i64,
        ) -> Result<(), CommandError> {
            ensure_eq(new, output)
        }
    }

    #[test]
    fn test_lost_update_is_not_linearizable() {
        let bump = Arc::new(Bump);
        let bumped = |id: u64, observed: i64| {
            Operation::new(Action::shared(&bump, (), SymbolicId(id)), Observed::new(observed))
        };

        // Both calls read 0 and wrote 1.
        let lost = vec![vec![bumped(0, 1)], vec![bumped(1, 1)]];
        assert!(!linearize(&0, &Environment::new(), &lost).is_linearizable());

        let serialised = vec![vec![bumped(0, 2)], vec![bumped(1, 1)]];
        assert!(linearize(&0, &Environment::new(), &serialised).is_linearizable());
    }
}
