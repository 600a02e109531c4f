//! Parallel state machine testing.
//!
//! A parallel plan is a sequential prefix followed by branches that run
//! concurrently against one shared system. Branches are planned from the
//! model state after the prefix, each unaware of the others. After the run,
//! the observed branch outputs must be explained by some interleaving of the
//! branches (see [`crate::linearize`]).
//!
//! The engine adds no synchronisation between branches; the system under test
//! is shared as-is. Races may reproduce only some of the time, so every shrink
//! candidate is re-executed several times and kept only if it fails at least
//! as often as the original.

use crate::error::{Counterexample, ParallelFailure, Result, StateError, StepFailure, TestResult};
use crate::linearize::{linearize, Linearization, Operation};
use crate::sequential::{execute_sequential, Sequential};
use crate::shrink::{self, Minimised};
use crate::state::{
    execute_step, replay_model, with_system, ActionRef, Command, Commands, Environment,
    GenerationContext, SystemFactory,
};
use crate::{data::*, error::FailureKind};
use std::fmt::Debug;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// A prefix and the branches that run concurrently after it.
pub struct Parallel<Sys, State> {
    pub prefix: Vec<ActionRef<Sys, State>>,
    pub branches: Vec<Vec<ActionRef<Sys, State>>>,
}

impl<Sys, State> Clone for Parallel<Sys, State> {
    fn clone(&self) -> Self {
        Self {
            prefix: self.prefix.clone(),
            branches: self.branches.clone(),
        }
    }
}

impl<Sys, State> Parallel<Sys, State> {
    pub fn new(
        prefix: Vec<ActionRef<Sys, State>>,
        branches: Vec<Vec<ActionRef<Sys, State>>>,
    ) -> Self {
        Self { prefix, branches }
    }

    /// Total number of actions.
    pub fn len(&self) -> usize {
        self.prefix.len() + self.branch_steps()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combined length of all branches.
    pub fn branch_steps(&self) -> usize {
        self.branches.iter().map(Vec::len).sum()
    }

    pub fn display_prefix(&self) -> Vec<String> {
        self.prefix.iter().map(|a| a.display_action()).collect()
    }

    pub fn display_branches(&self) -> Vec<Vec<String>> {
        self.branches
            .iter()
            .map(|branch| branch.iter().map(|a| a.display_action()).collect())
            .collect()
    }

    fn summary(&self) -> String {
        let lengths: Vec<String> = self.branches.iter().map(|b| b.len().to_string()).collect();
        format!(
            "prefix of {} actions, branches of {} actions",
            self.prefix.len(),
            lengths.join(" + ")
        )
    }
}

impl<Sys, State> Debug for Parallel<Sys, State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallel")
            .field("prefix", &self.display_prefix())
            .field("branches", &self.display_branches())
            .finish()
    }
}

/// Run one branch, recording when each call started and returned.
fn run_branch<Sys, State>(
    system: &Sys,
    state: &State,
    env: &Environment,
    branch: &[ActionRef<Sys, State>],
    start: &Barrier,
) -> std::result::Result<Vec<Operation<Sys, State>>, StepFailure>
where
    State: Clone,
{
    let mut state = state.clone();
    let mut env = env.clone();
    let mut trace = Vec::with_capacity(branch.len());

    start.wait();
    for (step, action) in branch.iter().enumerate() {
        let fail = |kind| StepFailure {
            step,
            command: action.name().to_string(),
            action: action.display_action(),
            kind,
        };

        let invoked = Instant::now();
        let output = execute_step(action.as_ref(), system, &env, &state).map_err(fail)?;
        let returned = Instant::now();

        env.bind(action.output_id(), output.value())
            .map_err(|e| fail(FailureKind::Model(e)))?;
        state = action.next_state(&state);
        trace.push(Operation::new(action.clone(), output).with_interval(invoked, returned));
    }
    Ok(trace)
}

/// Execute `parallel` against `system`: the prefix in order, then every branch
/// on its own thread, then the linearizability check.
pub fn execute_parallel<Sys, State>(
    system: &Sys,
    initial_state: &State,
    parallel: &Parallel<Sys, State>,
) -> std::result::Result<(), ParallelFailure>
where
    Sys: Sync,
    State: Clone + Send + Sync,
{
    let prefix = Sequential::new(parallel.prefix.clone());
    let (_, state, env) =
        execute_sequential(system, initial_state, &prefix).map_err(ParallelFailure::Prefix)?;

    let start = Barrier::new(parallel.branches.len());
    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = parallel
            .branches
            .iter()
            .map(|branch| {
                let (state, env, start) = (&state, &env, &start);
                scope.spawn(move || run_branch(system, state, env, branch, start))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(outcome) => outcome,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    });

    let mut traces = Vec::with_capacity(outcomes.len());
    for (branch, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(trace) => traces.push(trace),
            Err(failure) => return Err(ParallelFailure::Branch { branch, failure }),
        }
    }

    match linearize(&state, &env, &traces) {
        Linearization::Linearizable { order } => {
            trace!(order = ?order, "linearized");
            Ok(())
        }
        Linearization::NotLinearizable { furthest } => Err(ParallelFailure::NotLinearizable {
            traces: traces
                .iter()
                .map(|trace| trace.iter().map(Operation::describe).collect())
                .collect(),
            furthest,
        }),
    }
}

fn is_model_failure(failure: &ParallelFailure) -> bool {
    match failure {
        ParallelFailure::Prefix(step) | ParallelFailure::Branch { failure: step, .. } => {
            step.kind.is_model_error()
        }
        ParallelFailure::NotLinearizable { .. } => false,
    }
}

/// Specification of a parallel state machine test.
pub struct ParallelSpec<Sys, State> {
    initial_state: State,
    commands: Commands<Sys, State>,
    prefix_range: Range,
    branch_range: Range,
    branches: usize,
}

impl<Sys, State> ParallelSpec<Sys, State>
where
    Sys: Sync + 'static,
    State: Clone + Debug + Send + Sync + 'static,
{
    pub fn new(initial_state: State) -> Self {
        Self {
            initial_state,
            commands: Commands::new(),
            prefix_range: Range::new(0, 5),
            branch_range: Range::new(1, 5),
            branches: 2,
        }
    }

    pub fn with_command<C>(mut self, command: C) -> Self
    where
        C: Command<Sys, State>,
    {
        self.commands.add(command);
        self
    }

    pub fn with_prefix_range(mut self, min: usize, max: usize) -> Self {
        self.prefix_range = Range::new(min, max);
        self
    }

    /// Length of each branch.
    pub fn with_branch_range(mut self, min: usize, max: usize) -> Self {
        self.branch_range = Range::new(min, max);
        self
    }

    /// Number of concurrent branches, at least two.
    pub fn with_branches(mut self, branches: usize) -> Self {
        self.branches = branches;
        self
    }

    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    pub fn validate(&self, config: &Config) -> Result<()> {
        self.prefix_range.validate()?;
        self.branch_range.validate()?;
        if self.branches < 2 {
            return Err(StateError::InvalidConfig {
                message: format!(
                    "a parallel test needs at least 2 branches, got {}",
                    self.branches
                ),
            });
        }
        let steps = self.branch_range.max.saturating_mul(self.branches);
        if steps > config.max_branch_steps {
            return Err(StateError::InvalidConfig {
                message: format!(
                    "{} branches of up to {} actions exceed max_branch_steps ({})",
                    self.branches, self.branch_range.max, config.max_branch_steps
                ),
            });
        }
        Ok(())
    }

    /// Plan a prefix and branches for a trial of the given size.
    pub fn plan(&self, size: Size, seed: Seed, config: &Config) -> Result<Parallel<Sys, State>> {
        self.prefix_range.validate()?;
        self.branch_range.validate()?;
        let (length_seed, plan_seed) = seed.split();
        let (prefix_seed, mut branch_seed) = length_seed.split();
        let mut ctx = GenerationContext::new(self.initial_state.clone(), plan_seed);

        let prefix_len = self.prefix_range.sample(size, config.size_limit, prefix_seed);
        let prefix = self
            .commands
            .plan(&mut ctx, prefix_len, size, config.discard_limit)?;

        let mut branches = Vec::with_capacity(self.branches);
        for _ in 0..self.branches {
            let (this_seed, next) = branch_seed.split();
            branch_seed = next;
            let length = self.branch_range.sample(size, config.size_limit, this_seed);

            let mut fork = ctx.fork();
            branches.push(
                self.commands
                    .plan(&mut fork, length, size, config.discard_limit)?,
            );
            ctx.absorb_ids(&fork);
        }

        Ok(Parallel::new(prefix, branches))
    }

    /// Execute against a fresh system, tearing it down afterwards.
    pub fn run<F>(
        &self,
        factory: &F,
        parallel: &Parallel<Sys, State>,
    ) -> std::result::Result<(), ParallelFailure>
    where
        F: SystemFactory<Sys>,
    {
        with_system(factory, |system| {
            execute_parallel(system, &self.initial_state, parallel)
        })
    }

    /// Execute `parallel` `repeats` times. Returns how many runs failed and
    /// the last failure seen.
    fn failure_rate<F>(
        &self,
        factory: &F,
        parallel: &Parallel<Sys, State>,
        repeats: usize,
        accept_model_errors: bool,
    ) -> (usize, Option<ParallelFailure>)
    where
        F: SystemFactory<Sys>,
    {
        let mut failures = 0;
        let mut last = None;
        for _ in 0..repeats {
            if let Err(failure) = self.run(factory, parallel) {
                if accept_model_errors || !is_model_failure(&failure) {
                    failures += 1;
                    last = Some(failure);
                }
            }
        }
        (failures, last)
    }

    /// Shrink a failing plan, re-executing each candidate
    /// `config.shrink_repeats` times.
    pub fn shrink<F>(
        &self,
        factory: &F,
        parallel: Parallel<Sys, State>,
        failure: ParallelFailure,
        config: &Config,
    ) -> Minimised<Parallel<Sys, State>, ParallelFailure>
    where
        F: SystemFactory<Sys>,
    {
        let repeats = config.shrink_repeats;
        let accept_model_errors = is_model_failure(&failure);
        let (baseline, _) = self.failure_rate(factory, &parallel, repeats, accept_model_errors);
        let baseline = baseline.max(1);
        debug!(baseline, repeats, "parallel shrink baseline");

        shrink::minimise(
            parallel,
            failure,
            config.shrink_limit,
            |parallel| self.shrink_candidates(parallel),
            |candidate| {
                let (failures, failure) =
                    self.failure_rate(factory, candidate, repeats, accept_model_errors);
                if failures >= baseline {
                    return failure;
                }
                if failures > 0 {
                    warn!(
                        failures,
                        baseline,
                        candidate = %candidate.summary(),
                        "shrink candidate fails less often than the original, skipping"
                    );
                }
                None
            },
            Parallel::summary,
        )
    }

    fn shrink_candidates(&self, parallel: &Parallel<Sys, State>) -> Vec<Parallel<Sys, State>> {
        let mut candidates = Vec::new();

        for prefix in shrink::removals(&parallel.prefix) {
            candidates.push(Parallel::new(prefix, parallel.branches.clone()));
        }
        for (b, branch) in parallel.branches.iter().enumerate() {
            for shrunk in shrink::removals(branch) {
                let mut branches = parallel.branches.clone();
                branches[b] = shrunk;
                candidates.push(Parallel::new(parallel.prefix.clone(), branches));
            }
        }

        for (i, action) in parallel.prefix.iter().enumerate() {
            for shrunk in action.shrink_inputs() {
                let mut prefix = parallel.prefix.clone();
                prefix[i] = shrunk;
                candidates.push(Parallel::new(prefix, parallel.branches.clone()));
            }
        }
        for (b, branch) in parallel.branches.iter().enumerate() {
            for (i, action) in branch.iter().enumerate() {
                for shrunk in action.shrink_inputs() {
                    let mut branches = parallel.branches.clone();
                    branches[b][i] = shrunk;
                    candidates.push(Parallel::new(parallel.prefix.clone(), branches));
                }
            }
        }

        candidates.retain(|candidate| self.is_valid(candidate));
        candidates
    }

    /// The prefix replays from the initial state and every branch replays
    /// from the state after the prefix.
    fn is_valid(&self, parallel: &Parallel<Sys, State>) -> bool {
        match replay_model(&self.initial_state, &parallel.prefix) {
            Some(state) => parallel
                .branches
                .iter()
                .all(|branch| replay_model(&state, branch).is_some()),
            None => false,
        }
    }

    /// Run up to `config.test_limit` trials, shrinking the first failure.
    pub fn check<F>(&self, factory: &F, config: &Config) -> Result<TestResult>
    where
        F: SystemFactory<Sys>,
    {
        config.validate()?;
        self.validate(config)?;

        let mut seed = config.initial_seed();
        for test_num in 0..config.test_limit {
            let (trial_seed, next) = seed.split();
            seed = next;

            let size = Size::for_trial(test_num, config.test_limit, config.size_limit);
            let parallel = self.plan(size, trial_seed, config)?;
            debug!(
                test = test_num,
                size = size.get(),
                prefix = parallel.prefix.len(),
                branch_steps = parallel.branch_steps(),
                "planned parallel trial"
            );

            let Err(failure) = self.run(factory, &parallel) else {
                continue;
            };

            info!(test = test_num, plan = %parallel.summary(), "parallel trial failed, shrinking");
            let minimised = self.shrink(factory, parallel, failure, config);
            info!(
                shrinks = minimised.shrinks,
                plan = %minimised.value.summary(),
                "shrinking finished"
            );

            return Ok(TestResult::Fail {
                counterexample: Counterexample::Parallel {
                    prefix: minimised.value.display_prefix(),
                    branches: minimised.value.display_branches(),
                    failure: minimised.failure,
                },
                tests_run: test_num + 1,
                shrinks_performed: minimised.shrinks,
                shrink_steps: minimised.steps,
            });
        }

        Ok(TestResult::Pass {
            tests_run: config.test_limit,
        })
    }
}
