//! Sequential state machine testing.
//!
//! A trial plans a command sequence against the model, replays it against a
//! fresh system and checks every postcondition. Failing sequences are shrunk
//! by removing actions and simplifying inputs, re-executing every candidate.

use crate::error::{Counterexample, Result, StepFailure, TestResult};
use crate::shrink::{self, Minimised};
use crate::state::{
    execute_step, replay_model, with_system, ActionRef, Command, Commands, Environment,
    GenerationContext, Observed, SystemFactory,
};
use crate::{data::*, error::FailureKind};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, info, trace};

/// A sequence of actions to execute in order.
pub struct Sequential<Sys, State> {
    pub actions: Vec<ActionRef<Sys, State>>,
}

impl<Sys, State> Clone for Sequential<Sys, State> {
    fn clone(&self) -> Self {
        Self {
            actions: self.actions.clone(),
        }
    }
}

impl<Sys, State> Sequential<Sys, State> {
    pub fn new(actions: Vec<ActionRef<Sys, State>>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn display_actions(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.display_action()).collect()
    }
}

impl<Sys, State> Debug for Sequential<Sys, State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.display_actions()).finish()
    }
}

/// An action that ran, with the output it produced.
#[derive(Debug, Clone)]
pub struct ExecutedStep {
    pub action: String,
    pub output: Observed,
}

/// Execute a sequence against `system`, checking each postcondition.
///
/// Returns the executed steps, and the final model state and environment,
/// or the first failing step.
pub fn execute_sequential<Sys, State>(
    system: &Sys,
    initial_state: &State,
    sequential: &Sequential<Sys, State>,
) -> std::result::Result<(Vec<ExecutedStep>, State, Environment), StepFailure>
where
    State: Clone,
{
    let mut state = initial_state.clone();
    let mut env = Environment::new();
    let mut executed = Vec::with_capacity(sequential.len());

    for (step, action) in sequential.actions.iter().enumerate() {
        let fail = |kind| StepFailure {
            step,
            command: action.name().to_string(),
            action: action.display_action(),
            kind,
        };

        let output = execute_step(action.as_ref(), system, &env, &state).map_err(fail)?;
        trace!(step, action = %action.display_action(), output = %output, "executed");

        env.bind(action.output_id(), output.value())
            .map_err(|e| fail(FailureKind::Model(e)))?;

        let new_state = action.next_state(&state);
        action
            .check(&env, &state, &new_state, &output)
            .map_err(|e| fail(FailureKind::from_ensure(e)))?;

        executed.push(ExecutedStep {
            action: action.display_action(),
            output,
        });
        state = new_state;
    }

    Ok((executed, state, env))
}

/// Specification of a sequential state machine test.
pub struct SequentialSpec<Sys, State> {
    initial_state: State,
    commands: Commands<Sys, State>,
    range: Range,
}

impl<Sys, State> SequentialSpec<Sys, State>
where
    Sys: 'static,
    State: Clone + Debug + Send + Sync + 'static,
{
    pub fn new(initial_state: State) -> Self {
        Self {
            initial_state,
            commands: Commands::new(),
            range: Range::new(1, 50),
        }
    }

    pub fn with_command<C>(mut self, command: C) -> Self
    where
        C: Command<Sys, State>,
    {
        self.commands.add(command);
        self
    }

    /// Sequence lengths to sample from.
    pub fn with_range(mut self, min: usize, max: usize) -> Self {
        self.range = Range::new(min, max);
        self
    }

    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    pub fn range(&self) -> Range {
        self.range
    }

    /// Plan one sequence for a trial of the given size.
    pub fn plan(&self, size: Size, seed: Seed, config: &Config) -> Result<Sequential<Sys, State>> {
        self.range.validate()?;
        let (length_seed, plan_seed) = seed.split();
        let length = self.range.sample(size, config.size_limit, length_seed);
        let mut ctx = GenerationContext::new(self.initial_state.clone(), plan_seed);
        let actions = self
            .commands
            .plan(&mut ctx, length, size, config.discard_limit)?;
        Ok(Sequential::new(actions))
    }

    /// Execute a sequence against a fresh system, tearing it down afterwards.
    pub fn run<F>(
        &self,
        factory: &F,
        sequential: &Sequential<Sys, State>,
    ) -> std::result::Result<Vec<ExecutedStep>, StepFailure>
    where
        F: SystemFactory<Sys>,
    {
        with_system(factory, |system| {
            execute_sequential(system, &self.initial_state, sequential)
                .map(|(executed, _, _)| executed)
        })
    }

    /// Shrink a failing sequence to a smaller one that still fails.
    pub fn shrink<F>(
        &self,
        factory: &F,
        sequential: Sequential<Sys, State>,
        failure: StepFailure,
        config: &Config,
    ) -> Minimised<Sequential<Sys, State>, StepFailure>
    where
        F: SystemFactory<Sys>,
    {
        let accept_model_errors = failure.kind.is_model_error();
        shrink::minimise(
            sequential,
            failure,
            config.shrink_limit,
            |seq| self.shrink_candidates(seq),
            |candidate| match self.run(factory, candidate) {
                Err(failure) if accept_model_errors || !failure.kind.is_model_error() => {
                    Some(failure)
                }
                _ => None,
            },
            |seq| format!("{} actions", seq.len()),
        )
    }

    /// Smaller sequences that are still valid against the model.
    fn shrink_candidates(
        &self,
        sequential: &Sequential<Sys,
        State>,
    ) -> Vec<Sequential<Sys, State>> {
        let actions = &sequential.actions;
        let mut candidates: Vec<Vec<ActionRef<Sys, State>>> = shrink::removals(actions);

        for (i, action) in actions.iter().enumerate() {
            for shrunk in action.shrink_inputs() {
                let mut candidate = actions.clone();
                candidate[i] = shrunk;
                candidates.push(candidate);
            }
        }

        candidates
            .into_iter()
            .filter(|candidate| !candidate.is_empty())
            .filter(|candidate| replay_model(&self.initial_state, candidate).is_some())
            .map(Sequential::new)
            .collect()
    }

    /// Run up to `config.test_limit` trials, shrinking the first failure.
    ///
    /// Engine errors, such as a model in which no command is applicable, are
    /// returned as `Err`; failing trials produce [`TestResult::Fail`].
    pub fn check<F>(&self, factory: &F, config: &Config) -> Result<TestResult>
    where
        F: SystemFactory<Sys>,
    {
        config.validate()?;
        self.range.validate()?;

        let mut seed = config.initial_seed();
        let seeds: Vec<Seed> = (0..config.test_limit)
            .map(|_| {
                let (trial_seed, next) = seed.split();
                seed = next;
                trial_seed
            })
            .collect();

        let found = if config.workers <= 1 {
            self.run_trials(factory, config, &seeds, 0, 1, &AtomicUsize::new(usize::MAX))?
        } else {
            self.run_trials_concurrently(factory, config, &seeds)?
        };

        let Some((test_num, sequential, failure)) = found else {
            return Ok(TestResult::Pass {
                tests_run: config.test_limit,
            });
        };

        info!(
            test = test_num,
            actions = sequential.len(),
            failure = %failure,
            "sequential trial failed, shrinking"
        );
        let minimised = self.shrink(factory, sequential, failure, config);
        info!(
            shrinks = minimised.shrinks,
            actions = minimised.value.len(),
            "shrinking finished"
        );

        Ok(TestResult::Fail {
            counterexample: Counterexample::Sequential {
                actions: minimised.value.display_actions(),
                failure: minimised.failure,
            },
            tests_run: test_num + 1,
            shrinks_performed: minimised.shrinks,
            shrink_steps: minimised.steps,
        })
    }

    /// Trials `first, first + stride, ...`. Stops early once `earliest`
    /// holds a smaller failing trial number.
    #[allow(clippy::type_complexity)]
    fn run_trials<F>(
        &self,
        factory: &F,
        config: &Config,
        seeds: &[Seed],
        first: usize,
        stride: usize,
        earliest: &AtomicUsize,
    ) -> Result<Option<(usize, Sequential<Sys, State>, StepFailure)>>
    where
        F: SystemFactory<Sys>,
    {
        for test_num in (first..seeds.len()).step_by(stride) {
            if test_num > earliest.load(Ordering::SeqCst) {
                break;
            }
            let size = Size::for_trial(test_num, config.test_limit, config.size_limit);
            let sequential = self.plan(size, seeds[test_num], config)?;
            debug!(
                test = test_num,
                size = size.get(),
                actions = sequential.len(),
                "planned sequential trial"
            );

            if let Err(failure) = self.run(factory, &sequential) {
                earliest.fetch_min(test_num, Ordering::SeqCst);
                return Ok(Some((test_num, sequential, failure)));
            }
        }
        Ok(None)
    }

    #[allow(clippy::type_complexity)]
    fn run_trials_concurrently<F>(
        &self,
        factory: &F,
        config: &Config,
        seeds: &[Seed],
    ) -> Result<Option<(usize, Sequential<Sys, State>, StepFailure)>>
    where
        F: SystemFactory<Sys>,
    {
        let earliest = AtomicUsize::new(usize::MAX);
        let earliest = &earliest;
        let outcomes: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..config.workers)
                .map(|worker| {
                    scope.spawn(move || {
                        self.run_trials(factory, config, seeds, worker, config.workers, earliest)
                    })
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

        let mut found = None;
        for outcome in outcomes {
            if let Some(failure) = outcome? {
                let earlier = match &found {
                    Some((test_num, _, _)) => failure.0 < *test_num,
                    None => true,
                };
                if earlier {
                    found = Some(failure);
                }
            }
        }
        Ok(found)
    }
}
