// A counter whose increment is a split read-modify-write. It is correct
// when used from one thread and loses updates under contention.
use statecheck::*;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

#[derive(Default)]
struct RacyCounter {
    value: AtomicI64,
}

impl RacyCounter {
    fn increment(&self) -> i64 {
        let read = self.value.load(Ordering::SeqCst);
        thread::yield_now();
        self.value.store(read + 1, Ordering::SeqCst);
        read + 1
    }
}

struct Increment;
struct Get;

impl Command<RacyCounter, i64> for Increment {
    type Input = ();
    type Output = i64;

    fn name(&self) -> &str {
        "increment"
    }

    fn weight(&self) -> u32 {
        3
    }

    fn generate(&self, _state: &i64) -> Gen<()> {
        Gen::constant(())
    }

    fn execute(
        &self,
        system: &RacyCounter,
        _env: &Environment,
        _state: &i64,
        _input: &(),
    ) -> std::result::Result<i64, CommandError> {
        Ok(system.increment())
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
    ) -> std::result::Result<(), CommandError> {
        ensure_eq(new, output)
    }
}

impl Command<RacyCounter, i64> for Get {
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
        system: &RacyCounter,
        _env: &Environment,
        _state: &i64,
        _input: &(),
    ) -> std::result::Result<i64, CommandError> {
        Ok(system.value.load(Ordering::SeqCst))
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
    ) -> std::result::Result<(), CommandError> {
        ensure_eq(old, output)
    }
}

#[test]
fn racy_counter_passes_sequentially() {
    let spec = SequentialSpec::new(0)
        .with_command(Increment)
        .with_command(Get)
        .with_range(1, 30);
    let result = spec.check(&RacyCounter::default, &Config::default()).unwrap();
    assert!(result.is_pass(), "{result}");
}

#[test]
fn racy_counter_is_not_linearizable() {
    let spec = ParallelSpec::new(0)
        .with_command(Increment)
        .with_command(Get)
        .with_prefix_range(0, 2)
        .with_branch_range(3, 6);
    let config = Config::default().with_tests(500).with_shrink_repeats(8);

    let result = spec.check(&RacyCounter::default, &config).unwrap();
    let Some(counterexample) = result.counterexample() else {
        panic!("no lost update observed in {result}");
    };

    assert!(counterexample.is_linearizability_failure(), "{result}");
    let Counterexample::Parallel {
        branches, failure, ..
    } = counterexample
    else {
        panic!("expected a parallel counterexample, got {counterexample}");
    };
    assert_eq!(branches.len(), 2);
    if let ParallelFailure::NotLinearizable { traces, .. } = failure {
        assert_eq!(traces.len(), 2);
    }
    assert!(result.to_string().contains("no interleaving is linearizable"));
}
