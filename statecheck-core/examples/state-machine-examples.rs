//! State machine testing of a bounded queue.
//!
//! Run with `cargo run --example state-machine-examples`. The sequential run
//! finds an off-by-one in the capacity check; the parallel run checks the
//! fixed queue for linearizability.

use statecheck_core::*;
use std::collections::VecDeque;
use std::result::Result;
use std::sync::Mutex;

struct Queue {
    items: Mutex<VecDeque<i64>>,
    capacity: usize,
    /// Accepts one item beyond capacity when set.
    overfill: bool,
}

impl Queue {
    fn new(capacity: usize, overfill: bool) -> Self {
        Queue {
            items: Mutex::new(VecDeque::new()),
            capacity,
            overfill,
        }
    }

    fn push(&self, value: i64) -> Result<bool, CommandError> {
        let mut items = self.items.lock().map_err(|_| "queue lock poisoned")?;
        let limit = if self.overfill {
            self.capacity + 1
        } else {
            self.capacity
        };
        if items.len() >= limit {
            return Ok(false);
        }
        items.push_back(value);
        Ok(true)
    }

    fn pop(&self) -> Result<Option<i64>, CommandError> {
        let mut items = self.items.lock().map_err(|_| "queue lock poisoned")?;
        Ok(items.pop_front())
    }
}

const CAPACITY: usize = 3;

#[derive(Debug, Clone, Default)]
struct Model {
    items: VecDeque<i64>,
}

struct Push;
struct Pop;

impl Command<Queue, Model> for Push {
    type Input = i64;
    type Output = bool;

    fn name(&self) -> &str {
        "push"
    }

    fn generate(&self, _state: &Model) -> Gen<i64> {
        Gen::int_range(-100, 100)
    }

    fn execute(
        &self,
        system: &Queue,
        _env: &Environment,
        _state: &Model,
        input: &i64,
    ) -> Result<bool, CommandError> {
        system.push(*input)
    }

    fn update(&self, state: &Model, input: &i64, _output: &Var<bool>) -> Model {
        let mut next = state.clone();
        if next.items.len() < CAPACITY {
            next.items.push_back(*input);
        }
        next
    }

    fn ensure(
        &self,
        _env: &Environment,
        old: &Model,
        _new: &Model,
        _input: &i64,
        output: &bool,
    ) -> Result<(), CommandError> {
        ensure_eq(&(old.items.len() < CAPACITY), output)
    }
}

impl Command<Queue, Model> for Pop {
    type Input = ();
    type Output = Option<i64>;

    fn name(&self) -> &str {
        "pop"
    }

    fn generate(&self, _state: &Model) -> Gen<()> {
        Gen::constant(())
    }

    fn execute(
        &self,
        system: &Queue,
        _env: &Environment,
        _state: &Model,
        _input: &(),
    ) -> Result<Option<i64>, CommandError> {
        system.pop()
    }

    fn update(&self, state: &Model, _input: &(), _output: &Var<Option<i64>>) -> Model {
        let mut next = state.clone();
        next.items.pop_front();
        next
    }

    fn ensure(
        &self,
        _env: &Environment,
        old: &Model,
        _new: &Model,
        _input: &(),
        output: &Option<i64>,
    ) -> Result<(), CommandError> {
        ensure_eq(&old.items.front().copied(), output)
    }
}

fn main() -> Result<(), StateError> {
    let config = Config::default().with_seed(Seed::from_u64(2024));

    println!("Bounded queue with an off-by-one capacity check:");
    let sequential = SequentialSpec::new(Model::default())
        .with_command(Push)
        .with_command(Pop)
        .with_range(1, 20);
    let result = sequential.check(&|| Queue::new(CAPACITY, true), &config)?;
    println!("{result}\n");

    println!("Fixed queue under concurrent pushes and pops:");
    let parallel = ParallelSpec::new(Model::default())
        .with_command(Push)
        .with_command(Pop)
        .with_prefix_range(0, 4)
        .with_branch_range(1, 5);
    let result = parallel.check(&|| Queue::new(CAPACITY, false), &config.with_tests(50))?;
    println!("{result}");

    Ok(())
}
