// A table of integer cells addressed by handles the system hands out.
// Later commands refer to handles through symbolic variables.
use statecheck::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Handle = u64;

#[derive(Default)]
struct TableInner {
    next: Handle,
    cells: HashMap<Handle, i64>,
}

struct Table {
    inner: Mutex<TableInner>,
    /// Values above this are silently clamped.
    ceiling: i64,
}

impl Table {
    fn correct() -> Self {
        Table {
            inner: Mutex::default(),
            ceiling: i64::MAX,
        }
    }

    fn clamping() -> Self {
        Table {
            inner: Mutex::default(),
            ceiling: 500,
        }
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut TableInner) -> std::result::Result<T, CommandError>,
    ) -> std::result::Result<T, CommandError> {
        let mut inner = self.inner.lock().map_err(|_| "table lock poisoned")?;
        f(&mut inner)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Model {
    cells: Vec<(Symbolic<Handle>, i64)>,
}

impl Model {
    fn value(&self, handle: &Symbolic<Handle>) -> Option<i64> {
        self.cells
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, value)| *value)
    }

    fn handles(&self) -> Vec<Symbolic<Handle>> {
        self.cells.iter().map(|(h, _)| *h).collect()
    }
}

struct Open;
struct Write;
struct Read;
struct Close;

impl Command<Table, Model> for Open {
    type Input = ();
    type Output = Handle;

    fn name(&self) -> &str {
        "open"
    }

    fn generate(&self, _state: &Model) -> Gen<()> {
        Gen::constant(())
    }

    fn execute(
        &self,
        system: &Table,
        _env: &Environment,
        _state: &Model,
        _input: &(),
    ) -> std::result::Result<Handle, CommandError> {
        system.with(|table| {
            let handle = table.next;
            table.next += 1;
            table.cells.insert(handle, 0);
            Ok(handle)
        })
    }

    fn update(&self, state: &Model, _input: &(), output: &Var<Handle>) -> Model {
        let mut next = state.clone();
        if let Var::Symbolic(handle) = output {
            next.cells.push((*handle, 0));
        }
        next
    }
}

impl Command<Table, Model> for Write {
    type Input = (Symbolic<Handle>, i64);
    type Output = ();

    fn name(&self) -> &str {
        "write"
    }

    fn weight(&self) -> u32 {
        2
    }

    fn precondition(&self, state: &Model) -> bool {
        !state.cells.is_empty()
    }

    fn require(&self, state: &Model, input: &Self::Input) -> bool {
        state.value(&input.0).is_some()
    }

    fn generate(&self, state: &Model) -> Gen<Self::Input> {
        Gen::element(state.handles())
            .bind(|handle| Gen::int_range(0, 1000).map(move |value| (handle, value)))
    }

    fn execute(
        &self,
        system: &Table,
        env: &Environment,
        _state: &Model,
        input: &Self::Input,
    ) -> std::result::Result<(), CommandError> {
        let handle = input.0.resolve(env)?;
        let value = input.1.min(system.ceiling);
        system.with(|table| match table.cells.get_mut(&handle) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(CommandError::failed(format!("no cell {handle}"))),
        })
    }

    fn update(&self, state: &Model, input: &Self::Input, _output: &Var<()>) -> Model {
        let mut next = state.clone();
        for (handle, value) in &mut next.cells {
            if *handle == input.0 {
                *value = input.1;
            }
        }
        next
    }
}

impl Command<Table, Model> for Read {
    type Input = Symbolic<Handle>;
    type Output = i64;

    fn name(&self) -> &str {
        "read"
    }

    fn precondition(&self, state: &Model) -> bool {
        !state.cells.is_empty()
    }

    fn require(&self, state: &Model, input: &Symbolic<Handle>) -> bool {
        state.value(input).is_some()
    }

    fn generate(&self, state: &Model) -> Gen<Symbolic<Handle>> {
        Gen::element(state.handles())
    }

    fn execute(
        &self,
        system: &Table,
        env: &Environment,
        _state: &Model,
        input: &Symbolic<Handle>,
    ) -> std::result::Result<i64, CommandError> {
        let handle = input.resolve(env)?;
        system.with(|table| {
            table
                .cells
                .get(&handle)
                .copied()
                .ok_or_else(|| CommandError::failed(format!("no cell {handle}")))
        })
    }

    fn update(&self, state: &Model, _input: &Symbolic<Handle>, _output: &Var<i64>) -> Model {
        state.clone()
    }

    fn ensure(
        &self,
        _env: &Environment,
        old: &Model,
        _new: &Model,
        input: &Symbolic<Handle>,
        output: &i64,
    ) -> std::result::Result<(), CommandError> {
        let expected = old
            .value(input)
            .ok_or_else(|| CommandError::failed(format!("{input} is not open in the model")))?;
        ensure_eq(&expected, output)
    }
}

impl Command<Table, Model> for Close {
    type Input = Symbolic<Handle>;
    type Output = ();

    fn name(&self) -> &str {
        "close"
    }

    fn precondition(&self, state: &Model) -> bool {
        !state.cells.is_empty()
    }

    fn require(&self, state: &Model, input: &Symbolic<Handle>) -> bool {
        state.value(input).is_some()
    }

    fn generate(&self, state: &Model) -> Gen<Symbolic<Handle>> {
        Gen::element(state.handles())
    }

    fn execute(
        &self,
        system: &Table,
        env: &Environment,
        _state: &Model,
        input: &Symbolic<Handle>,
    ) -> std::result::Result<(), CommandError> {
        let handle = input.resolve(env)?;
        system.with(|table| {
            table
                .cells
                .remove(&handle)
                .map(|_| ())
                .ok_or_else(|| CommandError::failed(format!("no cell {handle}")))
        })
    }

    fn update(&self, state: &Model, input: &Symbolic<Handle>, _output: &Var<()>) -> Model {
        let mut next = state.clone();
        next.cells.retain(|(handle, _)| handle != input);
        next
    }
}

fn sequential() -> SequentialSpec<Table, Model> {
    SequentialSpec::new(Model::default())
        .with_command(Open)
        .with_command(Write)
        .with_command(Read)
        .with_command(Close)
        .with_range(1, 40)
}

#[test]
fn correct_table_passes() {
    let config = Config::default().with_seed(Seed::from_u64(17));
    let result = sequential().check(&Table::correct, &config).unwrap();
    assert!(result.is_pass(), "{result}");
}

#[test]
fn clamped_write_shrinks_to_open_write_read() {
    let config = Config::default().with_seed(Seed::from_u64(23));
    let result = sequential().check(&Table::clamping, &config).unwrap();

    let Some(Counterexample::Sequential { actions, failure }) = result.counterexample() else {
        panic!("expected a sequential counterexample, got {result}");
    };
    assert_eq!(actions.len(), 3, "{result}");
    assert!(actions[0].contains("open"));
    assert!(actions[1].contains("write"));
    assert!(actions[2].contains("read"));
    assert_eq!(failure.command, "read");
    assert!(matches!(failure.kind, FailureKind::Postcondition(_)));
}

#[test]
fn reshrinking_the_minimal_counterexample_changes_nothing() {
    let spec = sequential();
    let config = Config::default().with_seed(Seed::from_u64(31));

    let mut seed = Seed::from_u64(5);
    let (plan, failure) = (0..1000)
        .find_map(|_| {
            let (trial, next) = seed.split();
            seed = next;
            let plan = spec.plan(Size(100), trial, &config).unwrap();
            spec.run(&Table::clamping, &plan).err().map(|failure| (plan, failure))
        })
        .expect("no failing plan in 1000 attempts");

    let first = spec.shrink(&Table::clamping, plan, failure, &config);
    let again = spec.shrink(&Table::clamping, first.value.clone(), first.failure.clone(), &config);
    assert_eq!(again.shrinks, 0);
    assert_eq!(again.value.display_actions(), first.value.display_actions());
    assert_eq!(again.failure, first.failure);
}

#[test]
fn unbound_handle_is_a_model_error() {
    let read = Arc::new(Read);
    let plan: Sequential<Table, Model> = Sequential::new(vec![Action::shared(
        &read,
        Symbolic::new(SymbolicId(7)),
        SymbolicId(0),
    )]);

    let failure = execute_sequential(&Table::correct(), &Model::default(), &plan).unwrap_err();
    assert_eq!(failure.kind, FailureKind::Model(VarError::Unresolved(SymbolicId(7))));
    assert!(failure.to_string().contains("Var7 is not bound yet"));
}

#[test]
fn table_without_close_is_linearizable() {
    let spec = ParallelSpec::new(Model::default())
        .with_command(Open)
        .with_command(Write)
        .with_command(Read)
        .with_prefix_range(1, 3)
        .with_branch_range(1, 4);
    let config = Config::default().with_tests(40);

    let result = spec.check(&Table::correct, &config).unwrap();
    assert!(result.is_pass(), "{result}");
}
