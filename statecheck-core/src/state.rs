//! State machine testing primitives.
//!
//! A model is described by a set of [`Command`]s. Planning threads an abstract
//! model state through the commands, handing each step a fresh [`Symbolic`]
//! variable for its not-yet-known output. Execution later binds those
//! variables in an [`Environment`] as the real system answers.

use crate::error::{CommandError, FailureKind, Result, StateError, VarError};
use crate::{data::*, gen::Gen, tree::Tree};
use std::any::{type_name, Any};
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A unique identifier for symbolic variables, allocated in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolicId(pub u64);

impl Display for SymbolicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var{}", self.0)
    }
}

/// Symbolic variables stand for the output of an action that has not run yet.
/// They let the model, and later actions, refer to that output before it exists.
pub struct Symbolic<T> {
    id: SymbolicId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Symbolic<T> {
    pub fn new(id: SymbolicId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> SymbolicId {
        self.id
    }
}

impl<T: Clone + 'static> Symbolic<T> {
    /// Look the variable up in `env`.
    pub fn resolve(&self, env: &Environment) -> std::result::Result<T, VarError> {
        env.get(self).cloned()
    }
}

impl<T> Clone for Symbolic<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Symbolic<T> {}

impl<T> PartialEq for Symbolic<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Symbolic<T> {}

impl<T> Hash for Symbolic<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> Debug for Symbolic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<T> Display for Symbolic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A value the model knows either concretely or only symbolically.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Var<T> {
    Symbolic(Symbolic<T>),
    Concrete(T),
}

impl<T> Var<T> {
    pub fn symbolic(id: SymbolicId) -> Self {
        Self::Symbolic(Symbolic::new(id))
    }

    pub fn concrete(value: T) -> Self {
        Self::Concrete(value)
    }
}

impl<T: Clone + 'static> Var<T> {
    /// The concrete value, looking symbolic variables up in `env`.
    pub fn resolve(&self, env: &Environment) -> std::result::Result<T, VarError> {
        env.reify(self)
    }
}

impl<T> From<Symbolic<T>> for Var<T> {
    fn from(symbolic: Symbolic<T>) -> Self {
        Var::Symbolic(symbolic)
    }
}

impl<T: Debug> Debug for Var<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Symbolic(sym) => write!(f, "{sym}"),
            Var::Concrete(value) => write!(f, "{value:?}"),
        }
    }
}

type Slot = Option<Arc<dyn Any + Send + Sync>>;

/// Concrete values of symbolic variables, one slot per variable id.
///
/// Slots start out pending and are bound exactly once, by the step that
/// produced them. Looking up a pending slot is an error.
#[derive(Clone, Default)]
pub struct Environment {
    slots: Vec<Slot>,
}

impl Environment {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Bind a type-erased value to `id`.
    pub fn bind(
        &mut self,
        id: SymbolicId,
        value: Arc<dyn Any + Send + Sync>,
    ) -> std::result::Result<(), VarError> {
        let index = id.0 as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        match &self.slots[index] {
            Some(_) => Err(VarError::AlreadyBound(id)),
            None => {
                self.slots[index] = Some(value);
                Ok(())
            }
        }
    }

    pub fn insert<T: Send + Sync + 'static>(
        &mut self,
        symbolic: Symbolic<T>,
        value: T,
    ) -> std::result::Result<(), VarError> {
        self.bind(symbolic.id(), Arc::new(value))
    }

    pub fn get<T: 'static>(&self, symbolic: &Symbolic<T>) -> std::result::Result<&T, VarError> {
        let id = symbolic.id();
        let slot = self
            .slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(VarError::Unresolved(id))?;
        slot.downcast_ref().ok_or(VarError::TypeMismatch {
            id,
            expected: type_name::<T>(),
        })
    }

    pub fn reify<T: Clone + 'static>(&self, var: &Var<T>) -> std::result::Result<T, VarError> {
        match var {
            Var::Symbolic(sym) => self.get(sym).cloned(),
            Var::Concrete(value) => Ok(value.clone()),
        }
    }

    pub fn is_bound(&self, id: SymbolicId) -> bool {
        matches!(self.slots.get(id.0 as usize), Some(Some(_)))
    }

    /// Number of bound variables.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| SymbolicId(i as u64))
            .collect();
        f.debug_struct("Environment").field("bound", &bound).finish()
    }
}

/// The observed output of an executed action.
#[derive(Clone)]
pub struct Observed {
    value: Arc<dyn Any + Send + Sync>,
    rendered: String,
}

impl Observed {
    pub fn new<T: Debug + Send + Sync + 'static>(value: T) -> Self {
        let rendered = format!("{value:?}");
        Self {
            value: Arc::new(value),
            rendered,
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub(crate) fn value(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.value)
    }
}

impl Debug for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl Display for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// One kind of operation on the system under test, together with its model.
///
/// Commands are stateless and shared between runs and between the threads
/// of a parallel test.
pub trait Command<Sys, State>: Send + Sync + 'static {
    type Input: Clone + Debug + Send + Sync + 'static;
    type Output: Clone + Debug + Send + Sync + 'static;

    /// Stable name used in reports.
    fn name(&self) -> &str;

    /// Relative likelihood of being picked among applicable commands.
    fn weight(&self) -> u32 {
        1
    }

    /// Whether the command may be planned in `state`.
    fn precondition(&self, _state: &State) -> bool {
        true
    }

    /// Whether a specific generated input is acceptable in `state`.
    /// Also re-checked when shrinking removes earlier actions.
    fn require(&self, _state: &State, _input: &Self::Input) -> bool {
        true
    }

    /// Inputs for this command. Only called when `precondition` holds.
    fn generate(&self, state: &State) -> Gen<Self::Input>;

    /// Run the command against the real system. Symbolic variables inside
    /// `input` are resolved through `env`.
    fn execute(
        &self,
        system: &Sys,
        env: &Environment,
        state: &State,
        input: &Self::Input,
    ) -> std::result::Result<Self::Output, CommandError>;

    /// Model transition. `output` stands for the value `execute` will return.
    fn update(&self, state: &State, input: &Self::Input, output: &Var<Self::Output>) -> State;

    /// Postcondition over the observed output. `env` already holds `output`.
    fn ensure(
        &self,
        _env: &Environment,
        _old_state: &State,
        _new_state: &State,
        _input: &Self::Input,
        _output: &Self::Output,
    ) -> std::result::Result<(), CommandError> {
        Ok(())
    }
}

/// Type-erased planned action.
pub trait ActionTrait<Sys, State>: Send + Sync {
    fn name(&self) -> &str;

    /// Variable this action's output is bound to.
    fn output_id(&self) -> SymbolicId;

    /// `VarN = name(input)`.
    fn display_action(&self) -> String;

    /// Precondition and input requirement in `state`.
    fn is_enabled(&self, state: &State) -> bool;

    fn next_state(&self, state: &State) -> State;

    fn execute_action(
        &self,
        system: &Sys,
        env: &Environment,
        state: &State,
    ) -> std::result::Result<Observed, CommandError>;

    fn check(
        &self,
        env: &Environment,
        old_state: &State,
        new_state: &State,
        output: &Observed,
    ) -> std::result::Result<(), CommandError>;

    /// This action with its input replaced by each of the input's shrinks.
    fn shrink_inputs(&self) -> Vec<Arc<dyn ActionTrait<Sys, State>>>;
}

/// Shared handle to a planned action.
pub type ActionRef<Sys, State> = Arc<dyn ActionTrait<Sys, State>>;

/// A command instantiated with a generated input.
pub struct Action<C, Sys, State>
where
    C: Command<Sys, State>,
{
    command: Arc<C>,
    input: Tree<C::Input>,
    output: Symbolic<C::Output>,
    _phantom: PhantomData<fn(&Sys, &State)>,
}

impl<C, Sys, State> Action<C, Sys, State>
where
    C: Command<Sys, State>,
    Sys: 'static,
    State: 'static,
{
    pub fn new(command: Arc<C>, input: Tree<C::Input>, output: Symbolic<C::Output>) -> Self {
        Self {
            command,
            input,
            output,
            _phantom: PhantomData,
        }
    }

    /// Build a shareable action with a fixed input, as used when assembling
    /// sequences by hand.
    pub fn shared(command: &Arc<C>, input: C::Input, output: SymbolicId) -> ActionRef<Sys, State> {
        Arc::new(Self::new(
            Arc::clone(command),
            Tree::singleton(input),
            Symbolic::new(output),
        ))
    }

    pub fn input(&self) -> &C::Input {
        &self.input.value
    }
}

impl<C, Sys, State> ActionTrait<Sys, State> for Action<C, Sys, State>
where
    C: Command<Sys, State>,
    Sys: 'static,
    State: 'static,
{
    fn name(&self) -> &str {
        self.command.name()
    }

    fn output_id(&self) -> SymbolicId {
        self.output.id()
    }

    fn display_action(&self) -> String {
        format!("{} = {}({:?})", self.output, self.command.name(), self.input.value)
    }

    fn is_enabled(&self, state: &State) -> bool {
        self.command.precondition(state) && self.command.require(state, &self.input.value)
    }

    fn next_state(&self, state: &State) -> State {
        self.command
            .update(state, &self.input.value, &Var::Symbolic(self.output))
    }

    fn execute_action(
        &self,
        system: &Sys,
        env: &Environment,
        state: &State,
    ) -> std::result::Result<Observed, CommandError> {
        self.command
            .execute(system, env, state, &self.input.value)
            .map(Observed::new)
    }

    fn check(
        &self,
        env: &Environment,
        old_state: &State,
        new_state: &State,
        output: &Observed,
    ) -> std::result::Result<(), CommandError> {
        let output = output
            .downcast_ref::<C::Output>()
            .ok_or(VarError::TypeMismatch {
                id: self.output.id(),
                expected: type_name::<C::Output>(),
            })?;
        self.command
            .ensure(env, old_state, new_state, &self.input.value, output)
    }

    fn shrink_inputs(&self) -> Vec<ActionRef<Sys, State>> {
        self.input
            .children
            .iter()
            .map(|child| {
                Arc::new(Action::new(Arc::clone(&self.command), child.clone(), self.output))
                    as ActionRef<Sys, State>
            })
            .collect()
    }
}

/// Run one action, turning errors and panics into a [`FailureKind`].
pub(crate) fn execute_step<Sys, State>(
    action: &dyn ActionTrait<Sys, State>,
    system: &Sys,
    env: &Environment,
    state: &State,
) -> std::result::Result<Observed, FailureKind> {
    match panic::catch_unwind(AssertUnwindSafe(|| action.execute_action(system, env, state))) {
        Ok(Ok(observed)) => Ok(observed),
        Ok(Err(error)) => Err(FailureKind::from_execute(error)),
        Err(payload) => Err(FailureKind::Runtime(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Planning state: the model so far, the next variable id and the seed.
pub struct GenerationContext<S> {
    state: S,
    next_var_id: u64,
    seed: Seed,
    planned: usize,
}

impl<S> GenerationContext<S> {
    pub fn new(initial_state: S, seed: Seed) -> Self {
        Self {
            state: initial_state,
            next_var_id: 0,
            seed,
            planned: 0,
        }
    }

    /// Get the next seed and advance the internal seed state.
    pub fn next_seed(&mut self) -> Seed {
        let (current_seed, next_seed) = self.seed.split();
        self.seed = next_seed;
        current_seed
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn new_var<T>(&mut self) -> Symbolic<T> {
        let id = SymbolicId(self.next_var_id);
        self.next_var_id += 1;
        Symbolic::new(id)
    }

    /// A context planning from the same model state with its own seed.
    /// Variable ids keep counting up so they stay unique across forks.
    pub fn fork(&mut self) -> Self
    where
        S: Clone,
    {
        Self {
            state: self.state.clone(),
            next_var_id: self.next_var_id,
            seed: self.next_seed(),
            planned: self.planned,
        }
    }

    /// Continue allocating variable ids after those used by `fork`.
    pub fn absorb_ids(&mut self, fork: &Self) {
        self.next_var_id = self.next_var_id.max(fork.next_var_id);
    }
}

/// Type-erased command.
pub(crate) trait CommandTrait<Sys, State>: Send + Sync {
    fn weight(&self) -> u32;
    fn can_execute_dyn(&self, state: &State) -> bool;
    /// `Ok(None)` when `require` vetoes the drawn input.
    fn generate_action_dyn(
        &self,
        ctx: &mut GenerationContext<State>,
        size: Size,
    ) -> Result<Option<ActionRef<Sys, State>>>;
}

/// Typed wrapper for commands to enable type erasure.
pub(crate) struct TypedCommand<C> {
    command: Arc<C>,
}

impl<C> TypedCommand<C> {
    pub(crate) fn new(command: C) -> Self {
        Self {
            command: Arc::new(command),
        }
    }
}

impl<C, Sys, State> CommandTrait<Sys, State> for TypedCommand<C>
where
    C: Command<Sys, State>,
    Sys: 'static,
    State: 'static,
{
    fn weight(&self) -> u32 {
        self.command.weight()
    }

    fn can_execute_dyn(&self, state: &State) -> bool {
        self.command.precondition(state)
    }

    fn generate_action_dyn(
        &self,
        ctx: &mut GenerationContext<State>,
        size: Size,
    ) -> Result<Option<ActionRef<Sys, State>>> {
        let seed = ctx.next_seed();
        let state = ctx.state();
        let input = panic::catch_unwind(AssertUnwindSafe(|| {
            self.command.generate(state).generate(size, seed)
        }))
        .map_err(|payload| StateError::GeneratorFailed {
            reason: format!(
                "`{}` {}",
                self.command.name(),
                panic_message(payload.as_ref())
            ),
        })?;
        if !self.command.require(ctx.state(), &input.value) {
            return Ok(None);
        }
        let output = ctx.new_var::<C::Output>();
        Ok(Some(Arc::new(Action::new(
            Arc::clone(&self.command),
            input,
            output,
        ))))
    }
}

/// The palette of commands a specification draws from.
pub struct Commands<Sys, State> {
    commands: Vec<Arc<dyn CommandTrait<Sys, State>>>,
}

impl<Sys, State> Default for Commands<Sys, State> {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
        }
    }
}

impl<Sys: 'static, State: 'static> Commands<Sys, State> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<C>(&mut self, command: C)
    where
        C: Command<Sys, State>,
    {
        self.commands.push(Arc::new(TypedCommand::new(command)));
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl<Sys, State> Commands<Sys, State>
where
    State: Clone + Debug,
{
    /// Plan `length` actions, advancing `ctx` through the model.
    ///
    /// Commands are picked among those whose precondition holds, weighted by
    /// [`Command::weight`]. A step whose input is vetoed by `require` is
    /// re-drawn up to `discard_limit` times.
    pub(crate) fn plan(
        &self,
        ctx: &mut GenerationContext<State>,
        length: usize,
        size: Size,
        discard_limit: usize,
    ) -> Result<Vec<ActionRef<Sys, State>>> {
        let mut actions = Vec::with_capacity(length);

        for _ in 0..length {
            let mut discards = 0;
            let action = loop {
                let applicable: Vec<_> = self
                    .commands
                    .iter()
                    .filter(|cmd| cmd.weight() > 0 && cmd.can_execute_dyn(ctx.state()))
                    .collect();
                if applicable.is_empty() || discards > discard_limit {
                    return Err(StateError::PreconditionExhausted {
                        step: ctx.planned,
                        state: format!("{:?}", ctx.state()),
                    });
                }

                let total: u64 = applicable.iter().map(|cmd| u64::from(cmd.weight())).sum();
                let (mut pick, _) = ctx.next_seed().next_bounded(total);
                let mut selected = applicable[0];
                for &cmd in &applicable {
                    let weight = u64::from(cmd.weight());
                    if pick < weight {
                        selected = cmd;
                        break;
                    }
                    pick -= weight;
                }

                match selected.generate_action_dyn(ctx, size)? {
                    Some(action) => break action,
                    None => discards += 1,
                }
            };

            ctx.state = action.next_state(&ctx.state);
            ctx.planned += 1;
            actions.push(action);
        }

        Ok(actions)
    }
}

/// Replay `actions` through the model from `state`, checking every action
/// is still enabled. Returns the final model state.
pub(crate) fn replay_model<Sys, State: Clone>(
    state: &State,
    actions: &[ActionRef<Sys, State>],
) -> Option<State> {
    let mut state = state.clone();
    for action in actions {
        if !action.is_enabled(&state) {
            return None;
        }
        state = action.next_state(&state);
    }
    Some(state)
}

/// Creates and disposes of systems under test.
///
/// A fresh system is created for every run, including every shrink
/// re-execution.
pub trait SystemFactory<Sys>: Send + Sync {
    fn create(&self) -> Sys;

    /// Release a system once its run has finished, pass or fail.
    fn teardown(&self, system: Sys) {
        drop(system);
    }
}

impl<Sys, F> SystemFactory<Sys> for F
where
    F: Fn() -> Sys + Send + Sync,
{
    fn create(&self) -> Sys {
        self()
    }
}

/// A factory with an explicit teardown callback.
pub struct WithTeardown<F, T> {
    create: F,
    teardown: T,
}

/// Pair a constructor with an explicit teardown.
pub fn with_teardown<Sys, F, T>(create: F, teardown: T) -> WithTeardown<F, T>
where
    F: Fn() -> Sys + Send + Sync,
    T: Fn(Sys) + Send + Sync,
{
    WithTeardown { create, teardown }
}

impl<Sys, F, T> SystemFactory<Sys> for WithTeardown<F, T>
where
    F: Fn() -> Sys + Send + Sync,
    T: Fn(Sys) + Send + Sync,
{
    fn create(&self) -> Sys {
        (self.create)()
    }

    fn teardown(&self, system: Sys) {
        (self.teardown)(system)
    }
}

/// Create a system, hand it to `run` and tear it down afterwards. Teardown
/// also happens when `run` panics; the panic is then resumed.
pub(crate) fn with_system<Sys, F, R>(factory: &F, run: impl FnOnce(&Sys) -> R) -> R
where
    F: SystemFactory<Sys> + ?Sized,
{
    let system = factory.create();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(&system)));
    factory.teardown(system);
    match outcome {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}
