//! Ordinal-indexed transition engine.
//!
//! Protocol negotiation and connection lifecycle both reduce to the same
//! shape: a closed set of states, a closed set of inputs, and a dense
//! table mapping `(state, input)` to an optional `(next state, action)`.
//! States and inputs implement [`Ordinal`] so the table is a flat array
//! lookup rather than a map.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

/// A closed variant set with dense non-negative discriminants.
///
/// `from_ordinal` must be the exact inverse of `ordinal` over
/// `0..CARDINALITY`; table builders verify this at construction time.
pub trait Ordinal: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const CARDINALITY: usize;

    fn ordinal(self) -> usize;

    fn from_ordinal(ordinal: usize) -> Option<Self>;
}

/// Side effect executed against the machine's target while the transition
/// lock is held.
pub type Action<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Rule<S, T> {
    next: Option<S>,
    action: Option<Action<T>>,
}

/// Dense `(state, input)` rule table. Built once, read-only thereafter.
pub struct TransitionTable<S: Ordinal, I: Ordinal, T> {
    rules: Vec<Option<Rule<S, T>>>,
    _input: PhantomData<I>,
}

impl<S: Ordinal, I: Ordinal, T> TransitionTable<S, I, T> {
    pub fn builder() -> TableBuilder<S, I, T> {
        TableBuilder::new()
    }

    fn rule(&self, state: S, input: I) -> Option<&Rule<S, T>> {
        self.rules[state.ordinal() * I::CARDINALITY + input.ordinal()].as_ref()
    }
}

pub struct TableBuilder<S: Ordinal, I: Ordinal, T> {
    rules: Vec<Option<Rule<S, T>>>,
    _input: PhantomData<I>,
}

impl<S: Ordinal, I: Ordinal, T> TableBuilder<S, I, T> {
    pub fn new() -> Self {
        verify_ordinals::<S>();
        verify_ordinals::<I>();
        Self {
            rules: (0..S::CARDINALITY * I::CARDINALITY).map(|_| None).collect(),
            _input: PhantomData,
        }
    }

    /// Adds a rule. Registering the same `(state, input)` pair twice is a
    /// caller bug and panics.
    pub fn rule(mut self, state: S, input: I, next: Option<S>, action: Option<Action<T>>) -> Self {
        let index = state.ordinal() * I::CARDINALITY + input.ordinal();
        assert!(
            self.rules[index].is_none(),
            "duplicate rule for {:?} x {:?}",
            state,
            input
        );
        self.rules[index] = Some(Rule { next, action });
        self
    }

    pub fn build(self) -> TransitionTable<S, I, T> {
        TransitionTable {
            rules: self.rules,
            _input: PhantomData,
        }
    }
}

impl<S: Ordinal, I: Ordinal, T> Default for TableBuilder<S, I, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn verify_ordinals<O: Ordinal>() {
    for ordinal in 0..O::CARDINALITY {
        match O::from_ordinal(ordinal) {
            Some(variant) => assert!(
                variant.ordinal() == ordinal,
                "ordinal {} does not round-trip",
                ordinal
            ),
            None => panic!("ordinal {} has no variant", ordinal),
        }
    }
    assert!(O::from_ordinal(O::CARDINALITY).is_none(), "cardinality too small");
}

/// Handle for deregistering a transition listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ListenerFn<S, I> = Arc<dyn Fn(S, I, S) + Send + Sync>;

struct ListenerEntry<S, I> {
    id: ListenerId,
    callback: ListenerFn<S, I>,
}

/// A transition table bound to a target object and a current state.
///
/// `input` serializes the whole `(lookup, state update, action)` sequence
/// under one lock, so actions never interleave. [`StateMachine::state`]
/// deliberately bypasses that lock: it reads an atomic cell and is only
/// atomic with respect to the state value itself, never with respect to a
/// concurrently executing action. Callers that need the stronger ordering
/// go through [`StateMachine::input_await`].
pub struct StateMachine<S: Ordinal, I: Ordinal, T> {
    table: TransitionTable<S, I, T>,
    target: T,
    current: Mutex<S>,
    state_cell: AtomicUsize,
    listeners: Mutex<Vec<ListenerEntry<S, I>>>,
    next_listener_id: AtomicU64,
}

impl<S: Ordinal, I: Ordinal, T: Send + Sync + 'static> StateMachine<S, I, T> {
    pub fn new(table: TransitionTable<S, I, T>, initial: S, target: T) -> Self {
        Self {
            table,
            target,
            current: Mutex::new(initial),
            state_cell: AtomicUsize::new(initial.ordinal()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Feeds one input through the table.
    ///
    /// If a rule matches, the state is updated and the rule's action runs
    /// against the target before the lock is released. Listeners are
    /// notified after release, whether or not a rule matched.
    pub fn input(&self, input: I) {
        let (before, after) = {
            let mut current = self.current.lock().unwrap();
            let before = *current;
            if let Some(rule) = self.table.rule(*current, input) {
                if let Some(next) = rule.next {
                    *current = next;
                    self.state_cell.store(next.ordinal(), Ordering::Release);
                }
                if let Some(action) = &rule.action {
                    action(&self.target);
                }
            }
            (before, *current)
        };

        if before != after {
            debug!(?before, ?input, ?after, "state transition");
        }

        let snapshot: Vec<ListenerFn<S, I>> = {
            let listeners = self.listeners.lock().unwrap();
            listeners.iter().map(|e| Arc::clone(&e.callback)).collect()
        };
        for listener in snapshot {
            listener(before, input, after);
        }
    }

    /// Lock-free read of the current state.
    ///
    /// May race with an in-flight transition: the returned value is
    /// whatever the atomic cell held at the instant of the load.
    pub fn state(&self) -> S {
        S::from_ordinal(self.state_cell.load(Ordering::Acquire))
            .expect("state cell holds a valid ordinal")
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(S, I, S) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push(ListenerEntry {
            id,
            callback: Arc::new(listener),
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|e| e.id != id);
    }

    /// Fires `input` on a spawned executor thread, then blocks the calling
    /// thread until the machine reaches one of `targets`.
    ///
    /// Implemented with a one-shot listener that signals completion and is
    /// then removed. Returns the target state that was observed.
    pub fn input_await(self: &Arc<Self>, input: I, targets: &[S]) -> S {
        let reached: Arc<(Mutex<Option<S>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let targets: Vec<S> = targets.to_vec();

        let signal = Arc::clone(&reached);
        let id = self.add_listener(move |_before, _input, after| {
            if targets.contains(&after) {
                let (slot, condvar) = &*signal;
                let mut slot = slot.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(after);
                    condvar.notify_all();
                }
            }
        });

        let machine = Arc::clone(self);
        let executor = std::thread::spawn(move || machine.input(input));

        let (slot, condvar) = &*reached;
        let mut slot = slot.lock().unwrap();
        while slot.is_none() {
            slot = condvar.wait(slot).unwrap();
        }
        let state = slot.unwrap();
        drop(slot);

        executor.join().expect("executor thread panicked");
        self.remove_listener(id);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Stopped,
        Running,
    }

    impl Ordinal for Phase {
        const CARDINALITY: usize = 2;

        fn ordinal(self) -> usize {
            match self {
                Phase::Stopped => 0,
                Phase::Running => 1,
            }
        }

        fn from_ordinal(ordinal: usize) -> Option<Self> {
            match ordinal {
                0 => Some(Phase::Stopped),
                1 => Some(Phase::Running),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Cmd {
        Run,
        Stop,
    }

    impl Ordinal for Cmd {
        const CARDINALITY: usize = 2;

        fn ordinal(self) -> usize {
            match self {
                Cmd::Run => 0,
                Cmd::Stop => 1,
            }
        }

        fn from_ordinal(ordinal: usize) -> Option<Self> {
            match ordinal {
                0 => Some(Cmd::Run),
                1 => Some(Cmd::Stop),
                _ => None,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    fn run_stop_machine() -> StateMachine<Phase, Cmd, Recorder> {
        let table = TransitionTable::builder()
            .rule(
                Phase::Stopped,
                Cmd::Run,
                Some(Phase::Running),
                Some(Arc::new(|r: &Recorder| {
                    r.starts.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .rule(
                Phase::Running,
                Cmd::Stop,
                Some(Phase::Stopped),
                Some(Arc::new(|r: &Recorder| {
                    r.stops.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .build();
        StateMachine::new(table, Phase::Stopped, Recorder::default())
    }

    #[test]
    fn run_run_stop_stop_executes_each_action_once() {
        let machine = run_stop_machine();

        machine.input(Cmd::Run);
        assert_eq!(machine.state(), Phase::Running);
        machine.input(Cmd::Run);
        assert_eq!(machine.state(), Phase::Running);
        machine.input(Cmd::Stop);
        assert_eq!(machine.state(), Phase::Stopped);
        machine.input(Cmd::Stop);
        assert_eq!(machine.state(), Phase::Stopped);

        assert_eq!(machine.target().starts.load(Ordering::SeqCst), 1);
        assert_eq!(machine.target().stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_fire_even_without_a_matching_rule() {
        let machine = run_stop_machine();
        let seen: Arc<Mutex<Vec<(Phase, Cmd, Phase)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        machine.add_listener(move |before, input, after| {
            sink.lock().unwrap().push((before, input, after));
        });

        // No rule for (Stopped, Stop): state must not move, listener still fires.
        machine.input(Cmd::Stop);

        let events = seen.lock().unwrap();
        assert_eq!(events.as_slice(), &[(Phase::Stopped, Cmd::Stop, Phase::Stopped)]);
    }

    #[test]
    fn removed_listener_is_silent() {
        let machine = run_stop_machine();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let id = machine.add_listener(move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        machine.input(Cmd::Run);
        machine.remove_listener(id);
        machine.input(Cmd::Stop);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn input_await_blocks_until_target_state() {
        let machine = Arc::new(run_stop_machine());
        let state = machine.input_await(Cmd::Run, &[Phase::Running]);
        assert_eq!(state, Phase::Running);
        assert_eq!(machine.state(), Phase::Running);
        // The one-shot listener was removed; further inputs are unaffected.
        machine.input(Cmd::Stop);
        assert_eq!(machine.state(), Phase::Stopped);
    }

    #[test]
    #[should_panic]
    fn duplicate_rule_panics() {
        let _ = TransitionTable::<Phase, Cmd, Recorder>::builder()
            .rule(Phase::Stopped, Cmd::Run, Some(Phase::Running), None)
            .rule(Phase::Stopped, Cmd::Run, None, None);
    }
}
