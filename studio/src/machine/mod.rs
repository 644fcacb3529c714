//! Hierarchical state machine runtime
//!
//! Machines are declared once as a [`MachineDefinition`] (enum state ids with
//! parent links, compound / parallel / atomic nodes, guarded transitions,
//! entry/exit actions and invoked services) and executed by an
//! [`Interpreter`] owned by a ractor actor. The actor's mailbox supplies the
//! run-to-completion guarantee; the interpreter supplies the statechart
//! semantics:
//!
//! - a transition declared on an ancestor applies to every active descendant
//!   unless a deeper state handles the same event first
//! - the first transition whose guard passes wins; unhandled events are dropped
//! - services live exactly as long as the state that invoked them
//! - actions never touch the outside world directly, they `emit` commands that
//!   the host actor executes after the macrostep

mod definition;
mod host;
mod interpreter;
mod service;

pub use definition::{
    ActionScope, DefinitionError, MachineDefinition, MachineDefinitionBuilder, StateNode,
    Transition,
};
pub use host::{actor_sink, notifier, Notifier};
pub use interpreter::{Interpreter, MachineStatus};
pub use service::{Delivery, DeliverySink, Invocation, InvocationId};

use std::fmt::Debug;
use std::hash::Hash;

/// Event consumed by a machine. `Kind` is the payload-free discriminant
/// transitions are keyed on (derived with `strum::EnumDiscriminants`).
pub trait MachineEvent: Clone + Debug + Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Type-level binding of one machine's state ids, events, context and
/// host commands.
///
/// The provided constructors pin node and transition builders to this
/// machine, so closures passed to them see concrete context and event types.
pub trait Machine: Sized + Send + Sync + 'static {
    type State: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type Event: MachineEvent;
    type Context: Send + 'static;
    type Command: Debug + Send + 'static;

    fn atomic(id: Self::State) -> StateNode<Self> {
        StateNode::atomic(id)
    }

    fn compound(id: Self::State, initial: Self::State) -> StateNode<Self> {
        StateNode::compound(id, initial)
    }

    fn parallel(id: Self::State) -> StateNode<Self> {
        StateNode::parallel(id)
    }

    fn to(target: Self::State) -> Transition<Self> {
        Transition::to(target)
    }

    fn internal() -> Transition<Self> {
        Transition::internal()
    }
}
