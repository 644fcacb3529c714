use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::service::Invocation;
use super::{Machine, MachineEvent};

pub(crate) type Guard<M> =
    Arc<dyn Fn(&<M as Machine>::Context, &<M as Machine>::Event) -> bool + Send + Sync>;
pub(crate) type Action<M> = Arc<dyn Fn(&mut ActionScope<'_, M>) + Send + Sync>;

type EventKind<M> = <<M as Machine>::Event as MachineEvent>::Kind;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("machine {machine}: no initial state")]
    MissingInitial { machine: &'static str },

    #[error("machine {machine}: state {state} declared twice")]
    DuplicateState { machine: &'static str, state: String },

    #[error("machine {machine}: parent {parent} of {state} is not declared before it")]
    UnknownParent {
        machine: &'static str,
        state: String,
        parent: String,
    },

    #[error("machine {machine}: initial {initial} of {state} is not a child of it")]
    BadInitial {
        machine: &'static str,
        state: String,
        initial: String,
    },

    #[error("machine {machine}: {state} has no children")]
    EmptyComposite { machine: &'static str, state: String },

    #[error("machine {machine}: transition from {state} targets unknown state {target}")]
    UnknownTarget {
        machine: &'static str,
        state: String,
        target: String,
    },
}

/// What an action may see and do while a transition runs.
pub struct ActionScope<'a, M: Machine> {
    pub ctx: &'a mut M::Context,
    /// The event being processed; `None` while entering the initial states.
    pub event: Option<&'a M::Event>,
    pub(crate) raised: &'a mut VecDeque<M::Event>,
    pub(crate) commands: &'a mut Vec<M::Command>,
}

impl<'a, M: Machine> ActionScope<'a, M> {
    /// Queue an internal event, processed before the current macrostep ends.
    pub fn raise(&mut self, event: M::Event) {
        self.raised.push_back(event);
    }

    /// Hand a side effect to the host actor.
    pub fn emit(&mut self, command: M::Command) {
        self.commands.push(command);
    }
}

pub struct Transition<M: Machine> {
    pub(crate) target: Option<M::State>,
    pub(crate) guard: Option<Guard<M>>,
    pub(crate) actions: Vec<Action<M>>,
    pub(crate) reenter: bool,
}

impl<M: Machine> Transition<M> {
    pub fn to(target: M::State) -> Self {
        Self {
            target: Some(target),
            guard: None,
            actions: Vec::new(),
            reenter: false,
        }
    }

    /// Targetless transition: runs its actions, leaves the configuration alone.
    pub fn internal() -> Self {
        Self {
            target: None,
            guard: None,
            actions: Vec::new(),
            reenter: false,
        }
    }

    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&M::Context, &M::Event) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ActionScope<'_, M>) + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(action));
        self
    }

    /// Exit and re-enter the source even when the target is the source itself
    /// or one of its descendants.
    pub fn reenter(mut self) -> Self {
        self.reenter = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind<S> {
    Atomic,
    Compound { initial: S },
    Parallel,
}

pub struct StateNode<M: Machine> {
    pub(crate) id: M::State,
    pub(crate) parent: Option<M::State>,
    pub(crate) kind: NodeKind<M::State>,
    pub(crate) entry: Vec<Action<M>>,
    pub(crate) exit: Vec<Action<M>>,
    pub(crate) transitions: Vec<(EventKind<M>, Transition<M>)>,
    pub(crate) invocations: Vec<Invocation<M>>,
}

impl<M: Machine> StateNode<M> {
    fn new(id: M::State, kind: NodeKind<M::State>) -> Self {
        Self {
            id,
            parent: None,
            kind,
            entry: Vec::new(),
            exit: Vec::new(),
            transitions: Vec::new(),
            invocations: Vec::new(),
        }
    }

    pub fn atomic(id: M::State) -> Self {
        Self::new(id, NodeKind::Atomic)
    }

    pub fn compound(id: M::State, initial: M::State) -> Self {
        Self::new(id, NodeKind::Compound { initial })
    }

    /// Every child is an independent region, all active at once.
    pub fn parallel(id: M::State) -> Self {
        Self::new(id, NodeKind::Parallel)
    }

    pub fn child_of(mut self, parent: M::State) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn on(mut self, event: EventKind<M>, transition: Transition<M>) -> Self {
        self.transitions.push((event, transition));
        self
    }

    pub fn on_entry<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ActionScope<'_, M>) + Send + Sync + 'static,
    {
        self.entry.push(Arc::new(action));
        self
    }

    pub fn on_exit<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ActionScope<'_, M>) + Send + Sync + 'static,
    {
        self.exit.push(Arc::new(action));
        self
    }

    pub fn invoke(mut self, invocation: Invocation<M>) -> Self {
        self.invocations.push(invocation);
        self
    }
}

/// Compiled node: indices instead of ids, children resolved.
pub(crate) struct CompiledNode<M: Machine> {
    pub(crate) node: StateNode<M>,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) initial: Option<usize>,
    pub(crate) targets: Vec<Option<usize>>,
}

/// Immutable machine description shared by every interpreter of that machine.
///
/// Nodes are stored in document order (parents before children), which is
/// also the order entry actions run in; exits run in reverse.
pub struct MachineDefinition<M: Machine> {
    pub(crate) name: &'static str,
    pub(crate) nodes: Vec<CompiledNode<M>>,
    pub(crate) index: HashMap<M::State, usize>,
    pub(crate) initial: usize,
}

impl<M: Machine> MachineDefinition<M> {
    pub fn builder(name: &'static str) -> MachineDefinitionBuilder<M> {
        MachineDefinitionBuilder {
            name,
            initial: None,
            states: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn contains(&self, state: M::State) -> bool {
        self.index.contains_key(&state)
    }

    pub(crate) fn node(&self, idx: usize) -> &CompiledNode<M> {
        &self.nodes[idx]
    }

    pub(crate) fn id(&self, idx: usize) -> M::State {
        self.nodes[idx].node.id
    }

    /// `descendant` is `ancestor` or lies below it.
    pub(crate) fn is_within(&self, descendant: usize, ancestor: usize) -> bool {
        let mut cursor = Some(descendant);
        while let Some(idx) = cursor {
            if idx == ancestor {
                return true;
            }
            cursor = self.nodes[idx].parent;
        }
        false
    }

    pub(crate) fn is_atomic(&self, idx: usize) -> bool {
        matches!(self.nodes[idx].node.kind, NodeKind::Atomic)
    }
}

pub struct MachineDefinitionBuilder<M: Machine> {
    name: &'static str,
    initial: Option<M::State>,
    states: Vec<StateNode<M>>,
}

impl<M: Machine> MachineDefinitionBuilder<M> {
    pub fn initial(mut self, state: M::State) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn state(mut self, node: StateNode<M>) -> Self {
        self.states.push(node);
        self
    }

    pub fn build(self) -> Result<MachineDefinition<M>, DefinitionError> {
        let name = self.name;
        let initial = self
            .initial
            .ok_or(DefinitionError::MissingInitial { machine: name })?;

        let mut index: HashMap<M::State, usize> = HashMap::new();
        let mut nodes: Vec<CompiledNode<M>> = Vec::with_capacity(self.states.len());

        for node in self.states {
            if index.contains_key(&node.id) {
                return Err(DefinitionError::DuplicateState {
                    machine: name,
                    state: format!("{:?}", node.id),
                });
            }
            let parent = match node.parent {
                Some(parent) => Some(*index.get(&parent).ok_or_else(|| {
                    DefinitionError::UnknownParent {
                        machine: name,
                        state: format!("{:?}", node.id),
                        parent: format!("{parent:?}"),
                    }
                })?),
                None => None,
            };
            let idx = nodes.len();
            index.insert(node.id, idx);
            if let Some(p) = parent {
                nodes[p].children.push(idx);
            }
            nodes.push(CompiledNode {
                node,
                parent,
                children: Vec::new(),
                initial: None,
                targets: Vec::new(),
            });
        }

        for idx in 0..nodes.len() {
            let state = format!("{:?}", nodes[idx].node.id);
            match nodes[idx].node.kind {
                NodeKind::Atomic => {}
                NodeKind::Compound { initial } => {
                    let child = index
                        .get(&initial)
                        .copied()
                        .filter(|c| nodes[*c].parent == Some(idx))
                        .ok_or_else(|| DefinitionError::BadInitial {
                            machine: name,
                            state: state.clone(),
                            initial: format!("{initial:?}"),
                        })?;
                    nodes[idx].initial = Some(child);
                }
                NodeKind::Parallel => {
                    if nodes[idx].children.is_empty() {
                        return Err(DefinitionError::EmptyComposite {
                            machine: name,
                            state,
                        });
                    }
                }
            }

            let mut targets = Vec::with_capacity(nodes[idx].node.transitions.len());
            for (_, transition) in &nodes[idx].node.transitions {
                let resolved = match transition.target {
                    Some(target) => Some(*index.get(&target).ok_or_else(|| {
                        DefinitionError::UnknownTarget {
                            machine: name,
                            state: state.clone(),
                            target: format!("{target:?}"),
                        }
                    })?),
                    None => None,
                };
                targets.push(resolved);
            }
            nodes[idx].targets = targets;
        }

        let initial = index
            .get(&initial)
            .copied()
            .filter(|idx| nodes[*idx].parent.is_none())
            .ok_or_else(|| DefinitionError::BadInitial {
                machine: name,
                state: "<root>".to_string(),
                initial: format!("{initial:?}"),
            })?;

        Ok(MachineDefinition {
            name,
            nodes,
            index,
            initial,
        })
    }
}
