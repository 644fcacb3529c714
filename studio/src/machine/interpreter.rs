use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::definition::{ActionScope, MachineDefinition, NodeKind};
use super::service::{Delivery, DeliverySink, Invocation, InvocationId};
use super::{Machine, MachineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    NotStarted,
    Running,
    Stopped,
}

struct RunningService {
    state: usize,
    name: &'static str,
    handle: JoinHandle<()>,
}

/// One live instance of a machine: its context plus the set of active states.
pub struct Interpreter<M: Machine> {
    definition: Arc<MachineDefinition<M>>,
    ctx: M::Context,
    active: BTreeSet<usize>,
    services: HashMap<InvocationId, RunningService>,
    sink: DeliverySink<M::Event>,
    next_invocation: u64,
    status: MachineStatus,
}

impl<M: Machine> Interpreter<M> {
    pub fn new(
        definition: Arc<MachineDefinition<M>>,
        ctx: M::Context,
        sink: DeliverySink<M::Event>,
    ) -> Self {
        Self {
            definition,
            ctx,
            active: BTreeSet::new(),
            services: HashMap::new(),
            sink,
            next_invocation: 1,
            status: MachineStatus::NotStarted,
        }
    }

    /// Enter the initial configuration. Calling it twice is a no-op.
    pub fn start(&mut self) -> Vec<M::Command> {
        if self.status != MachineStatus::NotStarted {
            return Vec::new();
        }
        self.status = MachineStatus::Running;

        let mut raised = VecDeque::new();
        let mut commands = Vec::new();
        let mut entry = BTreeSet::new();
        self.add_descendants(self.definition.initial, &mut entry);
        for idx in entry {
            self.enter_state(idx, None, &mut raised, &mut commands);
        }
        while let Some(next) = raised.pop_front() {
            self.microstep(&next, &mut raised, &mut commands);
        }
        commands
    }

    /// Process one event to completion, including every event raised by the
    /// actions it triggers.
    pub fn send(&mut self, event: M::Event) -> Vec<M::Command> {
        if self.status != MachineStatus::Running {
            tracing::trace!(
                machine = self.definition.name,
                event = ?event.kind(),
                "Event sent to machine that is not running"
            );
            return Vec::new();
        }

        let mut raised = VecDeque::new();
        let mut commands = Vec::new();
        self.microstep(&event, &mut raised, &mut commands);
        while let Some(next) = raised.pop_front() {
            self.microstep(&next, &mut raised, &mut commands);
        }
        commands
    }

    /// Feed service output back in; results from services whose state has
    /// been left are dropped.
    pub fn deliver(&mut self, delivery: Delivery<M::Event>) -> Vec<M::Command> {
        if !self.services.contains_key(&delivery.invocation) {
            tracing::trace!(
                machine = self.definition.name,
                event = ?delivery.event.kind(),
                "Dropping output of cancelled service"
            );
            return Vec::new();
        }
        self.send(delivery.event)
    }

    /// Cancel every service and leave the machine inert. Exit actions do not run.
    pub fn stop(&mut self) {
        for (_, service) in self.services.drain() {
            service.handle.abort();
        }
        self.active.clear();
        self.status = MachineStatus::Stopped;
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn matches(&self, state: M::State) -> bool {
        self.definition
            .index
            .get(&state)
            .is_some_and(|idx| self.active.contains(idx))
    }

    /// Active states in document order, ancestors before descendants.
    pub fn active_states(&self) -> Vec<M::State> {
        self.active
            .iter()
            .map(|idx| self.definition.id(*idx))
            .collect()
    }

    /// Names of the services currently bound to active states.
    pub fn running_services(&self) -> Vec<&'static str> {
        let mut running: Vec<(InvocationId, &'static str)> = self
            .services
            .iter()
            .map(|(id, service)| (*id, service.name))
            .collect();
        running.sort();
        running.into_iter().map(|(_, name)| name).collect()
    }

    pub fn context(&self) -> &M::Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut M::Context {
        &mut self.ctx
    }

    fn microstep(
        &mut self,
        event: &M::Event,
        raised: &mut VecDeque<M::Event>,
        commands: &mut Vec<M::Command>,
    ) {
        let enabled = self.select(event);
        if enabled.is_empty() {
            tracing::trace!(
                machine = self.definition.name,
                event = ?event.kind(),
                "Event not handled in current state"
            );
            return;
        }
        for (source, transition) in enabled {
            // An earlier transition in this step may have exited the source
            if !self.active.contains(&source) {
                continue;
            }
            self.fire(source, transition, event, raised, commands);
        }
    }

    /// For every active leaf, walk up to the root and take the first
    /// transition whose event matches and guard passes.
    fn select(&self, event: &M::Event) -> Vec<(usize, usize)> {
        let kind = event.kind();
        let definition = &self.definition;
        let mut enabled: Vec<(usize, usize)> = Vec::new();

        for leaf in self.active.iter().filter(|idx| definition.is_atomic(**idx)) {
            let mut cursor = Some(*leaf);
            'walk: while let Some(idx) = cursor {
                let node = definition.node(idx);
                for (position, (on, transition)) in node.node.transitions.iter().enumerate() {
                    if *on != kind {
                        continue;
                    }
                    if let Some(guard) = &transition.guard {
                        if !guard(&self.ctx, event) {
                            continue;
                        }
                    }
                    if !enabled.contains(&(idx, position)) {
                        enabled.push((idx, position));
                    }
                    break 'walk;
                }
                cursor = node.parent;
            }
        }
        enabled
    }

    fn fire(
        &mut self,
        source: usize,
        position: usize,
        event: &M::Event,
        raised: &mut VecDeque<M::Event>,
        commands: &mut Vec<M::Command>,
    ) {
        let definition = Arc::clone(&self.definition);
        let node = definition.node(source);
        let transition = &node.node.transitions[position].1;
        let target = node.targets[position];

        let Some(target) = target.filter(|t| transition.reenter || *t != source) else {
            self.run_actions(&transition.actions, Some(event), raised, commands);
            return;
        };

        let domain = self.domain(source, target, transition.reenter);
        let exiting: Vec<usize> = self
            .active
            .iter()
            .copied()
            .filter(|idx| match domain {
                Some(domain) => *idx != domain && definition.is_within(*idx, domain),
                None => true,
            })
            .collect();
        for idx in exiting.into_iter().rev() {
            self.exit_state(idx, event, raised, commands);
        }

        self.run_actions(&transition.actions, Some(event), raised, commands);

        let entering = self.entry_set(target, domain);
        tracing::debug!(
            machine = definition.name,
            event = ?event.kind(),
            from = ?definition.id(source),
            to = ?definition.id(target),
            "Machine transition"
        );
        for idx in entering {
            if !self.active.contains(&idx) {
                self.enter_state(idx, Some(event), raised, commands);
            }
        }
    }

    /// The innermost state that is neither exited nor entered.
    fn domain(&self, source: usize, target: usize, reenter: bool) -> Option<usize> {
        let definition = &self.definition;
        if !reenter && target != source && definition.is_within(target, source) {
            return Some(source);
        }
        let mut cursor = definition.node(source).parent;
        while let Some(ancestor) = cursor {
            let node = definition.node(ancestor);
            if !matches!(node.node.kind, NodeKind::Parallel)
                && target != ancestor
                && definition.is_within(target, ancestor)
            {
                return Some(ancestor);
            }
            cursor = node.parent;
        }
        None
    }

    fn entry_set(&self, target: usize, domain: Option<usize>) -> BTreeSet<usize> {
        let mut set = BTreeSet::new();
        self.add_descendants(target, &mut set);

        let mut cursor = self.definition.node(target).parent;
        while let Some(ancestor) = cursor {
            if Some(ancestor) == domain {
                break;
            }
            set.insert(ancestor);
            let node = self.definition.node(ancestor);
            if matches!(node.node.kind, NodeKind::Parallel) {
                for child in &node.children {
                    if !self.region_covered(*child, &set) {
                        self.add_descendants(*child, &mut set);
                    }
                }
            }
            cursor = node.parent;
        }
        set
    }

    fn add_descendants(&self, idx: usize, set: &mut BTreeSet<usize>) {
        set.insert(idx);
        let node = self.definition.node(idx);
        match node.node.kind {
            NodeKind::Atomic => {}
            NodeKind::Compound { .. } => {
                if let Some(initial) = node.initial {
                    self.add_descendants(initial, set);
                }
            }
            NodeKind::Parallel => {
                for child in &node.children {
                    if !self.region_covered(*child, set) {
                        self.add_descendants(*child, set);
                    }
                }
            }
        }
    }

    fn region_covered(&self, region: usize, set: &BTreeSet<usize>) -> bool {
        set.iter().any(|idx| self.definition.is_within(*idx, region))
    }

    fn enter_state(
        &mut self,
        idx: usize,
        event: Option<&M::Event>,
        raised: &mut VecDeque<M::Event>,
        commands: &mut Vec<M::Command>,
    ) {
        let definition = Arc::clone(&self.definition);
        let node = &definition.node(idx).node;
        self.active.insert(idx);
        self.run_actions(&node.entry, event, raised, commands);
        for invocation in &node.invocations {
            self.start_service(idx, invocation, event);
        }
    }

    fn exit_state(
        &mut self,
        idx: usize,
        event: &M::Event,
        raised: &mut VecDeque<M::Event>,
        commands: &mut Vec<M::Command>,
    ) {
        let definition = Arc::clone(&self.definition);
        let node = &definition.node(idx).node;
        self.run_actions(&node.exit, Some(event), raised, commands);

        let cancelled: Vec<InvocationId> = self
            .services
            .iter()
            .filter(|(_, service)| service.state == idx)
            .map(|(id, _)| *id)
            .collect();
        for id in cancelled {
            if let Some(service) = self.services.remove(&id) {
                tracing::trace!(
                    machine = definition.name,
                    service = service.name,
                    "Cancelling service on state exit"
                );
                service.handle.abort();
            }
        }
        self.active.remove(&idx);
    }

    fn run_actions(
        &mut self,
        actions: &[super::definition::Action<M>],
        event: Option<&M::Event>,
        raised: &mut VecDeque<M::Event>,
        commands: &mut Vec<M::Command>,
    ) {
        for action in actions {
            let mut scope = ActionScope {
                ctx: &mut self.ctx,
                event,
                raised,
                commands,
            };
            action(&mut scope);
        }
    }

    fn start_service(&mut self, state: usize, invocation: &Invocation<M>, event: Option<&M::Event>) {
        let id = InvocationId(self.next_invocation);
        self.next_invocation += 1;

        let mut stream = (invocation.factory)(&self.ctx, event);
        let sink = Arc::clone(&self.sink);
        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                sink(Delivery {
                    invocation: id,
                    event,
                });
            }
        });
        self.services.insert(
            id,
            RunningService {
                state,
                name: invocation.name,
                handle,
            },
        );
    }
}

impl<M: Machine> Drop for Interpreter<M> {
    fn drop(&mut self) {
        for (_, service) in self.services.drain() {
            service.handle.abort();
        }
    }
}
