//! Stage capability set and the pipeline chain that binds queues together.
//!
//! A `Stage` is the Rust counterpart of a C `HttpStage`: a named unit with an
//! optional callback for each of the lifecycle points a filter, handler, or
//! connector might care about. Stages with no interest in a given point
//! simply leave it `None`, which is treated as pass-through, matching the
//! teacher's general preference for `Option<fn>`-style optional hooks over
//! empty trait default methods that callers must remember to stub out.

use crate::pipeline::{packet::Packet, queue::Queue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Handler,
    Filter,
    Connector,
}

/// Which HTTP methods a stage applies to. Bound at pipeline-assembly time so
/// a filter can opt out of methods it has nothing to contribute to (e.g. the
/// auth filter skipping `OPTIONS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodMask(u16);

impl MethodMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0xFFFF);

    pub const fn of(method: crate::http::types::Method) -> Self {
        Self(1u16 << method as u16)
    }

    pub const fn contains(self, method: crate::http::types::Method) -> bool {
        self.0 & (1u16 << method as u16) != 0
    }

    pub const fn insert(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for MethodMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.insert(rhs)
    }
}

/// Per-stage lifecycle hooks. Each is an `Option` so a stage only needs to
/// populate the ones it actually participates in; absent hooks are
/// pass-through, mirroring how `original_source`'s `HttpStage` leaves most
/// function pointers null for simple filters.
pub struct Stage {
    pub name: &'static str,
    pub kind: StageKind,
    pub methods: MethodMask,

    pub open: Option<Box<dyn Fn(&mut Queue) + Send + Sync>>,
    pub close: Option<Box<dyn Fn(&mut Queue) + Send + Sync>>,
    pub incoming: Option<Box<dyn Fn(&mut Queue, Packet) -> Option<Packet> + Send + Sync>>,
    pub incoming_service: Option<Box<dyn Fn(&mut Queue) + Send + Sync>>,
    pub outgoing: Option<Box<dyn Fn(&mut Queue, Packet) -> Option<Packet> + Send + Sync>>,
    pub outgoing_service: Option<Box<dyn Fn(&mut Queue) + Send + Sync>>,
}

impl Stage {
    pub fn new(name: &'static str, kind: StageKind) -> Self {
        Self {
            name,
            kind,
            methods: MethodMask::ALL,
            open: None,
            close: None,
            incoming: None,
            incoming_service: None,
            outgoing: None,
            outgoing_service: None,
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// An ordered RX chain and TX chain of queues, one per stage, assembled for
/// a single connection. Queues are addressed by index into `rx`/`tx` rather
/// than via intrusive pointers, since Rust's ownership rules make an arena
/// of small indices simpler than the source's doubly-linked queue rings.
pub struct Pipeline {
    rx: Vec<Queue>,
    tx: Vec<Queue>,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            rx: Vec::new(),
            tx: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage and its bound RX/TX queue pair. Queue order matches
    /// stage insertion order: RX flows head-to-tail (network -> handler), TX
    /// flows tail-to-head (handler -> network), as in §4.5/§9.
    pub fn add_stage(&mut self, stage: Stage, max_rx: usize, max_tx: usize) {
        self.rx.push(Queue::new(stage.name, max_rx));
        self.tx.push(Queue::new(stage.name, max_tx));
        self.stages.push(stage);
    }

    pub fn rx_queue(&mut self, index: usize) -> Option<&mut Queue> {
        self.rx.get_mut(index)
    }

    pub fn tx_queue(&mut self, index: usize) -> Option<&mut Queue> {
        self.tx.get_mut(index)
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Feeds `packet` through the RX chain starting at `index`, calling each
    /// stage's `incoming` hook (pass-through for stages that don't define
    /// one) and stopping early if a stage consumes the packet entirely.
    pub fn run_incoming(&mut self, index: usize, mut packet: Packet) {
        for i in index..self.stages.len() {
            let stage = &self.stages[i];
            let queue = &mut self.rx[i];
            match &stage.incoming {
                Some(hook) => match hook(queue, packet) {
                    Some(next) => packet = next,
                    None => return,
                },
                None => queue.put_for_service(packet),
            }
            if queue.is_suspended() {
                return;
            }
        }
    }

    /// Services every stage's TX queue in tail-to-head order (closest to the
    /// connector first), matching how the source drains the send side
    /// before pulling more from the handler.
    pub fn service_outgoing(&mut self) {
        for i in (0..self.stages.len()).rev() {
            if let Some(hook) = &self.stages[i].outgoing_service {
                hook(&mut self.tx[i]);
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
