//! Audio routing graph
//!
//! Stages live in an arena owned by one [`AudioGraph`] and are addressed by
//! [`StageId`]. Wiring is expressed with [`Node`]s, so a fan-out point only
//! ever holds handles to its consumers, never the consumers themselves.
//! Endpoints owned by someone else (transmitters) are attached as external
//! [`AudioSink`]s; sources owned by someone else (receivers) write into the
//! graph through an [`AudioOutlet`], which stops delivering once the graph is
//! gone.
//!
//! ```text
//!  outlet ──▶ Fifo ──▶ Splitter ──┬──▶ sink
//!                                 └──▶ Passthrough ──▶ Branch(0) ──┐
//!  outlet ─────────────────────────────────────────▶ Branch(10) ──┴─▶ Selector ──▶ sink
//! ```
//!
//! Everything runs synchronously on the caller's thread. External sinks must
//! not write back into the graph that is calling them.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::error::GraphError;

/// Consumer of samples outside the graph
pub trait AudioSink: Send + Sync {
    /// Write samples, returns how many were accepted
    fn write_samples(&self, samples: &[i16]) -> usize;

    /// The producer has no more samples for now
    fn flush_samples(&self);
}

/// Handle of a stage inside one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(usize);

/// Handle of an external sink attached to one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(usize);

/// Anything samples can be written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Stage(StageId),
    Sink(SinkId),
}

impl From<StageId> for Node {
    fn from(id: StageId) -> Self {
        Node::Stage(id)
    }
}

impl From<SinkId> for Node {
    fn from(id: SinkId) -> Self {
        Node::Sink(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Buffering stage with prebuffering
    Fifo,
    /// One-to-many duplication
    Splitter,
    /// Priority arbitrated many-to-one selection
    Selector,
    /// Input of a selector
    SelectorBranch,
    Passthrough,
}

struct Fifo {
    buf: VecDeque<i16>,
    capacity: usize,
    prebuf_samples: usize,
    prebuffering: bool,
    consumer: Option<Node>,
    overflow: usize,
}

enum Stage {
    Fifo(Fifo),
    Splitter {
        consumers: Vec<Node>,
    },
    Passthrough {
        consumer: Option<Node>,
    },
    Selector {
        consumer: Option<Node>,
        branches: Vec<StageId>,
        active: Option<StageId>,
    },
    Branch {
        selector: StageId,
        priority: i32,
    },
}

impl Stage {
    fn kind(&self) -> StageKind {
        match self {
            Stage::Fifo(_) => StageKind::Fifo,
            Stage::Splitter { .. } => StageKind::Splitter,
            Stage::Passthrough { .. } => StageKind::Passthrough,
            Stage::Selector { .. } => StageKind::Selector,
            Stage::Branch { .. } => StageKind::SelectorBranch,
        }
    }

    fn successors(&self) -> Vec<Node> {
        match self {
            Stage::Fifo(fifo) => fifo.consumer.iter().copied().collect(),
            Stage::Splitter { consumers } => consumers.clone(),
            Stage::Passthrough { consumer } | Stage::Selector { consumer, .. } => {
                consumer.iter().copied().collect()
            }
            Stage::Branch { selector, .. } => vec![Node::Stage(*selector)],
        }
    }
}

/// Arena of routing stages
#[derive(Default)]
pub struct AudioGraph {
    stages: Vec<Stage>,
    sinks: Vec<Arc<dyn AudioSink>>,
}

/// Graph shared with the outlets that feed it
pub type SharedGraph = Arc<Mutex<AudioGraph>>;

impl AudioGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the graph so outlets can reference it
    pub fn into_shared(self) -> SharedGraph {
        Arc::new(Mutex::new(self))
    }

    fn push(&mut self, stage: Stage) -> StageId {
        self.stages.push(stage);
        StageId(self.stages.len() - 1)
    }

    /// Buffer of `capacity` samples; prebuffering is off until
    /// [`set_prebuf_samples`](Self::set_prebuf_samples) is called
    pub fn add_fifo(&mut self, capacity: usize) -> StageId {
        self.push(Stage::Fifo(Fifo {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            prebuf_samples: 0,
            prebuffering: false,
            consumer: None,
            overflow: 0,
        }))
    }

    /// Hold output back until `samples` are buffered
    pub fn set_prebuf_samples(&mut self, fifo: StageId, samples: usize) -> Result<(), GraphError> {
        match self.stages.get_mut(fifo.0) {
            Some(Stage::Fifo(f)) => {
                f.prebuf_samples = samples.min(f.capacity);
                f.prebuffering = f.prebuf_samples > 0 && f.buf.len() < f.prebuf_samples;
                Ok(())
            }
            Some(_) => Err(GraphError::NotAProducer(fifo.0)),
            None => Err(GraphError::UnknownStage(fifo.0)),
        }
    }

    pub fn add_splitter(&mut self) -> StageId {
        self.push(Stage::Splitter {
            consumers: Vec::new(),
        })
    }

    pub fn add_passthrough(&mut self) -> StageId {
        self.push(Stage::Passthrough { consumer: None })
    }

    pub fn add_selector(&mut self) -> StageId {
        self.push(Stage::Selector {
            consumer: None,
            branches: Vec::new(),
            active: None,
        })
    }

    /// New auto-selecting input of `selector`
    ///
    /// A writing input takes over when nothing is selected or when its
    /// priority is strictly higher than the selected one.
    pub fn add_selector_source(
        &mut self,
        selector: StageId,
        priority: i32,
    ) -> Result<StageId, GraphError> {
        if !matches!(self.stages.get(selector.0), Some(Stage::Selector { .. })) {
            return Err(GraphError::UnknownStage(selector.0));
        }
        let branch = self.push(Stage::Branch { selector, priority });
        if let Some(Stage::Selector { branches, .. }) = self.stages.get_mut(selector.0) {
            branches.push(branch);
        }
        Ok(branch)
    }

    /// Attach an externally owned sink
    pub fn add_sink(&mut self, sink: Arc<dyn AudioSink>) -> SinkId {
        self.sinks.push(sink);
        SinkId(self.sinks.len() - 1)
    }

    /// Make `to` a consumer of `from`
    pub fn connect(&mut self, from: StageId, to: impl Into<Node>) -> Result<(), GraphError> {
        let to = to.into();
        if from.0 >= self.stages.len() {
            return Err(GraphError::UnknownStage(from.0));
        }
        match to {
            Node::Sink(s) if s.0 >= self.sinks.len() => {
                return Err(GraphError::UnknownStage(s.0));
            }
            Node::Stage(t) => match self.stages.get(t.0) {
                None => return Err(GraphError::UnknownStage(t.0)),
                Some(Stage::Selector { .. }) => return Err(GraphError::NotAConsumer(t.0)),
                Some(_) if self.reaches(t, from) => return Err(GraphError::Cycle(from.0)),
                Some(_) => {}
            },
            Node::Sink(_) => {}
        }

        match &mut self.stages[from.0] {
            Stage::Fifo(Fifo { consumer, .. })
            | Stage::Passthrough { consumer }
            | Stage::Selector { consumer, .. } => {
                if consumer.is_some() {
                    return Err(GraphError::AlreadyConnected(from.0));
                }
                *consumer = Some(to);
            }
            Stage::Splitter { consumers } => {
                if consumers.contains(&to) {
                    return Err(GraphError::AlreadyConnected(from.0));
                }
                consumers.push(to);
            }
            Stage::Branch { .. } => return Err(GraphError::NotAProducer(from.0)),
        }
        Ok(())
    }

    fn reaches(&self, start: StageId, target: StageId) -> bool {
        let mut stack = vec![start];
        let mut seen = vec![false; self.stages.len()];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            for node in self.stages[id.0].successors() {
                if let Node::Stage(next) = node {
                    stack.push(next);
                }
            }
        }
        false
    }

    pub fn kind(&self, id: StageId) -> Option<StageKind> {
        self.stages.get(id.0).map(Stage::kind)
    }

    /// Number of stages of `kind`
    pub fn count(&self, kind: StageKind) -> usize {
        self.stages.iter().filter(|s| s.kind() == kind).count()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// The stage whose output feeds `node`, if any
    pub fn feeder_of(&self, node: impl Into<Node>) -> Option<StageId> {
        let node = node.into();
        self.stages
            .iter()
            .position(|s| s.successors().contains(&node))
            .map(StageId)
    }

    /// Currently selected input of a selector
    pub fn active_source(&self, selector: StageId) -> Option<StageId> {
        match self.stages.get(selector.0) {
            Some(Stage::Selector { active, .. }) => *active,
            _ => None,
        }
    }

    /// Inputs of a selector in creation order
    pub fn selector_sources(&self, selector: StageId) -> Vec<StageId> {
        match self.stages.get(selector.0) {
            Some(Stage::Selector { branches, .. }) => branches.clone(),
            _ => Vec::new(),
        }
    }

    /// Samples waiting in a fifo
    pub fn buffered(&self, fifo: StageId) -> usize {
        match self.stages.get(fifo.0) {
            Some(Stage::Fifo(f)) => f.buf.len(),
            _ => 0,
        }
    }

    /// Write samples into `node`, returns how many were accepted
    pub fn write(&mut self, node: impl Into<Node>, samples: &[i16]) -> usize {
        match node.into() {
            Node::Sink(s) => match self.sinks.get(s.0) {
                Some(sink) => sink.write_samples(samples),
                None => samples.len(),
            },
            Node::Stage(id) => self.write_stage(id, samples),
        }
    }

    /// Propagate an end-of-stream through `node`
    pub fn flush(&mut self, node: impl Into<Node>) {
        match node.into() {
            Node::Sink(s) => {
                if let Some(sink) = self.sinks.get(s.0) {
                    sink.flush_samples();
                }
            }
            Node::Stage(id) => self.flush_stage(id),
        }
    }

    fn write_stage(&mut self, id: StageId, samples: &[i16]) -> usize {
        let Some(stage) = self.stages.get_mut(id.0) else {
            return samples.len();
        };
        match stage {
            Stage::Fifo(fifo) => {
                let space = fifo.capacity - fifo.buf.len();
                let accepted = space.min(samples.len());
                fifo.buf.extend(&samples[..accepted]);
                if accepted < samples.len() {
                    if fifo.overflow == 0 {
                        tracing::warn!("Audio fifo {} overflow, dropping samples", id.0);
                    }
                    fifo.overflow += samples.len() - accepted;
                }
                self.drain_fifo(id, false);
                accepted
            }
            Stage::Splitter { consumers } => {
                let consumers = consumers.clone();
                for consumer in consumers {
                    let written = self.write(consumer, samples);
                    if written < samples.len() {
                        tracing::trace!(
                            "Splitter consumer {:?} took {} of {} samples",
                            consumer,
                            written,
                            samples.len()
                        );
                    }
                }
                samples.len()
            }
            Stage::Passthrough { consumer } => {
                let consumer = *consumer;
                match consumer {
                    Some(consumer) => self.write(consumer, samples),
                    None => samples.len(),
                }
            }
            // Selectors are only written through their branches
            Stage::Selector { .. } => samples.len(),
            Stage::Branch { selector, priority } => {
                let (selector, priority) = (*selector, *priority);
                match self.select(selector, id, priority) {
                    Some(consumer) => self.write(consumer, samples),
                    None => samples.len(),
                }
            }
        }
    }

    /// Arbitrate a write from `branch`; returns the selector output if the
    /// branch is (now) the selected one
    fn select(&mut self, selector: StageId, branch: StageId, priority: i32) -> Option<Node> {
        let active_priority = match self.stages.get(selector.0) {
            Some(Stage::Selector {
                active: Some(active),
                ..
            }) if *active != branch => match self.stages.get(active.0) {
                Some(Stage::Branch { priority, .. }) => Some(*priority),
                _ => None,
            },
            _ => None,
        };
        let Some(Stage::Selector {
            active, consumer, ..
        }) = self.stages.get_mut(selector.0)
        else {
            return None;
        };
        let takes_over = match (*active, active_priority) {
            (Some(current), _) if current == branch => true,
            (Some(_), Some(p)) => priority > p,
            _ => true,
        };
        if !takes_over {
            return None;
        }
        if *active != Some(branch) {
            tracing::debug!(
                "Selector {} switching to source {} (priority {})",
                selector.0,
                branch.0,
                priority
            );
            *active = Some(branch);
        }
        *consumer
    }

    fn drain_fifo(&mut self, id: StageId, flushing: bool) {
        let (consumer, pending) = match self.stages.get_mut(id.0) {
            Some(Stage::Fifo(fifo)) => {
                if fifo.prebuffering && !flushing {
                    if fifo.buf.len() < fifo.prebuf_samples {
                        return;
                    }
                    fifo.prebuffering = false;
                }
                let Some(consumer) = fifo.consumer else {
                    return;
                };
                if fifo.buf.is_empty() {
                    return;
                }
                (consumer, fifo.buf.iter().copied().collect::<Vec<_>>())
            }
            _ => return,
        };

        let written = self.write(consumer, &pending);

        if let Some(Stage::Fifo(fifo)) = self.stages.get_mut(id.0) {
            fifo.buf.drain(..written.min(fifo.buf.len()));
        }
    }

    fn flush_stage(&mut self, id: StageId) {
        let next: Vec<Node> = match self.stages.get(id.0) {
            None => return,
            Some(Stage::Fifo(_)) => {
                self.drain_fifo(id, true);
                match self.stages.get_mut(id.0) {
                    Some(Stage::Fifo(fifo)) => {
                        if !fifo.buf.is_empty() {
                            tracing::trace!(
                                "Discarding {} unconsumed samples on flush",
                                fifo.buf.len()
                            );
                            fifo.buf.clear();
                        }
                        fifo.prebuffering = fifo.prebuf_samples > 0;
                        fifo.consumer.iter().copied().collect()
                    }
                    _ => return,
                }
            }
            Some(Stage::Splitter { consumers }) => consumers.clone(),
            Some(Stage::Passthrough { consumer }) => consumer.iter().copied().collect(),
            Some(Stage::Selector { .. }) => Vec::new(),
            Some(Stage::Branch { selector, .. }) => {
                let selector = *selector;
                match self.stages.get_mut(selector.0) {
                    Some(Stage::Selector {
                        active, consumer, ..
                    }) if *active == Some(id) => {
                        *active = None;
                        consumer.iter().copied().collect()
                    }
                    _ => Vec::new(),
                }
            }
        };
        for node in next {
            self.flush(node);
        }
    }
}

/// Entry point through which an external source writes into a graph
///
/// Holds only a weak reference: once the owning router drops its graph,
/// writes are silently discarded.
#[derive(Clone)]
pub struct AudioOutlet {
    graph: Weak<Mutex<AudioGraph>>,
    entry: Node,
}

impl AudioOutlet {
    pub fn new(graph: &SharedGraph, entry: impl Into<Node>) -> Self {
        Self {
            graph: Arc::downgrade(graph),
            entry: entry.into(),
        }
    }

    pub fn write_samples(&self, samples: &[i16]) -> usize {
        match self.graph.upgrade() {
            Some(graph) => graph.lock().write(self.entry, samples),
            None => samples.len(),
        }
    }

    pub fn flush_samples(&self) {
        if let Some(graph) = self.graph.upgrade() {
            graph.lock().flush(self.entry);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.graph.strong_count() > 0
    }

    pub fn entry(&self) -> Node {
        self.entry
    }
}

impl std::fmt::Debug for AudioOutlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioOutlet")
            .field("entry", &self.entry)
            .field("connected", &self.is_connected())
            .finish()
    }
}
