//! Audio subsystem module

pub mod block;
pub mod graph;
pub mod tone;

pub use block::{BlockQueue, BlockSink, BlockSource, SampleBlock};
pub use graph::{AudioGraph, AudioOutlet, AudioSink, Node, SharedGraph, StageId, StageKind};
