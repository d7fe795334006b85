//! Fixed-size sample blocks and the queues that move them
//!
//! A block is the atomic unit passed between an audio device and the rest of
//! the process: exactly `block_size` frames of interleaved i16 samples.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One block of interleaved samples
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleBlock {
    /// Interleaved samples, `frames * channels` long
    pub samples: Vec<i16>,
    /// Number of channels
    pub channels: usize,
}

impl SampleBlock {
    pub fn new(samples: Vec<i16>, channels: usize) -> Self {
        debug_assert!(channels > 0 && samples.len() % channels == 0);
        Self { samples, channels }
    }

    /// A block of silence
    pub fn silence(frames: usize, channels: usize) -> Self {
        Self::new(vec![0; frames * channels], channels)
    }

    /// Get number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }
}

/// Upstream side of a device write path
pub trait BlockSource: Send {
    /// Fill `out` with the next block; false when nothing is available
    fn get_block(&mut self, out: &mut [i16]) -> bool;
}

/// Downstream side of a device read path
pub trait BlockSink: Send {
    fn put_block(&mut self, samples: &[i16], channels: usize);
}

/// Lock-free bounded queue of blocks
///
/// Clones share the same queue, so one clone can be handed to a device as its
/// [`BlockSource`] or [`BlockSink`] while another is used by the producer or
/// consumer on the other side.
#[derive(Clone)]
pub struct BlockQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    queue: ArrayQueue<SampleBlock>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl BlockQueue {
    /// Create a new queue holding at most `capacity` blocks
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: ArrayQueue::new(capacity.max(1)),
                overflow_count: AtomicUsize::new(0),
                underrun_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Push a block into the queue
    /// Returns false if the queue is full (overflow)
    pub fn push(&self, block: SampleBlock) -> bool {
        match self.inner.queue.push(block) {
            Ok(()) => true,
            Err(_) => {
                self.inner.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a block from the queue
    /// Returns None if the queue is empty (underrun)
    pub fn pop(&self) -> Option<SampleBlock> {
        match self.inner.queue.pop() {
            Some(block) => Some(block),
            None => {
                self.inner.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pop without counting an underrun
    pub fn try_pop(&self) -> Option<SampleBlock> {
        self.inner.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.inner.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.inner.underrun_count.load(Ordering::Relaxed)
    }

    /// Drop everything queued
    pub fn clear(&self) {
        while self.inner.queue.pop().is_some() {}
    }
}

impl BlockSource for BlockQueue {
    fn get_block(&mut self, out: &mut [i16]) -> bool {
        // An empty queue just means the write cycle is done
        let Some(block) = self.try_pop() else {
            return false;
        };
        if block.samples.len() != out.len() {
            tracing::warn!(
                "Dropping block of {} samples, device expects {}",
                block.samples.len(),
                out.len()
            );
            return self.get_block(out);
        }
        out.copy_from_slice(&block.samples);
        true
    }
}

impl BlockSink for BlockQueue {
    fn put_block(&mut self, samples: &[i16], channels: usize) {
        if !self.push(SampleBlock::new(samples.to_vec(), channels)) {
            tracing::trace!("Block queue full, dropping block");
        }
    }
}
