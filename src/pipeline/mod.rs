//! Event processing pipeline for extensible event handling
//!
//! This module provides a trait-based system for dispatching parsed log
//! events to the components that consume them (store writer, stats engine,
//! broadcaster). Each consumer is wired in as a processor so new consumers
//! can be added without touching the ingest loop.
//!
//! # Architecture
//!
//! ```text
//! Event → EventPipeline → [Processor₁, Processor₂, ...] → (side effects only)
//! ```
//!
//! Processors in this pipeline are side-effect-only: they forward events to
//! dedicated writer threads or async tasks rather than transforming them in
//! place, since storage, stats, and broadcast are independent fan-out
//! targets rather than a single linear transform chain.

use crate::events::Event;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Result of processing an event.
#[derive(Debug)]
pub enum ProcessResult {
    /// Event handled, no further action needed.
    Continue,
    /// Processor encountered an error (event dropped, error logged).
    Error(anyhow::Error),
}

/// Context accompanying an event through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    pub node_name: Arc<str>,
}

impl ProcessContext {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: Arc::from(node_name),
        }
    }
}

/// Trait for event processors.
///
/// Processors are called in registration order. `process` is intentionally
/// synchronous: for I/O-bound work (database writes, websocket sends)
/// processors hand off to an internal channel so the pipeline never blocks.
pub trait EventProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, event: &Event, ctx: &ProcessContext) -> ProcessResult;

    /// Called when the pipeline is shutting down. Implementations MUST block
    /// until any background thread has finished flushing.
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T: EventProcessor + ?Sized> EventProcessor for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn process(&self, event: &Event, ctx: &ProcessContext) -> ProcessResult {
        (**self).process(event, ctx)
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        (**self).shutdown()
    }
}

/// Pipeline that runs events through registered processors.
pub struct EventPipeline {
    processors: Vec<Arc<dyn EventProcessor>>,
}

impl EventPipeline {
    pub fn new() -> Self {
        Self { processors: Vec::new() }
    }

    pub fn register(&mut self, processor: impl EventProcessor + 'static) {
        self.processors.push(Arc::new(processor));
    }

    /// Dispatches the event to every registered processor.
    pub fn process(&self, event: &Event, ctx: &ProcessContext) {
        for processor in &self.processors {
            if let ProcessResult::Error(error) = processor.process(event, ctx) {
                tracing::error!("processor '{}' error: {}", processor.name(), error);
            }
        }
    }

    /// Shuts down all processors in reverse registration order.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        for processor in self.processors.iter().rev() {
            if let Err(e) = processor.shutdown() {
                tracing::warn!("processor '{}' shutdown error: {}", processor.name(), e);
            }
        }
        Ok(())
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-shot completion latch used by dedicated writer threads to signal
/// that a graceful shutdown flush is done.
pub struct CompletionSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn complete(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.cv.notify_all();
    }

    /// Blocks until `complete()` is called or `timeout` elapses. Returns
    /// `true` if completion was observed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap();
        while !*done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return *done;
            }
            let (guard, result) = self.cv.wait_timeout(done, remaining).unwrap();
            done = guard;
            if result.timed_out() && !*done {
                return false;
            }
        }
        true
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}
