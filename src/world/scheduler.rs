//! World context scheduling
//!
//! Every mutation of world-visible state (positions, blocks, displays) runs as
//! a task on a single queue drained by one [`WorldLoop`]. Other contexts hand
//! work over through a cloned [`WorldScheduler`]; delays are timer
//! continuations that enqueue the task when they fire.

use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A unit of work that must run on the world context
pub type WorldTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle for submitting work to the world context
#[derive(Clone)]
pub struct WorldScheduler {
    tx: UnboundedSender<WorldTask>,
}

/// The consuming side of the world queue
pub struct WorldLoop {
    rx: UnboundedReceiver<WorldTask>,
}

impl WorldScheduler {
    /// Create a scheduler and the loop that executes its tasks
    #[must_use]
    pub fn new() -> (Self, WorldLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, WorldLoop { rx })
    }

    /// Queue a task to run on the world context as soon as possible
    pub fn run(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(task)).is_err() {
            warn!("World loop has shut down, dropping task");
        }
    }

    /// Queue a task to run on the world context after `delay`
    pub fn run_later(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let tx = self.tx.clone();
        let task: WorldTask = Box::new(task);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(task).is_err() {
                debug!("World loop has shut down, dropping delayed task");
            }
        });
    }
}

impl WorldLoop {
    /// Execute tasks until every scheduler handle is dropped
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            task();
        }
        debug!("World loop finished");
    }

    /// Execute tasks as they arrive for `duration`, then return
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                biased;
                task = self.rx.recv() => match task {
                    Some(task) => task(),
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }
    }

    /// Execute only the tasks already queued
    pub fn run_pending(&mut self) -> usize {
        let mut executed = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            executed += 1;
        }
        executed
    }
}
