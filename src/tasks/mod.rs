//! # Task Scheduling Module
//!
//! A worker-pool scheduler for executing terrain work off the main thread.
//!
//! ## Architecture Overview
//!
//! The scheduling system consists of:
//! - [`Task`]: a unit of work that runs on a worker thread
//! - [`TaskOutput`]: the typed result handed back to the main thread
//! - [`TaskScheduler`]: the submit/drain interface the terrain engine uses
//! - [`WorkerPool`]: the standard implementation backed by OS threads
//!
//! The engine never blocks on a job. It submits whatever is pending, and each
//! tick drains exactly the outputs that have completed by that point. Output
//! order is unspecified; the engine applies each result independently.

pub mod task;

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::debug;

pub use task::{BlockDataOutput, BlockDataOutputKind, BlockMeshOutput, Task, TaskOutput};

/// Submits jobs to background workers and hands back completed outputs.
///
/// `drain_completed` is non-blocking and returns results in no particular
/// order; callers must apply each result independently and idempotently.
pub trait TaskScheduler {
    /// Queues a task for execution.
    fn submit(&mut self, task: Box<dyn Task>);

    /// Collects every output that has completed so far without blocking.
    fn drain_completed(&mut self) -> Vec<TaskOutput>;
}

/// A communication channel between the main thread and one worker thread.
///
/// Each channel is backed by an OS thread consuming tasks from an MPSC queue
/// and pushing outputs back on a second queue.
struct TaskChannel {
    task_sender: Sender<Box<dyn Task>>,
    output_receiver: Receiver<TaskOutput>,
    num_tasks_in_flight: usize,
    _worker: JoinHandle<()>,
}

/// Maximum number of tasks in flight per worker channel.
///
/// Kept at 1 so a long job on one worker cannot delay tasks that another
/// worker could have picked up; excess tasks wait in the overflow queue.
const MAX_TASKS_IN_FLIGHT: usize = 1;

/// Manages a pool of worker threads and distributes tasks across them.
///
/// Tasks are dispatched round-robin to the first channel with a free slot;
/// when every worker is busy they are parked in an overflow queue that is
/// flushed as results are drained.
pub struct WorkerPool {
    channels: Vec<TaskChannel>,
    queued_tasks: VecDeque<Box<dyn Task>>,
    current_channel: usize,
}

impl WorkerPool {
    /// Creates a pool with `num_workers` worker threads.
    ///
    /// # Panics
    /// Panics if thread creation fails.
    pub fn new(num_workers: usize) -> Self {
        let mut channels = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let (task_tx, task_rx) = channel::<Box<dyn Task>>();
            let (output_tx, output_rx) = channel::<TaskOutput>();

            let worker = thread::spawn(move || {
                while let Ok(task) = task_rx.recv() {
                    let output = task.run();
                    let _ = output_tx.send(output);
                }
            });

            channels.push(TaskChannel {
                task_sender: task_tx,
                output_receiver: output_rx,
                num_tasks_in_flight: 0,
                _worker: worker,
            });
        }

        WorkerPool {
            channels,
            queued_tasks: VecDeque::new(),
            current_channel: 0,
        }
    }

    /// Attempts to send a task to a specific worker channel, returning the
    /// task on failure so it can be requeued.
    fn try_send_task(
        &mut self,
        task: Box<dyn Task>,
        channel_idx: usize,
    ) -> Result<(), Box<dyn Task>> {
        match self.channels[channel_idx].task_sender.send(task) {
            Ok(_) => {
                self.channels[channel_idx].num_tasks_in_flight += 1;
                Ok(())
            }
            Err(send_error) => Err(send_error.0),
        }
    }

    /// Finds a channel with a free in-flight slot, round-robin from the last
    /// channel used, or `None` if every worker is saturated.
    fn find_available_channel(&self) -> Option<usize> {
        if self.channels.is_empty() {
            return None;
        }
        let start_channel = self.current_channel;
        let mut current = start_channel;
        loop {
            if self.channels[current].num_tasks_in_flight < MAX_TASKS_IN_FLIGHT {
                return Some(current);
            }
            current = (current + 1) % self.channels.len();
            if current == start_channel {
                return None;
            }
        }
    }

    /// Flushes queued tasks onto channels as slots free up.
    fn process_queued_tasks(&mut self) {
        while !self.queued_tasks.is_empty() {
            match self.find_available_channel() {
                Some(channel_idx) => {
                    let task = self.queued_tasks.pop_front().unwrap();
                    match self.try_send_task(task, channel_idx) {
                        Ok(_) => {
                            self.current_channel = (channel_idx + 1) % self.channels.len();
                        }
                        Err(task) => {
                            // Worker disconnected; put the task back and stop.
                            self.queued_tasks.push_front(task);
                            break;
                        }
                    }
                }
                None => break,
            }
        }
    }
}

impl TaskScheduler for WorkerPool {
    fn submit(&mut self, task: Box<dyn Task>) {
        match self.find_available_channel() {
            Some(channel_idx) => match self.try_send_task(task, channel_idx) {
                Ok(_) => {
                    self.current_channel = (channel_idx + 1) % self.channels.len();
                }
                Err(task) => {
                    self.queued_tasks.push_back(task);
                }
            },
            None => {
                self.queued_tasks.push_back(task);
            }
        }
    }

    fn drain_completed(&mut self) -> Vec<TaskOutput> {
        let mut outputs = Vec::new();
        for channel in &mut self.channels {
            while let Ok(output) = channel.output_receiver.try_recv() {
                channel.num_tasks_in_flight -= 1;
                outputs.push(output);
            }
        }
        if !outputs.is_empty() {
            debug!("drained {} completed task outputs", outputs.len());
        }
        self.process_queued_tasks();
        outputs
    }
}

/// Deterministic scheduler for tests: holds submitted tasks until the test
/// explicitly runs them, so completion timing can be controlled per scenario.
#[cfg(test)]
pub struct ManualScheduler {
    pending: VecDeque<Box<dyn Task>>,
    completed: Vec<TaskOutput>,
}

#[cfg(test)]
impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        ManualScheduler {
            pending: VecDeque::new(),
            completed: Vec::new(),
        }
    }

    /// Number of submitted-but-unrun tasks.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Runs every pending task to completion.
    pub fn run_all(&mut self) {
        while let Some(task) = self.pending.pop_front() {
            self.completed.push(task.run());
        }
    }

    /// Drops every pending task without running it.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
impl TaskScheduler for ManualScheduler {
    fn submit(&mut self, task: Box<dyn Task>) {
        self.pending.push_back(task);
    }

    fn drain_completed(&mut self) -> Vec<TaskOutput> {
        std::mem::take(&mut self.completed)
    }
}
