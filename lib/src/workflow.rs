//! The run state machine.
//!
//! [`next`] is a pure function from the current state and the event produced
//! by that state's effect to the following state. The orchestrator executes
//! the effects; everything here can be tested without I/O.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;

/// Topics are addressed by their position in the configuration.
pub type TopicIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    CheckQueue { topic: TopicIndex },
    Evaluate,
    CheckChanged,
    Discover { topic: TopicIndex },
    RemoveObsolete { topic: TopicIndex },
    ProcessBatch { topic: TopicIndex },
    Sweep { topic: TopicIndex },
    Publish,
    Finalize,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::CheckQueue { topic } => write!(f, "check-queue({topic})"),
            State::Evaluate => write!(f, "evaluate"),
            State::CheckChanged => write!(f, "check-changed"),
            State::Discover { topic } => write!(f, "discover({topic})"),
            State::RemoveObsolete { topic } => write!(f, "remove-obsolete({topic})"),
            State::ProcessBatch { topic } => write!(f, "process-batch({topic})"),
            State::Sweep { topic } => write!(f, "sweep({topic})"),
            State::Publish => write!(f, "publish"),
            State::Finalize => write!(f, "finalize"),
            State::Done => write!(f, "done"),
        }
    }
}

/// Result of a state's effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    QueueChecked { size: usize },
    Evaluated,
    ChangeChecked { changed: bool },
    Discovered { queue_size: usize },
    ObsoleteRemoved { removed: usize },
    BatchProcessed { stored: usize },
    Swept { deleted: usize },
    Published,
    /// Publishing was skipped (queues not empty) or rejected by the remote store.
    PublishSkipped,
    Finalized,
}

/// Static shape of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub topics: usize,
    pub change_check: bool,
    pub publish: bool,
    pub max_batches_per_run: u32,
}

/// What one invocation has observed and done so far. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub queue_sizes: Vec<Option<usize>>,
    /// Topic the run is working on; `None` during the initial scan.
    pub focus: Option<TopicIndex>,
    /// Topics discovered or processed in this run.
    pub worked: Vec<bool>,
    pub batches_run: u32,
    /// A new discovery cycle was started (and recorded) in this run.
    pub cycle_started: bool,
}

impl RunState {
    pub fn new(topics: usize) -> Self {
        Self {
            queue_sizes: vec![None; topics],
            focus: None,
            worked: vec![false; topics],
            batches_run: 0,
            cycle_started: false,
        }
    }

    fn size(&self, topic: TopicIndex) -> usize {
        self.queue_sizes.get(topic).copied().flatten().unwrap_or(0)
    }

    fn all_empty(&self) -> bool {
        self.queue_sizes.iter().all(|s| s.unwrap_or(0) == 0)
    }

    /// Folds the outcome of `state`'s effect into the run state. Called before [`next`].
    pub fn record(&mut self, state: &State, event: &Event) {
        match (state, event) {
            (State::CheckQueue { topic }, Event::QueueChecked { size }) => {
                if let Some(slot) = self.queue_sizes.get_mut(*topic) {
                    *slot = Some(*size);
                }
            }
            (State::Discover { topic }, Event::Discovered { queue_size }) => {
                self.focus = Some(*topic);
                self.mark_worked(*topic);
                if let Some(slot) = self.queue_sizes.get_mut(*topic) {
                    *slot = Some(*queue_size);
                }
            }
            (State::ProcessBatch { topic }, Event::BatchProcessed { .. }) => {
                self.focus = Some(*topic);
                self.mark_worked(*topic);
                self.batches_run += 1;
            }
            (State::Sweep { topic }, Event::Swept { .. }) => {
                if topic + 1 < self.queue_sizes.len() {
                    self.focus = Some(topic + 1);
                }
            }
            _ => {}
        }
    }

    fn mark_worked(&mut self, topic: TopicIndex) {
        if let Some(slot) = self.worked.get_mut(topic) {
            *slot = true;
        }
    }
}

fn unexpected(state: &State, event: &Event) -> anyhow::Error {
    anyhow!("Unexpected event {event:?} in state {state}")
}

/// Returns the state that follows `state` once its effect produced `event`.
pub fn next(plan: &Plan, run: &RunState, state: &State, event: &Event) -> Result<State> {
    let state = *state;
    let next = match (state, event) {
        (State::CheckQueue { topic }, Event::QueueChecked { .. }) => {
            if run.focus.is_none() && topic + 1 < plan.topics {
                State::CheckQueue { topic: topic + 1 }
            } else {
                State::Evaluate
            }
        }
        (State::Evaluate, Event::Evaluated) => match run.focus {
            None => {
                if run.all_empty() {
                    if plan.change_check {
                        State::CheckChanged
                    } else {
                        State::Discover { topic: 0 }
                    }
                } else {
                    let topic = (0..plan.topics).find(|t| run.size(*t) > 0).unwrap_or(0);
                    if run.batches_run < plan.max_batches_per_run {
                        State::ProcessBatch { topic }
                    } else {
                        State::Finalize
                    }
                }
            }
            Some(topic) => {
                if run.size(topic) > 0 {
                    if run.batches_run < plan.max_batches_per_run {
                        State::ProcessBatch { topic }
                    } else {
                        State::Finalize
                    }
                } else if run.worked.get(topic).copied().unwrap_or(false) {
                    State::Sweep { topic }
                } else {
                    State::Discover { topic }
                }
            }
        },
        (State::CheckChanged, Event::ChangeChecked { changed }) => {
            if *changed {
                State::Discover { topic: 0 }
            } else {
                State::Finalize
            }
        }
        (State::Discover { topic }, Event::Discovered { queue_size }) => {
            if *queue_size > 0 {
                State::RemoveObsolete { topic }
            } else {
                State::CheckQueue { topic }
            }
        }
        (State::RemoveObsolete { topic }, Event::ObsoleteRemoved { .. }) => {
            State::CheckQueue { topic }
        }
        (State::ProcessBatch { topic }, Event::BatchProcessed { .. }) => {
            State::CheckQueue { topic }
        }
        (State::Sweep { topic }, Event::Swept { .. }) => {
            if topic + 1 < plan.topics {
                State::CheckQueue { topic: topic + 1 }
            } else if plan.publish {
                State::Publish
            } else {
                State::Finalize
            }
        }
        (State::Publish, Event::Published | Event::PublishSkipped) => State::Finalize,
        (State::Finalize, Event::Finalized) => State::Done,
        (state, event) => return Err(unexpected(&state, event)),
    };
    Ok(next)
}
