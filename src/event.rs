//! Typed events flowing from a job's worker thread to its consumer.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use serde::Serialize;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub step: String,
    pub message: String,
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    Log(String),
    Progress(Progress),
    Result(T),
    Error(String),
    Done,
}

/// JSON shape of an [`Event`], tagged by `type`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent<'a, T> {
    Log {
        message: &'a str,
    },
    Progress {
        step: &'a str,
        message: &'a str,
        percentage: u8,
    },
    Result {
        data: &'a T,
    },
    Error {
        message: &'a str,
    },
    Done {
        message: &'static str,
    },
}

impl<T> Event<T> {
    pub fn to_wire(&self) -> WireEvent<'_, T> {
        match self {
            Self::Log(message) => WireEvent::Log { message },
            Self::Progress(progress) => WireEvent::Progress {
                step: &progress.step,
                message: &progress.message,
                percentage: progress.percentage,
            },
            Self::Result(data) => WireEvent::Result { data },
            Self::Error(message) => WireEvent::Error { message },
            Self::Done => WireEvent::Done {
                message: "Processing finished.",
            },
        }
    }
}

/// Receives coarse progress milestones from long-running work.
pub trait ProgressSink {
    fn progress(&self, step: &str, message: &str, percentage: u8);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl ProgressSink for Silent {
    fn progress(&self, _step: &str, _message: &str, _percentage: u8) {}
}

/// Create an unbounded FIFO channel of events for one job.
pub fn channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = channel::unbounded();
    (EventSender { tx }, EventReceiver { rx })
}

#[derive(Debug)]
pub struct EventSender<T> {
    tx: Sender<Event<T>>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> EventSender<T> {
    /// Never blocks. Events pushed after the receiver is gone are dropped.
    pub fn push(&self, event: Event<T>) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    pub fn log(&self, text: impl Into<String>) {
        self.push(Event::Log(text.into()));
    }
}

impl<T> ProgressSink for EventSender<T> {
    fn progress(&self, step: &str, message: &str, percentage: u8) {
        self.push(Event::Progress(Progress {
            step: step.to_owned(),
            message: message.to_owned(),
            percentage: percentage.min(100),
        }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopError {
    /// Nothing queued right now.
    Empty,
    /// Nothing queued and every sender is gone.
    Disconnected,
}

#[derive(Debug)]
pub struct EventReceiver<T> {
    rx: Receiver<Event<T>>,
}

impl<T> EventReceiver<T> {
    pub fn try_pop(&self) -> Result<Event<T>, TryPopError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => TryPopError::Empty,
            TryRecvError::Disconnected => TryPopError::Disconnected,
        })
    }
}
