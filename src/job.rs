//! Run blocking work on a worker thread and stream its events to an async
//! consumer.
//!
//! Every job ends with exactly one [`Event::Done`], preceded by at most one
//! [`Event::Result`] or [`Event::Error`]. Text the work logs through
//! `tracing` while it runs is captured and forwarded as [`Event::Log`].

use crate::{
    error::Error,
    event::{self, Event, EventReceiver, EventSender, ProgressSink, TryPopError},
};
use std::{
    any::Any,
    io,
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, warn};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CAPTURE_FILTER: &str = "info";

static CAPTURE_FILTER: OnceLock<String> = OnceLock::new();

/// Use `filter` for the log lines captured from job workers. Only the first
/// call has an effect; returns whether it was this one.
pub fn set_capture_filter(filter: &EnvFilter) -> bool {
    CAPTURE_FILTER.set(filter.to_string()).is_ok()
}

fn capture_filter(directives: Option<&str>) -> EnvFilter {
    let directives = directives.unwrap_or(DEFAULT_CAPTURE_FILTER);
    EnvFilter::try_new(directives).unwrap_or_else(|e| {
        warn!(error = %e, directives, "invalid capture filter, using default");
        EnvFilter::new(DEFAULT_CAPTURE_FILTER)
    })
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Payloads that name files the consumer should delete once the job is over.
pub trait JobOutput {
    fn generated_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

impl JobOutput for () {}

/// Handed to the work closure.
pub struct JobContext<T> {
    events: EventSender<T>,
    cancel: CancelToken,
}

impl<T> JobContext<T> {
    pub fn log(&self, text: impl Into<String>) {
        self.events.log(text);
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl<T> ProgressSink for JobContext<T> {
    fn progress(&self, step: &str, message: &str, percentage: u8) {
        self.events.progress(step, message, percentage);
    }
}

/// How a relay loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    Done,
    Failed,
    /// The consumer stopped listening; the job was cancelled.
    Disconnected,
    /// The worker exited without sending `Done`.
    WorkerVanished,
}

pub struct Job<T> {
    name: String,
    events: EventReceiver<T>,
    worker: Option<JoinHandle<()>>,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl<T> Job<T>
where
    T: Send + 'static,
{
    pub fn spawn<F>(name: &str, work: F) -> Result<Self, Error>
    where
        F: FnOnce(&JobContext<T>) -> anyhow::Result<T> + Send + 'static,
    {
        let (tx, rx) = event::channel();
        let cancel = CancelToken::default();
        let context = JobContext {
            events: tx,
            cancel: cancel.clone(),
        };

        let worker = thread::Builder::new()
            .name(format!("job-{}", name))
            .spawn(move || run_worker(context, work))
            .map_err(Error::SpawnWorker)?;
        debug!(job = name, "spawned worker");

        Ok(Self {
            name: name.to_owned(),
            events: rx,
            worker: Some(worker),
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn try_pop(&self) -> Result<Event<T>, TryPopError> {
        self.events.try_pop()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.is_finished())
    }

    /// Block until the worker exits. Later calls return immediately.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(job = %self.name, "worker panicked outside the job boundary");
            }
        }
    }

    async fn join_async(&mut self) {
        if let Some(worker) = self.worker.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!(job = %self.name, "worker panicked outside the job boundary"),
                Err(e) => warn!(job = %self.name, error = %e, "failed to join worker"),
            }
        }
    }

    /// Forward every event to `emit` until the job finishes, then join the
    /// worker and delete `cleanup` plus every file the result names.
    ///
    /// `emit` returning [`ControlFlow::Break`] means the consumer went away:
    /// the job is cancelled and the remaining events are dropped.
    pub async fn relay<F>(mut self, mut cleanup: Vec<PathBuf>, mut emit: F) -> RelayEnd
    where
        T: JobOutput,
        F: FnMut(Event<T>) -> ControlFlow<()>,
    {
        let mut drained_after_exit = false;
        let end = loop {
            match self.events.try_pop() {
                Ok(event) => {
                    let terminal = match &event {
                        Event::Log(_) | Event::Progress(_) => None,
                        Event::Result(output) => {
                            cleanup.extend(output.generated_files());
                            None
                        }
                        Event::Error(_) => Some(RelayEnd::Failed),
                        Event::Done => Some(RelayEnd::Done),
                    };
                    if emit(event).is_break() {
                        self.cancel.cancel();
                        break RelayEnd::Disconnected;
                    }
                    if let Some(end) = terminal {
                        break end;
                    }
                }
                Err(TryPopError::Empty) if self.is_running() => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(TryPopError::Empty) if !drained_after_exit => {
                    // events pushed right before the worker exited
                    drained_after_exit = true;
                }
                Err(_) => {
                    warn!(job = %self.name, "worker exited without signalling done");
                    break RelayEnd::WorkerVanished;
                }
            }
        };

        self.join_async().await;
        cleanup_files(&cleanup);
        end
    }
}

impl<T> Drop for Job<T> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            debug!(job = %self.name, "job dropped before join, cancelling");
            self.cancel.cancel();
        }
    }
}

fn run_worker<T, F>(context: JobContext<T>, work: F)
where
    T: Send + 'static,
    F: FnOnce(&JobContext<T>) -> anyhow::Result<T>,
{
    let outcome = {
        let _capture = tracing::subscriber::set_default(log_capture(context.events.clone()));
        panic::catch_unwind(AssertUnwindSafe(|| work(&context)))
    };

    match outcome {
        Ok(Ok(output)) => context.events.push(Event::Result(output)),
        Ok(Err(e)) => context.events.push(Event::Error(format!("{:?}", e))),
        Err(payload) => context.events.push(Event::Error(format!(
            "job panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
    context.events.push(Event::Done);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

/// A subscriber that turns every formatted log line into a `Log` event.
fn log_capture<T>(events: EventSender<T>) -> impl tracing::Subscriber + Send + Sync
where
    T: Send + 'static,
{
    tracing_subscriber::fmt()
        .with_writer(LogSink { events })
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .with_env_filter(capture_filter(CAPTURE_FILTER.get().map(String::as_str)))
        .finish()
}

struct LogSink<T> {
    events: EventSender<T>,
}

impl<'a, T> MakeWriter<'a> for LogSink<T>
where
    T: Send + 'static,
{
    type Writer = LogWriter<T>;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            events: self.events.clone(),
            buf: Vec::new(),
        }
    }
}

struct LogWriter<T> {
    events: EventSender<T>,
    buf: Vec<u8>,
}

impl<T> io::Write for LogWriter<T> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T> Drop for LogWriter<T> {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        let text = text.trim();
        if !text.is_empty() {
            self.events.log(text);
        }
    }
}

/// Best-effort removal; failures are logged and never returned.
pub fn cleanup_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to clean up file"),
        }
    }
}
