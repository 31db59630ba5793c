// Periodic publisher that flushes buffered output to persistent storage
// at an adaptive cadence, with a final synchronous flush on shutdown

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::buffer::{MessageBuffer, MessageText};
use crate::config::PublisherConfig;
use crate::errors::StorageError;

/// Adaptive flush cadence: short intervals first, then a longer steady interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishSchedule {
    pub initial_interval: Duration,
    pub initial_ticks: u32,
    pub steady_interval: Duration,
}

impl Default for PublishSchedule {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            initial_ticks: 6,
            steady_interval: Duration::from_secs(30),
        }
    }
}

impl PublishSchedule {
    /// Interval to wait before the given (zero-based) tick
    pub fn interval_for(&self, tick: u32) -> Duration {
        if tick < self.initial_ticks {
            self.initial_interval
        } else {
            self.steady_interval
        }
    }
}

impl From<&PublisherConfig> for PublishSchedule {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            initial_interval: Duration::from_secs(config.initial_interval_secs),
            initial_ticks: config.initial_ticks,
            steady_interval: Duration::from_secs(config.steady_interval_secs),
        }
    }
}

/// Destination for published snapshots
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn publish(&self, snapshot: MessageText) -> Result<(), StorageError>;
}

/// Producer half for an ever-growing output log
#[derive(Debug, Clone)]
pub struct OutputWriter {
    buffer: MessageBuffer,
    notify: mpsc::Sender<()>,
}

impl OutputWriter {
    /// Append a line and signal the publisher. The signal slot holds at most
    /// one pending notification; the publisher always reads the full buffer.
    pub fn write_line(&self, line: &str) {
        if self.buffer.push_line(line) {
            let _ = self.notify.try_send(());
        }
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }
}

/// Producer half for self-contained snapshots where only the latest matters
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    tx: Arc<watch::Sender<MessageText>>,
}

impl SnapshotWriter {
    pub fn write(&self, snapshot: MessageText) {
        self.tx.send_replace(snapshot);
    }
}

enum Source {
    /// FIFO-accumulate: the buffer grows, a changed length or flag is new content
    Accumulate {
        buffer: MessageBuffer,
        notify: mpsc::Receiver<()>,
        published: (usize, bool),
    },
    /// LIFO: only the most recent snapshot is published, compared by value
    Latest {
        rx: watch::Receiver<MessageText>,
        published: Option<MessageText>,
    },
}

impl Source {
    fn take_changed(&mut self) -> Option<MessageText> {
        match self {
            Source::Accumulate {
                buffer,
                notify,
                published,
            } => {
                while notify.try_recv().is_ok() {}
                let snapshot = buffer.snapshot();
                let state = (snapshot.len(), snapshot.is_truncated());
                if state == *published {
                    return None;
                }
                *published = state;
                Some(snapshot)
            }
            Source::Latest { rx, published } => {
                if !rx.has_changed().unwrap_or(false) {
                    return None;
                }
                let snapshot = rx.borrow_and_update().clone();
                if published.as_ref() == Some(&snapshot) {
                    return None;
                }
                *published = Some(snapshot.clone());
                Some(snapshot)
            }
        }
    }
}

/// PeriodicPublisher drains a producer on a background task and flushes the
/// newest state through a sink. `finish` stops the task and flushes once more.
pub struct PeriodicPublisher {
    name: &'static str,
    stop: CancellationToken,
    handle: Option<JoinHandle<Source>>,
    sink: Arc<dyn SnapshotSink>,
}

impl PeriodicPublisher {
    /// Publisher for an accumulating output log
    pub fn accumulate(
        name: &'static str,
        sink: Arc<dyn SnapshotSink>,
        schedule: PublishSchedule,
    ) -> (Self, OutputWriter) {
        let buffer = MessageBuffer::new();
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let source = Source::Accumulate {
            buffer: buffer.clone(),
            notify: notify_rx,
            published: (0, false),
        };
        let writer = OutputWriter {
            buffer,
            notify: notify_tx,
        };
        (Self::spawn(name, source, sink, schedule), writer)
    }

    /// Publisher for whole snapshots where only the newest one matters
    pub fn latest_only(
        name: &'static str,
        sink: Arc<dyn SnapshotSink>,
        schedule: PublishSchedule,
    ) -> (Self, SnapshotWriter) {
        let (tx, rx) = watch::channel(MessageText::default());
        let source = Source::Latest {
            rx,
            published: None,
        };
        let writer = SnapshotWriter { tx: Arc::new(tx) };
        (Self::spawn(name, source, sink, schedule), writer)
    }

    fn spawn(
        name: &'static str,
        source: Source,
        sink: Arc<dyn SnapshotSink>,
        schedule: PublishSchedule,
    ) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            name,
            source,
            Arc::clone(&sink),
            schedule,
            stop.clone(),
        ));
        Self {
            name,
            stop,
            handle: Some(handle),
            sink,
        }
    }

    /// Stop the background loop and publish whatever it has not published yet
    pub async fn finish(mut self) {
        self.stop.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        match handle.await {
            Ok(mut source) => {
                if let Some(snapshot) = source.take_changed() {
                    publish(self.name, self.sink.as_ref(), snapshot).await;
                }
            }
            Err(e) => {
                warn!(publisher = self.name, error = %e, "Output publisher task failed");
            }
        }
    }
}

impl Drop for PeriodicPublisher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_loop(
    name: &'static str,
    mut source: Source,
    sink: Arc<dyn SnapshotSink>,
    schedule: PublishSchedule,
    stop: CancellationToken,
) -> Source {
    let mut tick: u32 = 0;
    loop {
        let interval = schedule.interval_for(tick);
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        tick = tick.saturating_add(1);

        if let Some(snapshot) = source.take_changed() {
            publish(name, sink.as_ref(), snapshot).await;
        }
    }
    source
}

async fn publish(name: &'static str, sink: &dyn SnapshotSink, snapshot: MessageText) {
    debug!(
        publisher = name,
        length = snapshot.len(),
        truncated = snapshot.is_truncated(),
        "Publishing output snapshot"
    );
    if let Err(e) = sink.publish(snapshot).await {
        warn!(publisher = name, error = %e, "Failed to publish output snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<MessageText>>,
    }

    #[async_trait]
    impl SnapshotSink for RecordingSink {
        async fn publish(&self, snapshot: MessageText) -> Result<(), StorageError> {
            self.published.lock().push(snapshot);
            Ok(())
        }
    }

    #[test]
    fn test_schedule_switches_to_steady_interval() {
        let schedule = PublishSchedule::default();
        assert_eq!(schedule.interval_for(0), Duration::from_secs(10));
        assert_eq!(schedule.interval_for(5), Duration::from_secs(10));
        assert_eq!(schedule.interval_for(6), Duration::from_secs(30));
        assert_eq!(schedule.interval_for(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_only_publishes_newest_snapshot() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, writer) =
            PeriodicPublisher::latest_only("test", sink.clone(), PublishSchedule::default());

        for i in 1..=5 {
            writer.write(MessageText::new(format!("P{}", i)));
        }
        tokio::time::sleep(Duration::from_secs(11)).await;

        {
            let published = sink.published.lock();
            assert_eq!(published.len(), 1);
            assert_eq!(published[0].as_str(), "P5");
        }

        publisher.finish().await;
        assert_eq!(sink.published.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accumulate_final_flush_publishes_tail() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, writer) =
            PeriodicPublisher::accumulate("test", sink.clone(), PublishSchedule::default());

        writer.write_line("first");
        tokio::time::sleep(Duration::from_secs(11)).await;
        writer.write_line("second");
        publisher.finish().await;

        let published = sink.published.lock();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].as_str(), "first\n");
        assert_eq!(published[1].as_str(), "first\nsecond\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_buffer_is_not_republished() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, writer) =
            PeriodicPublisher::accumulate("test", sink.clone(), PublishSchedule::default());

        writer.write_line("only");
        tokio::time::sleep(Duration::from_secs(100)).await;
        publisher.finish().await;

        assert_eq!(sink.published.lock().len(), 1);
    }
}
