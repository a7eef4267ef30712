use crate::error::StorageError;
use crate::influxdb::{Point, TimeSeriesSink};
use crate::retry_policy::{RetryError, RetryPolicy};
use crate::samples::Batch;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const METER_MEASUREMENT: &str = "meter_data";
pub const DERIVED_MEASUREMENT: &str = "derived_data";

/// Counters shared with whoever wants to watch the writer.
#[derive(Debug, Default)]
pub struct StorageStats {
    written: AtomicU64,
    failed_writes: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    lost_on_shutdown: AtomicU64,
    buffered: AtomicUsize,
}

impl StorageStats {
    /// Batches committed to the store.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Writes that gave up after all retries.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Batches dropped because the retry buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Batches the store refused outright, dropped without retrying.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn lost_on_shutdown(&self) -> u64 {
        self.lost_on_shutdown.load(Ordering::Relaxed)
    }

    /// Batches currently waiting in the retry buffer.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }
}

/// Flattens a batch into points, every field already a float.
pub fn batch_to_points(batch: &Batch) -> Vec<Point> {
    let raw = batch.raw.iter().map(|sample| Point {
        measurement: METER_MEASUREMENT.to_string(),
        tags: BTreeMap::from([
            ("meter".to_string(), sample.meter.clone()),
            ("role".to_string(), sample.role.to_string()),
        ]),
        fields: sample.fields.clone(),
        timestamp: batch.timestamp,
    });
    let derived = batch.derived.iter().map(|sample| Point {
        measurement: DERIVED_MEASUREMENT.to_string(),
        tags: BTreeMap::from([("series".to_string(), sample.name.clone())]),
        fields: sample.fields.clone(),
        timestamp: batch.timestamp,
    });
    raw.chain(derived).collect()
}

/// Drains the storage queue into the time-series store.
///
/// Batches that could not be written are kept, in tick order, in a bounded
/// retry buffer and retried before any newer batch. When the buffer is full the
/// oldest batch is dropped.
pub struct StorageWriter {
    sink: Arc<dyn TimeSeriesSink>,
    retry: RetryPolicy,
    capacity: usize,
    drain_grace: Duration,
    retry_buffer: VecDeque<Batch>,
    stats: Arc<StorageStats>,
}

impl StorageWriter {
    pub fn new(
        sink: Arc<dyn TimeSeriesSink>,
        retry: RetryPolicy,
        capacity: usize,
        drain_grace: Duration,
    ) -> Self {
        Self {
            sink,
            retry,
            capacity: capacity.max(1),
            drain_grace,
            retry_buffer: VecDeque::with_capacity(capacity.max(1)),
            stats: Arc::new(StorageStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<StorageStats> {
        Arc::clone(&self.stats)
    }

    /// Main loop of the storage worker.
    pub async fn run(mut self, mut queue: Receiver<Batch>, cancel: CancellationToken) {
        info!(capacity = self.capacity, "starting storage writer");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = queue.recv() => match item {
                    Some(batch) => self.accept(batch, &cancel).await,
                    None => {
                        info!("storage queue closed");
                        break;
                    }
                },
            }
        }
        self.drain(queue).await;
        info!("storage writer exiting");
    }

    /// Writes a new batch, after anything older still waiting for a retry.
    async fn accept(&mut self, batch: Batch, cancel: &CancellationToken) {
        self.flush(cancel).await;
        if !self.retry_buffer.is_empty() {
            debug!(timestamp = %batch.timestamp, "store still failing, buffering batch");
            self.buffer(batch);
            return;
        }
        match self.write(&batch, cancel).await {
            Ok(()) => {}
            Err(RetryError::Permanent { source, .. }) => self.reject(&batch, &source),
            Err(e) => {
                self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
                warn!(timestamp = %batch.timestamp, attempts = e.attempts(), error = %e, "couldn't write batch, keeping it for retry");
                self.buffer(batch);
            }
        }
    }

    /// Retries buffered batches oldest first, stopping at the first retryable
    /// failure. Batches the store refuses are dropped on the way.
    async fn flush(&mut self, cancel: &CancellationToken) {
        while let Some(batch) = self.retry_buffer.front() {
            match self.write(batch, cancel).await {
                Ok(()) => {}
                Err(RetryError::Permanent { source, .. }) => self.reject(batch, &source),
                Err(e) => {
                    warn!(
                        buffered = self.retry_buffer.len(),
                        error = %e,
                        "retry of buffered batch failed"
                    );
                    return;
                }
            }
            self.retry_buffer.pop_front();
            self.stats
                .buffered
                .store(self.retry_buffer.len(), Ordering::Relaxed);
        }
    }

    fn reject(&self, batch: &Batch, error: &StorageError) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        error!(timestamp = %batch.timestamp, %error, "store refused batch, dropping it");
    }

    fn buffer(&mut self, batch: Batch) {
        if self.retry_buffer.len() >= self.capacity {
            if let Some(oldest) = self.retry_buffer.pop_front() {
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                error!(
                    dropped = %oldest.timestamp,
                    capacity = self.capacity,
                    "retry buffer full, dropping oldest batch"
                );
            }
        }
        self.retry_buffer.push_back(batch);
        self.stats
            .buffered
            .store(self.retry_buffer.len(), Ordering::Relaxed);
    }

    async fn write(
        &self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<StorageError>> {
        let points = batch_to_points(batch);
        let sink = &self.sink;
        let points = &points;
        self.retry
            .run(cancel, StorageError::is_retryable, move |attempt| async move {
                debug!(attempt, points = points.len(), "writing points");
                sink.write(points).await
            })
            .await?;
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        info!(timestamp = %batch.timestamp, points = points.len(), "batch written");
        Ok(())
    }

    /// Best effort flush of everything still pending, bounded by the grace period.
    async fn drain(&mut self, mut queue: Receiver<Batch>) {
        queue.close();
        while let Ok(batch) = queue.try_recv() {
            self.buffer(batch);
        }
        if self.retry_buffer.is_empty() {
            return;
        }
        info!(
            pending = self.retry_buffer.len(),
            grace = ?self.drain_grace,
            "flushing pending batches before shutdown"
        );

        // The shutdown token is already cancelled, retries here are bounded by
        // the grace period instead.
        let drain_token = CancellationToken::new();
        let _ = tokio::time::timeout(self.drain_grace, self.flush(&drain_token)).await;

        let lost = self.retry_buffer.len();
        if lost > 0 {
            self.stats
                .lost_on_shutdown
                .fetch_add(lost as u64, Ordering::Relaxed);
            warn!(lost, "shutting down with unwritten batches, they are lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::{DerivedSample, Fields, MeterRole, RawSample, ACTIVE_POWER};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Records written timestamps, fails while `down` is set and always
    /// refuses the batch at `refused`.
    #[derive(Default)]
    struct RecordingSink {
        down: AtomicBool,
        refused: Mutex<Option<DateTime<Utc>>>,
        written: Mutex<Vec<DateTime<Utc>>>,
        attempts: AtomicU64,
    }

    #[async_trait]
    impl TimeSeriesSink for RecordingSink {
        async fn write(&self, points: &[Point]) -> Result<(), StorageError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let refused = *self.refused.lock().unwrap();
            if refused.is_some() && points.first().map(|p| p.timestamp) == refused {
                return Err(StorageError::Rejected {
                    status: 400,
                    body: "field type conflict".to_string(),
                });
            }
            if self.down.load(Ordering::Relaxed) {
                return Err(StorageError::Server {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            if let Some(point) = points.first() {
                self.written.lock().unwrap().push(point.timestamp);
            }
            Ok(())
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            multiplier: 1.0,
            ceiling: Duration::from_secs(1),
            jitter: false,
        }
    }

    fn batch(minute: i64) -> Batch {
        let timestamp = DateTime::<Utc>::UNIX_EPOCH + TimeDelta::minutes(minute);
        Batch {
            timestamp,
            raw: vec![RawSample::ok(
                "mains",
                MeterRole::Grid,
                timestamp,
                Fields::from([(ACTIVE_POWER.to_string(), 100.0)]),
            )],
            derived: vec![],
            failed_meters: vec![],
        }
    }

    #[test]
    fn test_batch_to_points() {
        let mut b = batch(1);
        b.derived.push(DerivedSample {
            name: "consumption".to_string(),
            timestamp: b.timestamp,
            fields: Fields::from([(ACTIVE_POWER.to_string(), 650.0)]),
        });
        let points = batch_to_points(&b);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].measurement, METER_MEASUREMENT);
        assert_eq!(points[0].tags["meter"], "mains");
        assert_eq!(points[0].tags["role"], "grid");
        assert_eq!(points[1].measurement, DERIVED_MEASUREMENT);
        assert_eq!(points[1].tags["series"], "consumption");
        assert!(points.iter().all(|p| p.timestamp == b.timestamp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let mut writer = StorageWriter::new(sink.clone(), quick_retry(), 4, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        for minute in 0..3 {
            writer.accept(batch(minute), &cancel).await;
        }

        let written = sink.written.lock().unwrap().clone();
        assert_eq!(written, vec![batch(0).timestamp, batch(1).timestamp, batch(2).timestamp]);
        assert_eq!(writer.stats().written(), 3);
        assert_eq!(writer.stats().buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_buffers_then_recovers_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let mut writer = StorageWriter::new(sink.clone(), quick_retry(), 10, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        sink.down.store(true, Ordering::Relaxed);
        for minute in 0..3 {
            writer.accept(batch(minute), &cancel).await;
        }
        assert_eq!(writer.stats().buffered(), 3);
        assert_eq!(writer.stats().evicted(), 0);

        sink.down.store(false, Ordering::Relaxed);
        writer.accept(batch(3), &cancel).await;

        let written = sink.written.lock().unwrap().clone();
        let expected: Vec<_> = (0..4).map(|m| batch(m).timestamp).collect();
        assert_eq!(written, expected);
        assert_eq!(writer.stats().buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_batch_does_not_block_later_writes() {
        let sink = Arc::new(RecordingSink::default());
        *sink.refused.lock().unwrap() = Some(batch(0).timestamp);
        let mut writer = StorageWriter::new(sink.clone(), quick_retry(), 5, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        for minute in 0..5 {
            writer.accept(batch(minute), &cancel).await;
        }

        let stats = writer.stats();
        assert_eq!(stats.written(), 4);
        assert_eq!(stats.rejected(), 1);
        assert_eq!(stats.buffered(), 0);
        assert_eq!(stats.evicted(), 0);
        // Refused on the first try, never retried.
        assert_eq!(sink.attempts.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_batch_is_dropped_from_retry_buffer() {
        let sink = Arc::new(RecordingSink::default());
        let mut writer = StorageWriter::new(sink.clone(), quick_retry(), 5, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        sink.down.store(true, Ordering::Relaxed);
        writer.accept(batch(0), &cancel).await;
        writer.accept(batch(1), &cancel).await;
        assert_eq!(writer.stats().buffered(), 2);

        // The outage ends but the store now refuses the oldest batch.
        sink.down.store(false, Ordering::Relaxed);
        *sink.refused.lock().unwrap() = Some(batch(0).timestamp);
        writer.accept(batch(2), &cancel).await;

        let written = sink.written.lock().unwrap().clone();
        assert_eq!(written, vec![batch(1).timestamp, batch(2).timestamp]);
        assert_eq!(writer.stats().rejected(), 1);
        assert_eq!(writer.stats().buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_evicts_exactly_one_oldest() {
        let sink = Arc::new(RecordingSink::default());
        let mut writer = StorageWriter::new(sink.clone(), quick_retry(), 3, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        sink.down.store(true, Ordering::Relaxed);

        for minute in 0..3 {
            writer.accept(batch(minute), &cancel).await;
        }
        assert_eq!(writer.stats().evicted(), 0);

        for (extra, minute) in (3..6).enumerate() {
            writer.accept(batch(minute), &cancel).await;
            assert_eq!(writer.stats().evicted(), extra as u64 + 1);
            assert_eq!(writer.stats().buffered(), 3);
        }

        let buffered: Vec<_> = writer.retry_buffer.iter().map(|b| b.timestamp).collect();
        let expected: Vec<_> = (3..6).map(|m| batch(m).timestamp).collect();
        assert_eq!(buffered, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_on_cancel() {
        let sink = Arc::new(RecordingSink::default());
        let writer = StorageWriter::new(sink.clone(), quick_retry(), 8, Duration::from_secs(1));
        let stats = writer.stats();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        for minute in 0..3 {
            tx.send(batch(minute)).await.unwrap();
        }

        writer.run(rx, cancel).await;

        assert_eq!(stats.written(), 3);
        assert_eq!(stats.lost_on_shutdown(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_outage_reports_loss_within_grace() {
        let sink = Arc::new(RecordingSink::default());
        sink.down.store(true, Ordering::Relaxed);
        let writer = StorageWriter::new(sink.clone(), quick_retry(), 8, Duration::from_secs(3));
        let stats = writer.stats();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(writer.run(rx, cancel.clone()));
        tx.send(batch(0)).await.unwrap();
        tx.send(batch(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let started = tokio::time::Instant::now();
        cancel.cancel();
        handle.await.unwrap();

        assert!(started.elapsed() <= Duration::from_secs(3));
        assert_eq!(stats.written(), 0);
        assert_eq!(stats.lost_on_shutdown(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_producer_gone() {
        let sink = Arc::new(RecordingSink::default());
        let writer = StorageWriter::new(sink.clone(), quick_retry(), 8, Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(8);
        tx.send(batch(0)).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), writer.run(rx, CancellationToken::new()))
            .await
            .expect("writer should stop once the queue is closed");
        assert_eq!(sink.written.lock().unwrap().len(), 1);
    }
}
