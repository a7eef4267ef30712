use crate::aggregator::Aggregator;
use crate::config::{MeterConfig, PipelineConfig};
use crate::eastron_sdm::RegisterSet;
use crate::influxdb::TimeSeriesSink;
use crate::meter_client::{MeterClient, RegisterReader};
use crate::publisher::{PubSubBus, Publisher};
use crate::samples::{Batch, ACTIVE_POWER};
use crate::scheduler::{next_boundary, Scheduler, TickOutcome};
use crate::shutdown::ShutdownCoordinator;
use crate::storage_writer::{StorageStats, StorageWriter};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Energy-only reads between full polls.
struct QuickReads {
    interval: Duration,
    meters: Vec<MeterConfig>,
}

/// The polling loop: tick, read every meter, aggregate, hand the batch on.
pub struct Poller {
    scheduler: Scheduler,
    poll_interval: Duration,
    quick: Option<QuickReads>,
    client: MeterClient,
    aggregator: Aggregator,
    meters: Vec<MeterConfig>,
    storage_queue: mpsc::Sender<Batch>,
    latest: watch::Sender<Option<Arc<Batch>>>,
}

impl Poller {
    pub fn new(
        poll_interval: Duration,
        client: MeterClient,
        aggregator: Aggregator,
        meters: Vec<MeterConfig>,
        storage_queue: mpsc::Sender<Batch>,
        latest: watch::Sender<Option<Arc<Batch>>>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(poll_interval),
            poll_interval,
            quick: None,
            client,
            aggregator,
            meters,
            storage_queue,
            latest,
        }
    }

    /// Ticks every `interval` and reads only the energy registers on the ticks
    /// that are not a multiple of the poll interval. Those batches refresh the
    /// snapshot and are never stored.
    pub fn with_quick_reads(mut self, interval: Duration) -> Self {
        let meters = self
            .meters
            .iter()
            .cloned()
            .map(|mut meter| {
                meter.registers = RegisterSet::Energy;
                meter
            })
            .collect();
        self.scheduler = Scheduler::new(interval);
        self.quick = Some(QuickReads { interval, meters });
        self
    }

    fn is_full_tick(&self, tick: DateTime<Utc>) -> bool {
        let poll_ms = (self.poll_interval.as_millis() as i64).max(1);
        self.quick.is_none() || tick.timestamp_millis().rem_euclid(poll_ms) == 0
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            meters = self.meters.len(),
            quick_reads = self.quick.is_some(),
            "starting poller"
        );
        loop {
            let tick = match self.scheduler.next_tick(&cancel).await {
                TickOutcome::Tick(tick) => tick,
                TickOutcome::Cancelled => break,
            };
            if !self.is_full_tick(tick) {
                self.quick_read(tick, &cancel).await;
                continue;
            }
            debug!(%tick, "tick");

            let samples = self.client.read_all(&self.meters, tick, &cancel).await;
            let batch = self.aggregator.aggregate(tick, samples);
            log_batch(&batch);

            // Overwrite the snapshot first, the publisher never waits on storage.
            self.latest.send_replace(Some(Arc::new(batch.clone())));

            // Blocks while the storage queue is full.
            tokio::select! {
                biased;
                sent = self.storage_queue.send(batch) => {
                    if sent.is_err() {
                        if !cancel.is_cancelled() {
                            error!("storage writer is gone, stopping");
                            cancel.cancel();
                        }
                        break;
                    }
                }
                _ = cancel.cancelled() => {
                    warn!(%tick, "shutdown while waiting for the storage queue, batch dropped");
                    break;
                }
            }
        }
        info!("poller exiting");
    }

    /// Refreshes the snapshot from the energy registers. Cut off at the next
    /// tick so a slow bus never delays a full poll.
    async fn quick_read(&mut self, tick: DateTime<Utc>, cancel: &CancellationToken) {
        let Some(quick) = &self.quick else {
            return;
        };
        let next = next_boundary(tick, quick.interval, Some(tick));
        let budget = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(%tick, "quick tick");

        match timeout(budget, self.client.read_all(&quick.meters, tick, cancel)).await {
            Ok(samples) => {
                let batch = self.aggregator.aggregate(tick, samples);
                self.latest.send_replace(Some(Arc::new(batch)));
            }
            Err(_) => warn!(%tick, "quick read did not finish before the next tick"),
        }
    }
}

fn log_batch(batch: &Batch) {
    let summary: Vec<String> = batch
        .raw
        .iter()
        .map(|s| (s.meter.as_str(), s.field(ACTIVE_POWER)))
        .chain(
            batch
                .derived
                .iter()
                .map(|s| (s.name.as_str(), s.fields.get(ACTIVE_POWER).copied())),
        )
        .filter_map(|(name, power)| power.map(|p| format!("{name}: {p:.0} W")))
        .collect();
    info!(
        timestamp = %batch.timestamp,
        failed = ?batch.failed_meters,
        "{}",
        summary.join(", ")
    );
}

/// Handles to observe a started pipeline.
pub struct RunningPipeline {
    pub storage_stats: Arc<StorageStats>,
    pub latest: watch::Receiver<Option<Arc<Batch>>>,
}

/// Spawns the poller, the storage writer and, with a bus, the publisher. Every
/// worker is registered with `coordinator`.
pub fn start(
    config: PipelineConfig,
    reader: Box<dyn RegisterReader>,
    sink: Arc<dyn TimeSeriesSink>,
    bus: Option<Arc<dyn PubSubBus>>,
    coordinator: &mut ShutdownCoordinator,
) -> RunningPipeline {
    let (storage_tx, storage_rx) = mpsc::channel(config.queue_depth);
    let (latest_tx, latest_rx) = watch::channel(None);

    let writer = StorageWriter::new(
        sink,
        config.storage_retry,
        config.retry_buffer_capacity,
        config.drain_grace,
    );
    let storage_stats = writer.stats();
    coordinator.register(
        "storage",
        tokio::spawn(writer.run(storage_rx, coordinator.token())),
    );

    if let (Some(bus), Some(publisher)) = (bus, &config.publisher) {
        let publisher = Publisher::new(bus, publisher.topic_prefix.clone(), publisher.interval);
        coordinator.register(
            "publisher",
            tokio::spawn(publisher.run(latest_rx.clone(), coordinator.token())),
        );
    }

    let mut poller = Poller::new(
        config.poll_interval,
        MeterClient::new(reader, config.meter_retry, config.inter_read_gap),
        Aggregator::new(config.rules.clone()),
        config.meters,
        storage_tx,
        latest_tx,
    );
    if let Some(interval) = config.quick_interval {
        poller = poller.with_quick_reads(interval);
    }
    coordinator.register("poller", tokio::spawn(poller.run(coordinator.token())));

    RunningPipeline {
        storage_stats,
        latest: latest_rx,
    }
}
