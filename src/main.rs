use anyhow::Context;
use clap::Parser;
use meter_logger::config::{Args, PipelineConfig};
use meter_logger::influxdb::{DiscardSink, InfluxDbClient, TimeSeriesSink};
use meter_logger::meter_client::ModbusReader;
use meter_logger::pipeline;
use meter_logger::publisher::{MqttBus, PubSubBus};
use meter_logger::shutdown::ShutdownCoordinator;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    info!("Starting meter logger {}", env!("CARGO_PKG_VERSION"));
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    // -D wins over RUST_LOG
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = PipelineConfig::from_args(&args).context("invalid configuration")?;
    for meter in &config.meters {
        info!(meter = %meter.name, role = %meter.role, unit = meter.unit, "meter configured");
    }

    let reader = ModbusReader::connect(config.field_bus.clone(), config.request_timeout)
        .await
        .context("couldn't open the field bus")?;

    let sink: Arc<dyn TimeSeriesSink> = match &config.storage {
        Some(storage) => {
            let client = InfluxDbClient::new(storage.clone())?;
            client
                .ping()
                .await
                .with_context(|| format!("InfluxDB at {} not reachable", storage.url))?;
            Arc::new(client)
        }
        None => {
            warn!("no InfluxDB url given, batches will not be stored");
            Arc::new(DiscardSink)
        }
    };

    let mut coordinator = ShutdownCoordinator::new(config.shutdown_timeout);
    let bus: Option<Arc<dyn PubSubBus>> = match &config.publisher {
        Some(publisher) => {
            let (bus, event_loop) = MqttBus::connect(publisher, coordinator.token())
                .await
                .with_context(|| format!("couldn't connect to MQTT broker {}", publisher.host))?;
            coordinator.register("mqtt", event_loop);
            Some(Arc::new(bus))
        }
        None => None,
    };

    let running = pipeline::start(config, Box::new(reader), sink, bus, &mut coordinator);

    coordinator.wait_for_signal().await;
    let report = coordinator.shutdown().await;

    let stats = running.storage_stats;
    info!(
        written = stats.written(),
        failed_writes = stats.failed_writes(),
        rejected = stats.rejected(),
        evicted = stats.evicted(),
        lost_on_shutdown = stats.lost_on_shutdown(),
        "storage summary"
    );
    if !report.is_clean() {
        warn!(
            panicked = ?report.panicked,
            timed_out = ?report.timed_out,
            "not every worker stopped cleanly"
        );
    }
    Ok(())
}
