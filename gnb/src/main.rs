//! Albor Space multi-carrier MAC scheduler
//!
//! Runs the slot loop against a simulated PHY, optionally publishing slot
//! results and taking feedback over ZMQ.

mod config;
mod sim;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::types::SlotIndex;
use config::SchedConfig;
use interfaces::slot_publisher::{PublisherConfig, SlotPublisher};
use layers::mac::{
    BlerFeedback, MacScheduler, MetricsSnapshot, PhyInbox, SchedError, SchedulerMetrics,
    ShutdownHandle, SlotOutcome, UeConfig,
};
use sim::TrafficModel;

/// Albor Space MAC slot scheduler
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (.yml or .toml)
    #[arg(short, long, default_value = "sched.yml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Stop after this many slots
    #[arg(long)]
    slots: Option<u64>,

    /// ZMQ endpoint for slot results (e.g. "tcp://*:2100")
    #[arg(long)]
    publish: Option<String>,

    /// Run slots back to back instead of at the air-interface rate
    #[arg(long)]
    no_realtime: bool,
}

/// Air-interface slot pacing
struct SlotClock {
    period: Duration,
    due: Instant,
}

impl SlotClock {
    fn new(period: Duration, start: Instant) -> Self {
        Self { period, due: start }
    }

    /// Advance one slot; returns how long to wait at `now` for it to start
    fn tick(&mut self, now: Instant) -> Duration {
        self.due += self.period;
        self.due.saturating_duration_since(now)
    }
}

/// Everything the slot loop thread owns
struct SlotLoop {
    scheduler: MacScheduler,
    inbox: PhyInbox,
    traffic: TrafficModel,
    ues: Vec<UeConfig>,
    publisher: Option<SlotPublisher>,
    nof_slots: Option<u64>,
    slot_period: Option<Duration>,
}

impl SlotLoop {
    fn run(mut self) -> Result<u64> {
        let mut clock = self.slot_period.map(|period| SlotClock::new(period, Instant::now()));
        let mut slot = SlotIndex(0);

        loop {
            if self.nof_slots.is_some_and(|n| slot.value() >= n) {
                break;
            }

            for event in self.traffic.next_reports(&self.ues) {
                self.inbox.send(event)?;
            }
            if let Some(publisher) = self.publisher.as_mut() {
                for event in publisher.poll_events()? {
                    self.inbox.send(event)?;
                }
            }

            let outcome = match self.scheduler.run_slot(slot) {
                Ok(outcome) => outcome,
                Err(SchedError::ShutDown) => break,
                Err(e) => return Err(e.into()),
            };
            if let Some(publisher) = self.publisher.as_mut() {
                publisher.publish(&outcome)?;
            }
            match outcome {
                SlotOutcome::Published(published) => self.scheduler.recycle(published),
                SlotOutcome::Void { .. } => break,
            }

            slot = slot.next();
            if let Some(clock) = clock.as_mut() {
                let wait = clock.tick(Instant::now());
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
            }
        }

        if let Some(publisher) = self.publisher.as_mut() {
            info!("Publisher statistics: {:?}", publisher.stats());
            publisher.shutdown();
        }
        Ok(slot.value())
    }
}

fn log_metrics(snapshot: &MetricsSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(json) => info!("Scheduler metrics: {}", json),
        Err(e) => warn!("Cannot serialize metrics: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = SchedConfig::from_file(&args.config)?;

    // Initialize logging
    let level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space MAC scheduler");
    info!("Configuration file: {}", args.config.display());

    let cells = config.cell_registry()?;
    let slot_period = cells.min_slot_duration();
    let traffic = &config.traffic;
    let feedback = BlerFeedback::new(traffic.dl_bler, traffic.ul_bler, traffic.seed);
    let mut scheduler = MacScheduler::new(cells, config.scheduler_args())?
        .with_feedback_generator(Box::new(feedback));

    let ues = config.ue_configs();
    for ue in &ues {
        let insert = scheduler.add_ue(ue.clone());
        info!("UE {} on {} carriers: {:?}", ue.rnti, ue.carriers.len(), insert.status);
    }

    let publisher = match args.publish.clone().or_else(|| config.scheduler.publish_addr.clone()) {
        Some(address) => {
            let mut publisher_config = PublisherConfig::new(address);
            if let Some(feedback) = &config.scheduler.feedback_addr {
                publisher_config = publisher_config.with_feedback(feedback.clone());
            }
            let mut publisher = SlotPublisher::new(publisher_config)?;
            publisher.initialize()?;
            Some(publisher)
        }
        None => None,
    };

    let realtime = config.scheduler.realtime && !args.no_realtime;
    let metrics: Arc<SchedulerMetrics> = scheduler.metrics();
    let shutdown: ShutdownHandle = scheduler.shutdown_handle();
    let slot_loop = SlotLoop {
        inbox: scheduler.phy_inbox(),
        scheduler,
        traffic: TrafficModel::new(&config.traffic),
        ues,
        publisher,
        nof_slots: args.slots.or(config.scheduler.nof_slots),
        slot_period: realtime.then_some(slot_period),
    };

    info!("Scheduler initialized successfully (realtime={})", realtime);

    // The slot loop is CPU-bound and owns the carrier worker pool
    let mut slot_handle = tokio::task::spawn_blocking(move || slot_loop.run());

    // Start statistics reporting
    let stats_handle = {
        let metrics = metrics.clone();
        let period = Duration::from_secs(config.log.stats_interval_s.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                log_metrics(&metrics.snapshot());
            }
        })
    };

    // Wait for shutdown signal or the slot budget to run out
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.shutdown();
            slot_handle.await
        }
        result = &mut slot_handle => result,
    };

    stats_handle.abort();
    match finished {
        Ok(Ok(slots)) => info!("Slot loop finished after {} slots", slots),
        Ok(Err(e)) => error!("Slot loop failed: {}", e),
        Err(e) => error!("Slot loop panicked: {}", e),
    }

    log_metrics(&metrics.snapshot());
    info!("Scheduler shutdown complete");
    Ok(())
}
