use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};
use warden_app::logging::initialize_logging;
use warden_core::runtime::{
    ExitReason, GenericServer, LifeCycle, RestartReport, RestartStrategy, SupervisorConfig, SupervisorFactory,
    WorkerSpec,
};
use warden_error::{generic_error, GenericError};

#[tokio::main]
async fn main() -> Result<(), GenericError> {
    initialize_logging(None)?;

    // The telemetry supervisor restarts all of its workers together, and allows one restart every 5 seconds. The
    // collector is made to fail every 3 seconds, so every second failure exceeds that limit: the telemetry supervisor
    // then shuts down its workers, in reverse order, and fails itself.
    let telemetry_sup = SupervisorConfig::new("telemetry-sup", RestartStrategy::all_for_one(1, Duration::from_secs(5)))
        .with_child(WorkerSpec::new("telemetry-collector", || Collector { collected: 0 }, 10))
        .with_child(
            WorkerSpec::new("telemetry-flusher", || Flusher { drain: Duration::ZERO }, Duration::from_secs(2))
                .with_lifecycle(LifeCycle::permanent().with_shutdown_timeout(Duration::from_secs(5))),
        )
        .with_post_restart(log_restart);

    // The root supervisor sees the telemetry supervisor failing roughly every 6 seconds, which stays within its own
    // limit of one restart every 5 seconds, so it keeps restarting it until shutdown.
    let root_sup = SupervisorConfig::new("root-sup", RestartStrategy::one_for_one(1, Duration::from_secs(5)))
        .with_child(WorkerSpec::new("root-long-running", || Heartbeat { beats: 0 }, ()))
        .with_child(telemetry_sup)
        .with_post_restart(log_restart);

    let supervisor = SupervisorFactory::new(root_sup).new_instance()?;

    // Drive the workers from the outside: collect regularly, and inject a failure every 3 seconds.
    let driver = supervisor.clone();
    tokio::spawn(async move {
        let mut ticks = 0u64;
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            ticks += 1;

            if let Some(heartbeat) = driver.server::<Heartbeat>("root-long-running") {
                if let Ok(Some(beats)) = heartbeat.call_timeout((), Duration::from_millis(100)).await {
                    info!(beats, "Heartbeat answered.");
                }
            }

            let Some(collector) = driver
                .child_supervisor("telemetry-sup")
                .and_then(|sup| sup.server::<Collector>("telemetry-collector"))
            else {
                continue;
            };

            let message = if ticks % 3 == 0 {
                CollectorMessage::Fail
            } else {
                CollectorMessage::Collect
            };
            let _ = collector.cast(message);
        }
    });

    let shutdown_delay = Duration::from_secs(30);
    info!("Running for {:?} before shutting down...", shutdown_delay);

    match supervisor.run_with_shutdown(tokio::time::sleep(shutdown_delay)).await {
        Ok(()) => info!("Supervisor completed successfully."),
        Err(e) => error!("Supervisor failed: {}", e),
    }

    Ok(())
}

fn log_restart(report: &RestartReport) {
    info!(
        supervisor_id = %report.supervisor_id,
        failed_child = %report.failed_child,
        restarted = ?report.restarted,
        "Restart completed."
    );
}

struct Heartbeat {
    beats: u64,
}

#[async_trait]
impl GenericServer for Heartbeat {
    type Message = ();
    type Reply = u64;
    type Config = ();

    async fn handle(&mut self, _: ()) -> Result<Option<u64>, GenericError> {
        self.beats += 1;
        Ok(Some(self.beats))
    }
}

enum CollectorMessage {
    Collect,
    Fail,
}

struct Collector {
    collected: usize,
}

#[async_trait]
impl GenericServer for Collector {
    type Message = CollectorMessage;
    type Reply = ();

    /// Samples collected per tick.
    type Config = usize;

    async fn init(&mut self, batch_size: usize) -> Result<(), GenericError> {
        info!(batch_size, "Collector started.");
        Ok(())
    }

    async fn handle(&mut self, message: CollectorMessage) -> Result<Option<()>, GenericError> {
        match message {
            CollectorMessage::Collect => {
                self.collected += 1;
                Ok(None)
            }
            CollectorMessage::Fail => Err(generic_error!(
                "collector lost its source after {} collections",
                self.collected
            )),
        }
    }

    async fn shutdown(&mut self, reason: &ExitReason) {
        info!(?reason, collected = self.collected, "Collector shutting down.");
    }
}

struct Flusher {
    drain: Duration,
}

#[async_trait]
impl GenericServer for Flusher {
    type Message = ();
    type Reply = ();

    /// Time spent flushing on shutdown.
    type Config = Duration;

    async fn init(&mut self, drain: Duration) -> Result<(), GenericError> {
        self.drain = drain;
        info!("Flusher started.");
        Ok(())
    }

    async fn handle(&mut self, _: ()) -> Result<Option<()>, GenericError> {
        Ok(None)
    }

    async fn shutdown(&mut self, _: &ExitReason) {
        info!("Flusher draining before shutdown...");
        tokio::time::sleep(self.drain).await;
        info!("Flusher shut down.");
    }
}
