//! Scheduler module for running check invocations on an interval.

use crate::config::CheckConfig;
use crate::probe::{CheckOutcome, TinyproxyCheck};
use crate::report::MetricSink;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Upper bound on the random delay before an instance's first invocation.
const MAX_START_JITTER: Duration = Duration::from_millis(500);

/// Drives one independent check loop per configured instance.
pub struct Scheduler {
    check: Arc<TinyproxyCheck>,
    sink: Arc<dyn MetricSink>,
    interval: Duration,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(check: TinyproxyCheck, sink: Arc<dyn MetricSink>, interval: Duration) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            check: Arc::new(check),
            sink,
            interval,
            stop_tx,
        }
    }

    /// Run every instance a single time, one after another.
    pub async fn run_once(&self, instances: &[CheckConfig]) -> Vec<CheckOutcome> {
        let mut outcomes = Vec::with_capacity(instances.len());
        for config in instances {
            let outcome = self.check.run(config, self.sink.as_ref()).await;
            log_outcome(config, &outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Start a check loop for each instance. Loops run until [`Scheduler::stop`].
    pub fn start(&self, instances: Vec<CheckConfig>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting scheduler with {} instances every {:?}",
            instances.len(),
            self.interval
        );

        instances
            .into_iter()
            .map(|config| {
                let check = self.check.clone();
                let sink = self.sink.clone();
                let stop_rx = self.stop_tx.subscribe();
                let interval = self.interval;
                tokio::spawn(run_check_loop(check, sink, config, interval, stop_rx))
            })
            .collect()
    }

    /// Signal every running loop to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Run the check loop for a single instance.
async fn run_check_loop(
    check: Arc<TinyproxyCheck>,
    sink: Arc<dyn MetricSink>,
    config: CheckConfig,
    interval_duration: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // Spread instances out so they don't all fire on the same tick
    let jitter_ms = MAX_START_JITTER.min(interval_duration).as_millis() as u64;
    if jitter_ms > 0 {
        let delay = Duration::from_millis(rand::random::<u64>() % jitter_ms);
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // A run that overruns the interval swallows the ticks it missed
    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                // Awaited inline so a stop never cuts a cycle short
                let outcome = check.run(&config, sink.as_ref()).await;
                log_outcome(&config, &outcome);
            }
        }
    }
}

fn log_outcome(config: &CheckConfig, outcome: &CheckOutcome) {
    match outcome {
        CheckOutcome::Ok => tracing::debug!("Check for {} succeeded", config.target_url()),
        CheckOutcome::Critical(title) => {
            tracing::debug!("Check for {} reported CRITICAL ({})", config.target_url(), title)
        }
    }
}
