use chrono::Utc;
use ordo_order::{RecoveryRelay, RecoveryReport};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Periodically finish or release cancellation attempts left behind by a crash.
pub async fn start_recovery_worker(relay: RecoveryRelay, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Recovery worker started, scanning every {:?}", every);

    loop {
        ticker.tick().await;
        match relay.run_once(Utc::now()).await {
            Ok(report) if report != RecoveryReport::default() => {
                info!(
                    completed = report.completed,
                    abandoned = report.abandoned,
                    escalated = report.escalated,
                    failed = report.failed,
                    "Recovery pass finished"
                );
            }
            Ok(_) => {}
            Err(e) => error!("Recovery pass failed: {}", e),
        }
    }
}
