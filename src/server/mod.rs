pub mod api;

use crate::cli::Args;
use crate::history::ChatHistory;
use log::{ debug, error, info };
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct Server {
    addr: String,
    history: Arc<ChatHistory>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, history: Arc<ChatHistory>, args: Args) -> Self {
        Self { addr, history, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let schedule = schedule_cleanup(self.history.clone(), self.args.cleanup_interval).await;

        let result = api::start_http_server(
            &self.addr,
            self.history.clone(),
            self.args.clone()
        ).await;

        if let Some(handle) = schedule {
            handle.abort();
        }
        result
    }
}

async fn sweep(history: &ChatHistory) {
    match history.cleanup_expired().await {
        Ok(report) => debug!("Cleanup sweep: {} scanned, {} removed", report.scanned, report.removed),
        Err(e) => error!("Cleanup sweep failed: {}", e),
    }
}

/// Startup hook for the guest-history sweep. With a zero interval the sweep
/// runs once, inline; otherwise a timer task runs it now and then every
/// `interval_secs`.
pub async fn schedule_cleanup(
    history: Arc<ChatHistory>,
    interval_secs: u64
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        info!("Scheduled cleanup disabled; running a single sweep at startup.");
        sweep(&history).await;
        return None;
    }

    info!("Scheduling guest history cleanup every {}s", interval_secs);
    Some(
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweep(&history).await;
            }
        })
    )
}
