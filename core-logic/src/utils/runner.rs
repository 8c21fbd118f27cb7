use crate::config::JobRequest;
use crate::dispatcher::{Dispatcher, RunReport};
use crate::error::DispatchError;
use crate::traits::ProgressSink;
use tokio::signal;
use tracing::{error, info};

/// Runs a dispatcher in the foreground with Ctrl+C wired to its
/// cancellation token.
pub struct JobRunner;

impl JobRunner {
    pub async fn run(
        dispatcher: &Dispatcher,
        job: &JobRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, DispatchError> {
        let token = dispatcher.cancellation_token();
        let watcher_token = token.clone();

        let watcher = tokio::spawn(async move {
            tokio::select! {
                res = signal::ctrl_c() => match res {
                    Ok(()) => {
                        info!("🛑 Received Ctrl+C. Finishing the in-flight request and stopping...");
                        watcher_token.cancel();
                    }
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                },
                _ = watcher_token.cancelled() => {}
            }
        });

        let start_time = std::time::Instant::now();
        let result = dispatcher.run(job, sink).await;
        watcher.abort();

        let stats = match &result {
            Ok(report) => &report.stats,
            Err(e) => &e.partial,
        };
        info!(
            "🛑 Shutdown Complete. Total Time: {:.1}s | Success: {} | Failed: {} | Cancelled: {} | Success Rate: {:.2}%",
            start_time.elapsed().as_secs_f64(),
            stats.succeeded,
            stats.failed,
            stats.cancelled,
            stats.success_rate()
        );

        result
    }
}
