use super::bus::{MessageBus, RetrySweep};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

/// Start the dispatcher, retrier and reaper for `bus`.
pub(crate) fn spawn_all(bus: &MessageBus) -> Vec<JoinHandle<()>> {
    vec![
        spawn_worker("dispatcher", bus, run_dispatcher),
        spawn_worker("retrier", bus, run_retrier),
        spawn_worker("reaper", bus, run_reaper),
    ]
}

fn spawn_worker<F, Fut>(name: &'static str, bus: &MessageBus, run: F) -> JoinHandle<()>
where
    F: FnOnce(MessageBus, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let worker = run(bus.clone(), bus.shutdown_token());
    tokio::spawn(async move {
        tracing::debug!("Bus worker '{name}' started");
        worker.await;
        tracing::info!("Bus worker '{name}' stopped");
    })
}

/// Sleep for `pause` unless shutdown arrives first. Returns `false` on shutdown.
async fn pause_or_shutdown(shutdown: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = time::sleep(pause) => true,
    }
}

async fn run_dispatcher(bus: MessageBus, shutdown: CancellationToken) {
    let interval = Duration::from_millis(bus.worker_config().dispatch_interval_ms.max(1));
    let backoff = Duration::from_millis(bus.worker_config().dispatch_error_backoff_ms);

    while !shutdown.is_cancelled() {
        let sweep = bus.dispatch_once().await;
        if sweep.processed > 0 {
            tracing::debug!(
                "Dispatch sweep processed {} messages across {} agents",
                sweep.processed,
                sweep.agents
            );
        }

        // Every agent failing usually means the store is down.
        let pause = if sweep.agents > 0 && sweep.failed_agents == sweep.agents {
            tracing::warn!("Dispatch sweep failed for all agents; backing off");
            backoff.max(interval)
        } else {
            interval
        };
        if !pause_or_shutdown(&shutdown, pause).await {
            break;
        }
    }
}

async fn run_retrier(bus: MessageBus, shutdown: CancellationToken) {
    let mut interval = time::interval(Duration::from_secs(
        bus.worker_config().retry_interval_secs.max(1),
    ));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let sweep = bus.retry_failed_once().await;
        if sweep != RetrySweep::default() {
            tracing::debug!(
                requeued = sweep.requeued,
                redelivery_failed = sweep.redelivery_failed,
                dead_lettered = sweep.dead_lettered,
                dead_letter_failed = sweep.dead_letter_failed,
                expired = sweep.expired,
                "Retry sweep finished"
            );
        }
    }
}

async fn run_reaper(bus: MessageBus, shutdown: CancellationToken) {
    let mut interval = time::interval(Duration::from_secs(
        bus.worker_config().reap_interval_secs.max(1),
    ));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing can have expired yet.
    interval.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        bus.reap_expired_once();
    }
}
