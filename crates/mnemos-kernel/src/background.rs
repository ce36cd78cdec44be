//! Background maintenance loops: index rebuild, disk-cache cleanup and
//! query-cache eviction.
//!
//! Every loop sleeps for its interval and exits when the kernel's shutdown
//! signal fires.

use crate::kernel::RecallKernel;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn one loop per non-zero interval in `[maintenance]`.
pub fn spawn_maintenance(
    kernel: Arc<RecallKernel>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let m = kernel.config().maintenance.clone();
    let mut handles = Vec::new();

    if m.index_rebuild_interval_secs > 0 {
        let k = Arc::clone(&kernel);
        handles.push(spawn_loop(
            "index-rebuild",
            Duration::from_secs(m.index_rebuild_interval_secs),
            shutdown.clone(),
            move || {
                let k = Arc::clone(&k);
                async move {
                    let cfg = &k.config().index;
                    match k.rebuild_index(cfg.kind, cfg.build_window_days).await {
                        Ok(stats) => info!(
                            count = stats.map(|s| s.count).unwrap_or(0),
                            "Scheduled index rebuild complete"
                        ),
                        Err(e) => warn!(error = %e, "Scheduled index rebuild failed"),
                    }
                }
            },
        ));
    }

    if m.cache_cleanup_interval_secs > 0 {
        let k = Arc::clone(&kernel);
        let max_age = Duration::from_secs(u64::from(k.config().cache.disk_max_age_days) * 86_400);
        handles.push(spawn_loop(
            "cache-cleanup",
            Duration::from_secs(m.cache_cleanup_interval_secs),
            shutdown.clone(),
            move || {
                let k = Arc::clone(&k);
                async move {
                    match k.cache_cleanup(max_age).await {
                        Ok(removed) => info!(removed, "Scheduled cache cleanup complete"),
                        Err(e) => debug!(error = %e, "Scheduled cache cleanup skipped"),
                    }
                }
            },
        ));
    }

    if m.query_cache_sweep_secs > 0 {
        let k = Arc::clone(&kernel);
        handles.push(spawn_loop(
            "query-cache-sweep",
            Duration::from_secs(m.query_cache_sweep_secs),
            shutdown,
            move || {
                let k = Arc::clone(&k);
                async move {
                    k.query_cache().evict_expired();
                }
            },
        ));
    }

    info!(loops = handles.len(), "Background maintenance started");
    handles
}

/// Run `tick` every `interval` until `shutdown` flips.
pub fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!(task = name, "Maintenance loop: shutdown signal received");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            debug!(task = name, "Maintenance tick");
            tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_loop_ticks_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_loop("test", Duration::from_millis(10), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {seen} ticks");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
