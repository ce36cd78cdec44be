use super::{boot, fail, load, print_json, runtime};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

pub fn cmd_cache_stats(config: Option<PathBuf>) {
    let config = load(config.as_deref());
    runtime().block_on(async {
        let kernel = boot(config, true).await;
        print_json(&kernel.cache_stats());
        kernel.shutdown().await;
    });
}

pub fn cmd_cache_cleanup(config: Option<PathBuf>, days: u32) {
    let config = load(config.as_deref());
    runtime().block_on(async {
        let kernel = boot(config, false).await;
        let max_age = Duration::from_secs(u64::from(days) * 86_400);
        let removed = kernel.cache_cleanup(max_age).await;
        kernel.shutdown().await;
        match removed {
            Ok(removed) => print_json(&json!({ "removed": removed, "max_age_days": days })),
            Err(e) => fail(e),
        }
    });
}

pub fn cmd_cache_warm(config: Option<PathBuf>, mut queries: Vec<String>, file: Option<PathBuf>) {
    if let Some(path) = file {
        let contents = std::fs::read_to_string(&path)
            .unwrap_or_else(|e| fail(format!("cannot read {}: {e}", path.display())));
        queries.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }
    if queries.is_empty() {
        fail("no queries to warm");
    }
    let config = load(config.as_deref());
    runtime().block_on(async {
        let kernel = boot(config, true).await;
        let warmed = kernel.warm(&queries).await;
        kernel.shutdown().await;
        match warmed {
            Ok(cached) => print_json(&json!({ "requested": queries.len(), "cached": cached })),
            Err(e) => fail(e),
        }
    });
}
