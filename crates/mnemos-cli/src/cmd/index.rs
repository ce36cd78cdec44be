use super::{boot, fail, load, print_json, runtime};
use mnemos_types::config::IndexKind;
use serde_json::json;
use std::path::PathBuf;

pub fn cmd_index_build(config: Option<PathBuf>, kind: &str, days: u32) {
    let kind: IndexKind = kind.parse().unwrap_or_else(|e| fail(e));
    let config = load(config.as_deref());
    runtime().block_on(async {
        let kernel = boot(config, false).await;
        let built = kernel.rebuild_index(kind, days).await;
        kernel.shutdown().await;
        match built {
            Ok(Some(stats)) => print_json(&stats),
            Ok(None) => print_json(&json!({ "count": 0, "message": "no stored embeddings" })),
            Err(e) => fail(e),
        }
    });
}

pub fn cmd_index_stats(config: Option<PathBuf>) {
    let config = load(config.as_deref());
    runtime().block_on(async {
        let kernel = boot(config, false).await;
        match kernel.index_stats() {
            Some(stats) => print_json(&stats),
            None => print_json(&json!({ "count": 0 })),
        }
        kernel.shutdown().await;
    });
}

pub fn cmd_index_backfill(config: Option<PathBuf>, limit: usize) {
    let config = load(config.as_deref());
    runtime().block_on(async {
        let kernel = boot(config, true).await;
        let report = kernel.backfill(limit).await;
        kernel.shutdown().await;
        match report {
            Ok(report) => print_json(&report),
            Err(e) => fail(e),
        }
    });
}
