use super::{boot, fail, load, print_json, runtime};
use mnemos_runtime::{EmbeddingMode, RecallRequest};
use mnemos_types::affect::AffectVector;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RecallArgs {
    pub query: String,
    pub affect: Option<String>,
    pub fts_only: bool,
    pub max_results: Option<usize>,
    pub deadline_ms: Option<u64>,
}

/// `--affect` JSON: an object of numeric dimensions. Non-numeric values are
/// dropped; anything else is ignored with a warning.
pub(crate) fn parse_affect(raw: &str) -> Option<AffectVector> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Ignoring invalid --affect JSON");
            return None;
        }
    };
    let Some(map) = value.as_object() else {
        warn!("Ignoring --affect: expected a JSON object");
        return None;
    };
    let affect: AffectVector = map
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f as f32)))
        .collect();
    (!affect.is_empty()).then_some(affect)
}

pub fn cmd_recall(config: Option<PathBuf>, args: RecallArgs) {
    let config = load(config.as_deref());
    let rt = runtime();
    rt.block_on(async {
        let kernel = boot(config, !args.fts_only).await;
        let req = RecallRequest {
            query: args.query,
            affect: args.affect.as_deref().and_then(parse_affect),
            mode: if args.fts_only {
                EmbeddingMode::LexicalOnly
            } else {
                EmbeddingMode::Auto
            },
            max_results: args.max_results,
            deadline: args.deadline_ms.map(Duration::from_millis),
        };
        let outcome = kernel.recall(req).await;
        kernel.shutdown().await;
        match outcome {
            Ok(outcome) => {
                debug!(trace = ?outcome.trace, "Recall trace");
                print_json(&*outcome.result);
            }
            Err(e) => fail(e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_affect_keeps_numbers() {
        let affect = parse_affect(r#"{"CARE": 0.5, "FEAR": 1, "note": "x"}"#).unwrap();
        assert_eq!(affect.len(), 2);
        assert_eq!(affect["CARE"], 0.5);
        assert_eq!(affect["FEAR"], 1.0);
    }

    #[test]
    fn test_parse_affect_rejects_garbage() {
        assert!(parse_affect("not json").is_none());
        assert!(parse_affect("[0.5]").is_none());
        assert!(parse_affect("{}").is_none());
    }
}
