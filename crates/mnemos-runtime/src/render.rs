//! One-line rendering of recalled turns.

use mnemos_types::memory::TurnPayload;

const INPUT_CHARS: usize = 100;
const OUTPUT_CHARS: usize = 100;
const CONTEMPLATION_CHARS: usize = 80;
const SUMMARY_CHARS: usize = 200;
const GHOST_CHARS: usize = 50;

fn clip(text: &str, max: usize) -> String {
    text.trim().chars().take(max).collect()
}

/// `[speaker] In: … | Out: … | Think: …`, or `[speaker] <summary>` when the
/// turn has no layers.
pub fn render(payload: &TurnPayload) -> String {
    let mut parts = Vec::with_capacity(3);
    for (layer, label, max) in [
        ("input", "In", INPUT_CHARS),
        ("output", "Out", OUTPUT_CHARS),
        ("contemplation", "Think", CONTEMPLATION_CHARS),
    ] {
        if let Some(text) = payload.layers.get(layer).filter(|t| !t.trim().is_empty()) {
            parts.push(format!("{label}: {}", clip(text, max)));
        }
    }

    let body = if parts.is_empty() {
        let summary = if payload.summary.trim().is_empty() {
            &payload.text
        } else {
            &payload.summary
        };
        clip(summary, SUMMARY_CHARS)
    } else {
        parts.join(" | ")
    };
    format!("[{}] {}", payload.speaker, body)
}

/// Faded rendering for memories whose strength has decayed away.
pub fn render_ghost(payload: &TurnPayload) -> String {
    let full = render(payload);
    format!("[faded] {}", clip(&full, GHOST_CHARS))
}
