//! Tracing hooks for optimizer statistics.
//!
//! Only the `tracing` facade is used here; the binary decides where the
//! events go.

use crate::scheduler::OptimizerStats;

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::DEBUG, "quarry", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::debug!(%event, %k, %v, "metric");
    }
}

/// Report the counters of one optimization pass.
pub fn emit_stats(stats: &OptimizerStats) {
    emit_span(
        "optimize",
        &[
            ("plans_created", stats.plans_created.to_string()),
            ("rule_invocations", stats.rule_invocations.to_string()),
            ("rules_skipped", stats.rules_skipped.to_string()),
            ("reruns", stats.reruns.to_string()),
            ("pruned", stats.pruned.to_string()),
            ("required_only", stats.required_only.to_string()),
            ("surviving", stats.surviving_candidates.to_string()),
        ],
    );
}
