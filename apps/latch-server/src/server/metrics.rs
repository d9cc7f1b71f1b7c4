use std::{collections::HashMap, fmt::Write as _, hash::Hash, sync::Mutex};

use super::core::{MetricsState, METRICS_STATE};

pub(crate) const GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND: &str = "oversized_outbound";
pub(crate) const GATEWAY_DROP_REASON_FULL_QUEUE: &str = "full_queue";
pub(crate) const GATEWAY_DROP_REASON_CLOSED: &str = "closed";

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

fn snapshot<K: Clone + Eq + Hash>(counter: &Mutex<HashMap<K, u64>>) -> HashMap<K, u64> {
    counter
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone())
}

fn increment<K: Eq + Hash>(counter: &Mutex<HashMap<K, u64>>, key: K) {
    if let Ok(mut counters) = counter.lock() {
        let entry = counters.entry(key).or_insert(0);
        *entry += 1;
    }
}

fn write_family(output: &mut String, name: &str, help: &str, mut rows: Vec<(String, u64)>) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    rows.sort();
    for (labels, value) in rows {
        let _ = writeln!(output, "{name}{{{labels}}} {value}");
    }
}

pub(crate) fn render_metrics() -> String {
    let state = metrics_state();
    let mut output = String::new();

    write_family(
        &mut output,
        "latch_auth_failures_total",
        "Count of auth-related failures by reason",
        snapshot(&state.auth_failures)
            .into_iter()
            .map(|(reason, value)| (format!("reason=\"{reason}\""), value))
            .collect(),
    );
    write_family(
        &mut output,
        "latch_challenges_issued_total",
        "Count of challenge tokens issued by action",
        snapshot(&state.challenges_issued)
            .into_iter()
            .map(|(action, value)| (format!("action=\"{action}\""), value))
            .collect(),
    );
    write_family(
        &mut output,
        "latch_challenge_verifications_total",
        "Count of challenge verification attempts by action and outcome",
        snapshot(&state.challenge_verifications)
            .into_iter()
            .map(|((action, outcome), value)| {
                (format!("action=\"{action}\",outcome=\"{outcome}\""), value)
            })
            .collect(),
    );
    write_family(
        &mut output,
        "latch_sessions_evicted_total",
        "Count of registry session evictions by reason",
        snapshot(&state.sessions_evicted)
            .into_iter()
            .map(|(reason, value)| (format!("reason=\"{reason}\""), value))
            .collect(),
    );
    write_family(
        &mut output,
        "latch_ws_disconnects_total",
        "Count of websocket disconnect events by reason",
        snapshot(&state.ws_disconnects)
            .into_iter()
            .map(|(reason, value)| (format!("reason=\"{reason}\""), value))
            .collect(),
    );
    write_family(
        &mut output,
        "latch_gateway_events_emitted_total",
        "Count of emitted gateway events by scope and type",
        snapshot(&state.gateway_events_emitted)
            .into_iter()
            .map(|((scope, event_type), value)| {
                (
                    format!("scope=\"{scope}\",event_type=\"{event_type}\""),
                    value,
                )
            })
            .collect(),
    );
    write_family(
        &mut output,
        "latch_gateway_events_dropped_total",
        "Count of dropped gateway events by scope, type, and reason",
        snapshot(&state.gateway_events_dropped)
            .into_iter()
            .map(|((scope, event_type, reason), value)| {
                (
                    format!("scope=\"{scope}\",event_type=\"{event_type}\",reason=\"{reason}\""),
                    value,
                )
            })
            .collect(),
    );

    output
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    increment(&metrics_state().auth_failures, reason);
}

pub(crate) fn record_challenge_issued(action: &'static str) {
    increment(&metrics_state().challenges_issued, action);
}

pub(crate) fn record_challenge_verification(action: &'static str, outcome: &'static str) {
    increment(&metrics_state().challenge_verifications, (action, outcome));
}

pub(crate) fn record_session_evicted(reason: &'static str) {
    increment(&metrics_state().sessions_evicted, reason);
}

pub(crate) fn record_ws_disconnect(reason: &'static str) {
    increment(&metrics_state().ws_disconnects, reason);
}

pub(crate) fn record_gateway_event_emitted(scope: &'static str, event_type: &str) {
    increment(
        &metrics_state().gateway_events_emitted,
        (scope.to_owned(), event_type.to_owned()),
    );
}

pub(crate) fn record_gateway_event_dropped(
    scope: &'static str,
    event_type: &str,
    reason: &'static str,
) {
    increment(
        &metrics_state().gateway_events_dropped,
        (scope.to_owned(), event_type.to_owned(), reason.to_owned()),
    );
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{
        metrics_state, record_gateway_event_dropped, record_session_evicted, render_metrics,
        GATEWAY_DROP_REASON_FULL_QUEUE,
    };

    #[test]
    fn records_dropped_events_with_canonical_reason_label() {
        let event_type = format!("drop_test_{}", Uuid::new_v4().simple());
        record_gateway_event_dropped("user", &event_type, GATEWAY_DROP_REASON_FULL_QUEUE);

        let dropped = metrics_state()
            .gateway_events_dropped
            .lock()
            .expect("gateway dropped metrics mutex should not be poisoned");
        let key = (
            String::from("user"),
            event_type,
            String::from(GATEWAY_DROP_REASON_FULL_QUEUE),
        );
        assert_eq!(dropped.get(&key).copied(), Some(1));
    }

    #[test]
    fn renders_prometheus_text_for_recorded_counters() {
        record_session_evicted("capacity_exceeded");

        let rendered = render_metrics();
        assert!(rendered.contains("# TYPE latch_sessions_evicted_total counter"));
        assert!(rendered.contains("latch_sessions_evicted_total{reason=\"capacity_exceeded\"}"));
    }
}
