//! Prometheus metrics exposition
//!
//! The libraries emit their own counters; this module installs the recorder
//! that collects them and adds the agent's gauges:
//!
//! - `session_refresh_total` (counter): label `outcome`
//! - `realtime_connects_total`, `realtime_reconnects_total` (counters)
//! - `realtime_events_total` (counter): label `kind`
//! - `realtime_duplicates_total` (counter)
//! - `session_authenticated` (gauge): 1 while the session is authenticated
//! - `realtime_channel_open` (gauge): 1 while the channel is open

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use realtime::ConnectionState;
use session_guard::SessionState;

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!("session_refresh_total", "Token refresh attempts by outcome");
    metrics::describe_counter!("realtime_connects_total", "Realtime connection attempts");
    metrics::describe_counter!("realtime_reconnects_total", "Scheduled realtime reconnects");
    metrics::describe_counter!("realtime_events_total", "Dispatched realtime events by kind");
    metrics::describe_counter!("realtime_duplicates_total", "Dropped duplicate realtime events");
    metrics::describe_gauge!("session_authenticated", "1 while the session is authenticated");
    metrics::describe_gauge!("realtime_channel_open", "1 while the realtime channel is open");
}

/// Record the current session classification.
pub fn record_session_state(state: &SessionState) {
    metrics::gauge!("session_authenticated").set(if state.is_authenticated() { 1.0 } else { 0.0 });
}

/// Record the current realtime channel state.
pub fn record_channel_state(state: &ConnectionState) {
    metrics::gauge!("realtime_channel_open").set(if state.is_open() { 1.0 } else { 0.0 });
}
