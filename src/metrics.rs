//! Prometheus metrics for blobio.
//!
//! Codec and channel code records counters through the `metrics` facade.
//! Counters are no-ops until a recorder is installed. The CLI installs a
//! `metrics-exporter-prometheus` recorder with [`init_metrics`] and can
//! print the exposition text with [`render`].

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Content bytes emitted by structured message decoders (counter).
pub const DECODED_BYTES_TOTAL: &str = "blobio_decoded_bytes_total";

/// Segments fully decoded and verified (counter).
pub const DECODED_SEGMENTS_TOTAL: &str = "blobio_decoded_segments_total";

/// Wire bytes produced by structured message encoders (counter).
pub const ENCODED_BYTES_TOTAL: &str = "blobio_encoded_bytes_total";

/// Segment or message CRC64 mismatches detected while decoding (counter).
pub const CHECKSUM_MISMATCHES_TOTAL: &str = "blobio_checksum_mismatches_total";

/// Buffer refills issued by read-mode channels (counter).
pub const CHANNEL_REFILLS_TOTAL: &str = "blobio_channel_refills_total";

/// Buffer flushes issued by write-mode channels (counter).
pub const CHANNEL_FLUSHES_TOTAL: &str = "blobio_channel_flushes_total";

/// Chunk dispatches issued by legacy streams (counter). Labels: direction.
pub const STREAM_DISPATCHES_TOTAL: &str = "blobio_stream_dispatches_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests).
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(DECODED_BYTES_TOTAL, "Content bytes emitted by decoders");
    describe_counter!(DECODED_SEGMENTS_TOTAL, "Segments decoded and verified");
    describe_counter!(ENCODED_BYTES_TOTAL, "Wire bytes produced by encoders");
    describe_counter!(CHECKSUM_MISMATCHES_TOTAL, "CRC64 mismatches detected");
    describe_counter!(CHANNEL_REFILLS_TOTAL, "Read-mode channel buffer refills");
    describe_counter!(CHANNEL_FLUSHES_TOTAL, "Write-mode channel buffer flushes");
    describe_counter!(STREAM_DISPATCHES_TOTAL, "Legacy stream chunk dispatches");
}

/// Render Prometheus exposition format text, if a recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}
