use tracing::trace;

// Lightweight metric helpers. Trace-based so builds stay stable without
// the metrics macro crates; the Prometheus recorder in main still
// exposes process-level series.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "portside.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn webhook_processed(marketplace: &'static str, outcome: &'static str) {
    trace!(
        target = "portside.metrics",
        marketplace = marketplace,
        outcome = outcome,
        "webhook_processed"
    );
}

pub fn job_finished(queue: &'static str, state: &'static str) {
    trace!(
        target = "portside.metrics",
        queue = queue,
        state = state,
        "job_finished"
    );
}

pub fn recovery_swept(enqueued: usize) {
    trace!(
        target = "portside.metrics",
        enqueued = enqueued as u64,
        "recovery_swept"
    );
}
