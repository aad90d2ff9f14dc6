//! Metrics registry for eno observability
//!
//! Provides OpenTelemetry counters for the synthesizer pod lifecycle. The
//! meter is resolved from the global provider, so the counters are no-ops
//! until telemetry installs an exporter.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};

/// Global meter for eno metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("eno"));

// ============================================================================
// Synthesis Pod Lifecycle Metrics
// ============================================================================

/// Counter of synthesizer pods created
pub static SYNTHESIS_PODS_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("eno_synthesis_pods_created_total")
        .with_description("Total number of synthesizer pods created")
        .with_unit("{pods}")
        .build()
});

/// Counter of synthesizer pods deleted because they outlived the pod timeout
pub static SYNTHESIS_POD_RECREATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("eno_synthesis_pod_recreations_total")
        .with_description("Total number of synthesizer pods recreated after timing out")
        .with_unit("{pods}")
        .build()
});

/// Record a synthesizer pod creation
pub fn record_pod_created() {
    SYNTHESIS_PODS_CREATED.add(1, &[]);
}

/// Record a synthesizer pod deleted for exceeding its timeout
pub fn record_pod_recreated() {
    SYNTHESIS_POD_RECREATIONS.add(1, &[]);
}
