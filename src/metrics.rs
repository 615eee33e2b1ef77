//! Observability hooks.
//!
//! With the `metrics` feature, ledger activity is counted through OpenTelemetry and
//! exported into a Prometheus registry (see [`CountersignMetrics::render`]). With the
//! `tracing` feature, [`tracing_helpers`] provides the spans opened around ledger
//! operations, store units and SQL statements.

#[cfg(feature = "metrics")]
pub use otel::{CountersignMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider, ObservableGauge};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    pub static METRICS: Lazy<CountersignMetrics> = Lazy::new(CountersignMetrics::init);

    pub struct CountersignMetrics {
        pub registry: Registry,
        pub postings_total: Counter<u64>,
        pub rejections_total: Counter<u64>,
        pub conflict_retries_total: Counter<u64>,
        pub unit_duration: Histogram<f64>,
        pub connections_in_use: Arc<AtomicUsize>,
        _provider: SdkMeterProvider,
        _connections_gauge: ObservableGauge<u64>,
    }

    impl CountersignMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics will not be exported: {e}");
                    SdkMeterProvider::builder().build()
                }
            };
            let meter = provider.meter("countersign");

            let postings_total = meter
                .u64_counter("countersign_postings_total")
                .with_description("Ledger transactions committed")
                .build();

            let rejections_total = meter
                .u64_counter("countersign_rejections_total")
                .with_description("Ledger operations rejected")
                .build();

            let conflict_retries_total = meter
                .u64_counter("countersign_conflict_retries_total")
                .with_description("Units re-run after a serialization conflict")
                .build();

            let unit_duration = meter
                .f64_histogram("countersign_unit_duration_seconds")
                .with_description("Duration of ledger operations")
                .build();

            let connections_in_use = Arc::new(AtomicUsize::new(0));
            let in_use = Arc::clone(&connections_in_use);
            let connections_gauge = meter
                .u64_observable_gauge("countersign_pool_connections_in_use")
                .with_description("Pooled connections currently checked out")
                .with_callback(move |observer| {
                    observer.observe(in_use.load(Ordering::Relaxed) as u64, &[]);
                })
                .build();

            Self {
                registry,
                postings_total,
                rejections_total,
                conflict_retries_total,
                unit_duration,
                connections_in_use,
                _provider: provider,
                _connections_gauge: connections_gauge,
            }
        }

        pub fn record_posting(&self, kind: &'static str) {
            self.postings_total.add(1, &[KeyValue::new("kind", kind)]);
        }

        pub fn record_rejection(&self, operation: &'static str, error_kind: &'static str) {
            self.rejections_total.add(
                1,
                &[
                    KeyValue::new("operation", operation),
                    KeyValue::new("error", error_kind),
                ],
            );
        }

        pub fn record_conflict_retry(&self) {
            self.conflict_retries_total.add(1, &[]);
        }

        pub fn record_unit(&self, operation: &'static str, elapsed: Duration) {
            self.unit_duration
                .record(elapsed.as_secs_f64(), &[KeyValue::new("operation", operation)]);
        }

        pub fn connection_acquired(&self) {
            self.connections_in_use.fetch_add(1, Ordering::Relaxed);
        }

        pub fn connection_released(&self) {
            self.connections_in_use.fetch_sub(1, Ordering::Relaxed);
        }

        /// Prometheus text exposition of everything recorded so far
        pub fn render(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8(buffer).unwrap_or_default()
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, info_span, Span};

    pub fn ledger_operation_span(operation: &'static str) -> Span {
        info_span!("countersign.operation", operation)
    }

    pub fn store_unit_span(backend: &'static str) -> Span {
        info_span!("countersign.unit", backend)
    }

    pub fn acquire_connection_span() -> Span {
        debug_span!("countersign.pool.acquire")
    }

    pub fn begin_transaction_span() -> Span {
        debug_span!("countersign.db.begin")
    }

    pub fn commit_transaction_span() -> Span {
        debug_span!("countersign.db.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        debug_span!("countersign.db.rollback")
    }

    pub fn execute_query_span(query: &str) -> Span {
        debug_span!("countersign.db.query", query = %query)
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::METRICS;

    #[test]
    fn test_metrics_record_without_panicking() {
        METRICS.record_posting("dispense");
        METRICS.record_rejection("dispense", "conflict");
        METRICS.record_conflict_retry();
        METRICS.record_unit("dispense", std::time::Duration::from_millis(3));
        METRICS.connection_acquired();
        METRICS.connection_released();
        let _ = METRICS.render();
    }
}
