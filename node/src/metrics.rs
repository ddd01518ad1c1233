//! # Prometheus Metrics
//!
//! Operational metrics for the vault node, scraped at `/metrics` on the
//! metrics port. Everything lives in a dedicated, `strata`-prefixed
//! [`prometheus::Registry`].

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

use strata_contracts::{RegistryError, VaultError};

/// Metric handles for the node. Clones share the underlying metrics.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Vault operations by `operation` and `outcome` (`ok` / `error`).
    pub operations_total: IntCounterVec,
    /// Calls refused because the vault was in the wrong phase.
    pub phase_violations_total: IntCounter,
    /// Pooled collateral summed over every vault, in minor units.
    pub total_collateral: IntGauge,
    /// Claim supply summed over every vault.
    pub total_claim_supply: IntGauge,
    pub vault_count: IntGauge,
    /// Wall time of a vault operation, in seconds.
    pub operation_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers every metric. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("strata".into()), None)
            .expect("failed to create prometheus registry");

        let operations_total = IntCounterVec::new(
            Opts::new("operations_total", "Vault operations handled, by outcome"),
            &["operation", "outcome"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(operations_total.clone()))
            .expect("metric registration");

        let phase_violations_total = IntCounter::new(
            "phase_violations_total",
            "Vault operations refused for being called in the wrong phase",
        )
        .expect("metric creation");
        registry
            .register(Box::new(phase_violations_total.clone()))
            .expect("metric registration");

        let total_collateral = IntGauge::new(
            "total_collateral",
            "Pooled collateral across all vaults, in minor units",
        )
        .expect("metric creation");
        registry
            .register(Box::new(total_collateral.clone()))
            .expect("metric registration");

        let total_claim_supply =
            IntGauge::new("total_claim_supply", "Outstanding claims across all vaults")
                .expect("metric creation");
        registry
            .register(Box::new(total_claim_supply.clone()))
            .expect("metric registration");

        let vault_count = IntGauge::new("vault_count", "Number of initialized vaults")
            .expect("metric creation");
        registry
            .register(Box::new(vault_count.clone()))
            .expect("metric registration");

        let operation_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Vault operation latency in seconds, including the disk commit",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(operation_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            operations_total,
            phase_violations_total,
            total_collateral,
            total_claim_supply,
            vault_count,
            operation_latency_seconds,
        }
    }

    /// Records one finished vault operation.
    pub fn observe<T>(
        &self,
        operation: &str,
        result: &Result<T, RegistryError>,
        elapsed: Duration,
    ) {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        if let Err(e) = result {
            if matches!(e.vault_error(), Some(VaultError::PhaseViolation { .. })) {
                self.phase_violations_total.inc();
            }
        }
        self.operation_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    /// Sets the registry-wide gauges.
    pub fn set_totals(&self, vaults: usize, collateral: u64, claim_supply: u64) {
        self.vault_count.set(clamp(vaults as u64));
        self.total_collateral.set(clamp(collateral));
        self.total_claim_supply.set(clamp(claim_supply));
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_protocol::epoch::{Operation, Phase};

    #[test]
    fn observe_counts_outcomes_and_phase_violations() {
        let metrics = NodeMetrics::new();
        let ok: Result<(), RegistryError> = Ok(());
        let violation: Result<(), RegistryError> = Err(VaultError::PhaseViolation {
            operation: Operation::Deposit,
            required: Operation::Deposit.permitted_phases(),
            current: Phase::Trading,
        }
        .into());
        let other: Result<(), RegistryError> = Err(RegistryError::VaultNotFound("x".into()));

        metrics.observe("deposit", &ok, Duration::from_millis(1));
        metrics.observe("deposit", &violation, Duration::from_millis(1));
        metrics.observe("deposit", &other, Duration::from_millis(1));

        assert_eq!(
            metrics
                .operations_total
                .with_label_values(&["deposit", "ok"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .operations_total
                .with_label_values(&["deposit", "error"])
                .get(),
            2
        );
        assert_eq!(metrics.phase_violations_total.get(), 1);
        assert_eq!(metrics.operation_latency_seconds.get_sample_count(), 3);
    }

    #[test]
    fn encode_includes_prefixed_gauges() {
        let metrics = NodeMetrics::new();
        metrics.set_totals(2, 430_000_000, 428_000_000);
        let text = metrics.encode().unwrap();
        assert!(text.contains("strata_vault_count 2"));
        assert!(text.contains("strata_total_collateral 430000000"));
    }
}
