//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health and gateway latency
//! - Order ingestion and status transitions
//! - Chain commands and their failures
//! - Reorg regressions and quarantines

use crate::error::{ErrorClass, RelayerError, RelayerResult};
use crate::events::OrderEvent;
use crate::order::{CommandKind, OrderStatus};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "swap_relayer_chain_healthy",
        "Chain gateway health (1=healthy, 0=unhealthy)",
        &["chain_id"]
    ).expect("register swap_relayer_chain_healthy");

    pub static ref GATEWAY_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_relayer_gateway_latency_seconds",
        "Latency of gateway calls",
        &["chain_id", "operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).expect("register swap_relayer_gateway_latency_seconds");

    pub static ref REORGS_DETECTED: CounterVec = register_counter_vec!(
        "swap_relayer_reorgs_detected_total",
        "Escrow observations that went backwards",
        &["chain_id"]
    ).expect("register swap_relayer_reorgs_detected_total");

    // Ingestion metrics
    pub static ref ORDERS_INGESTED: CounterVec = register_counter_vec!(
        "swap_relayer_orders_ingested_total",
        "Maker escrows forwarded to the new-order worker",
        &["chain_id"]
    ).expect("register swap_relayer_orders_ingested_total");

    pub static ref CHANNEL_DROPS: CounterVec = register_counter_vec!(
        "swap_relayer_new_order_drops_total",
        "Escrows dropped because the new-order channel was full",
        &["chain_id"]
    ).expect("register swap_relayer_new_order_drops_total");

    // Order metrics
    pub static ref STATUS_TRANSITIONS: CounterVec = register_counter_vec!(
        "swap_relayer_status_transitions_total",
        "Order status transitions by target status",
        &["status"]
    ).expect("register swap_relayer_status_transitions_total");

    pub static ref ACTIVE_ORDERS: Gauge = register_gauge!(
        "swap_relayer_active_orders",
        "Orders in the hot map"
    ).expect("register swap_relayer_active_orders");

    pub static ref FILLS_RECORDED: CounterVec = register_counter_vec!(
        "swap_relayer_fills_recorded_total",
        "Partial fills observed on the source leg",
        &["chain_id"]
    ).expect("register swap_relayer_fills_recorded_total");

    pub static ref ORDER_EVENTS: CounterVec = register_counter_vec!(
        "swap_relayer_order_events_total",
        "Audit events appended by type",
        &["event_type"]
    ).expect("register swap_relayer_order_events_total");

    // Command metrics
    pub static ref COMMANDS_SUBMITTED: CounterVec = register_counter_vec!(
        "swap_relayer_commands_submitted_total",
        "Chain commands accepted by a gateway",
        &["chain_id", "kind"]
    ).expect("register swap_relayer_commands_submitted_total");

    pub static ref COMMANDS_FAILED: CounterVec = register_counter_vec!(
        "swap_relayer_commands_failed_total",
        "Chain commands that failed",
        &["chain_id", "kind", "class"]
    ).expect("register swap_relayer_commands_failed_total");

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "swap_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).expect("register swap_relayer_health_check_success_total");

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "swap_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).expect("register swap_relayer_health_check_failure_total");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

fn class_label(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Validation => "validation",
        ErrorClass::ChainTransient => "chain_transient",
        ErrorClass::ChainPermanent => "chain_permanent",
        ErrorClass::Internal => "internal",
    }
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: &str, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[chain_id])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_gateway_latency(chain_id: &str, operation: &str, elapsed: Duration) {
    GATEWAY_LATENCY
        .with_label_values(&[chain_id, operation])
        .observe(elapsed.as_secs_f64());
}

pub fn record_reorg(chain_id: &str) {
    REORGS_DETECTED.with_label_values(&[chain_id]).inc();
}

pub fn record_order_ingested(chain_id: &str) {
    ORDERS_INGESTED.with_label_values(&[chain_id]).inc();
}

pub fn record_channel_drop(chain_id: &str) {
    CHANNEL_DROPS.with_label_values(&[chain_id]).inc();
}

pub fn record_status_transition(status: OrderStatus) {
    STATUS_TRANSITIONS.with_label_values(&[status.as_str()]).inc();
}

pub fn set_active_orders(count: usize) {
    ACTIVE_ORDERS.set(count as f64);
}

pub fn record_fill(chain_id: &str) {
    FILLS_RECORDED.with_label_values(&[chain_id]).inc();
}

pub fn record_order_event(event: &OrderEvent) {
    ORDER_EVENTS.with_label_values(&[event.name()]).inc();
}

pub fn record_command_submitted(chain_id: &str, kind: CommandKind) {
    COMMANDS_SUBMITTED
        .with_label_values(&[chain_id, kind.as_str()])
        .inc();
}

pub fn record_command_failed(chain_id: &str, kind: CommandKind, class: ErrorClass) {
    COMMANDS_FAILED
        .with_label_values(&[chain_id, kind.as_str(), class_label(class)])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
