//! Prometheus counters for the question service.
//!
//! The recorder is installed once at startup; until then every `record_*`
//! call is a no-op, which keeps tests free of global state.

use crate::types::{Outcome, RegistrationStatus};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// prediction_{name}_total
macro_rules! service_counter {
    ($name:literal) => {
        concat!("prediction_", $name, "_total")
    };
}

pub const USERS_REGISTERED: &str = service_counter!("users_registered");
pub const QUESTIONS_CREATED: &str = service_counter!("questions_created");
pub const QUESTIONS_SERVED: &str = service_counter!("questions_served");
pub const QUESTIONS_RESOLVED: &str = service_counter!("questions_resolved");

/// Install the Prometheus recorder. Idempotent.
pub fn init_metrics() {
    INIT.call_once(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if HANDLE.set(handle).is_err() {
                warn!("Prometheus handle already stored");
            }
            describe_counter!(USERS_REGISTERED, "Registrations, labelled created or existing");
            describe_counter!(QUESTIONS_CREATED, "Questions added to the pool");
            describe_counter!(QUESTIONS_SERVED, "Fresh questions handed out to users");
            describe_counter!(QUESTIONS_RESOLVED, "Questions resolved, labelled by outcome");
            info!("Prometheus recorder installed");
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
        }
    });
}

/// Current metrics in Prometheus text format; empty before `init_metrics`.
pub fn render() -> String {
    HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

pub fn record_user_registered(status: RegistrationStatus) {
    let status = match status {
        RegistrationStatus::Created => "created",
        RegistrationStatus::Existing => "existing",
    };
    counter!(USERS_REGISTERED, "status" => status).increment(1);
}

pub fn record_question_created() {
    counter!(QUESTIONS_CREATED).increment(1);
}

pub fn record_questions_served(count: usize) {
    counter!(QUESTIONS_SERVED).increment(count as u64);
}

pub fn record_question_resolved(outcome: Outcome) {
    counter!(QUESTIONS_RESOLVED, "outcome" => outcome.as_str()).increment(1);
}
