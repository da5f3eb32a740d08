//! Transport boundary — validates raw deliveries and enqueues the
//! persist → process chain.
//!
//! The transport hands over a set of message fragments from one delivery.
//! Fragments concatenate in delivery order into one logical body. Anything
//! failing preflight validation is logged and dropped before a job exists.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::pipeline::PersistInput;
use crate::scheduler::{BackoffPolicy, JobRequest, JobScheduler, JobSpec};

/// One transport delivery: the fragments of a single logical message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsDelivery {
    /// Originating address. Absent or blank fails preflight.
    pub address: Option<String>,
    /// Message fragments in delivery order.
    pub fragments: Vec<String>,
    #[serde(default = "default_subscription")]
    pub subscription_id: i32,
    /// Sent timestamp in milliseconds since epoch.
    pub sent_at_ms: i64,
}

fn default_subscription() -> i32 {
    -1
}

/// Validate a delivery and enqueue the persist → process chain for it.
///
/// Returns `false` when the delivery failed preflight validation and was
/// dropped.
pub async fn handle_delivery(
    scheduler: &JobScheduler,
    config: &PipelineConfig,
    delivery: SmsDelivery,
) -> bool {
    if delivery.fragments.is_empty() {
        debug!("Empty sms payload");
        return false;
    }

    let Some(address) = delivery
        .address
        .as_deref()
        .map(str::trim)
        .filter(|address| !address.is_empty())
    else {
        warn!("Inbound sms failed preflight validation: blank address");
        return false;
    };

    let body: String = delivery.fragments.concat();
    if body.trim().is_empty() {
        warn!("Inbound sms failed preflight validation: blank body");
        return false;
    }

    debug!("New inbound sms");
    let request = JobRequest::new(
        JobSpec::Persist(PersistInput {
            address: address.to_string(),
            body,
            subscription_id: delivery.subscription_id,
            sent_at_ms: delivery.sent_at_ms,
        }),
        BackoffPolicy::new(config.persist_backoff_base),
    )
    .then_process(BackoffPolicy::new(config.process_backoff_base));

    scheduler.enqueue(request).await
}
