//! Kubernetes Event recording for the operator's controllers.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. Events are for observability only; no control flow
//! depends on them.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Well-known event reasons
pub mod reasons {
    /// A prerequisite operator is missing or not Available
    pub const PREREQ_NOT_READY: &str = "PrereqNotReady";
    /// The kubernetes finalizer was cleared from the target namespace
    pub const NAMESPACE_FINALIZATION: &str = "NamespaceFinalization";
    /// The observed configuration was rewritten
    pub const OBSERVED_CONFIG_CHANGED: &str = "ObservedConfigChanged";
}

/// Emits events about the object the recorder was created for.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Emit a Normal event.
    async fn event(&self, reason: &str, note: String);

    /// Emit a Warning event.
    async fn warning(&self, reason: &str, note: String);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventRecorder {
    recorder: Recorder,
    reference: ObjectReference,
}

impl KubeEventRecorder {
    /// Create a recorder reporting as `controller_name` about `reference`.
    pub fn new(client: Client, controller_name: &str, reference: ObjectReference) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            reference,
        }
    }

    async fn publish(&self, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &self.reference).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn event(&self, reason: &str, note: String) {
        self.publish(EventType::Normal, reason, note).await;
    }

    async fn warning(&self, reason: &str, note: String) {
        self.publish(EventType::Warning, reason, note).await;
    }
}
