//! Kubernetes Events for actuator verbs
//!
//! Every create, update and delete of a Machine ends in one [`MachineEvent`],
//! visible through `kubectl describe machine`. Publishing never fails the
//! reconcile; a rejected Event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Actuator verb an Event reports on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// VM clone, power-on, or an already present VM
    Create,
    /// VM state reflected onto the Machine
    Update,
    /// VM torn down
    Delete,
}

impl Verb {
    /// Event reason, `Create` or `FailedCreate` and so on
    pub fn reason(self, failed: bool) -> &'static str {
        match (self, failed) {
            (Verb::Create, false) => "Create",
            (Verb::Update, false) => "Update",
            (Verb::Delete, false) => "Delete",
            (Verb::Create, true) => "FailedCreate",
            (Verb::Update, true) => "FailedUpdate",
            (Verb::Delete, true) => "FailedDelete",
        }
    }

    /// Event action
    pub fn action(self) -> &'static str {
        match self {
            Verb::Create => "Provision",
            Verb::Update => "Reconcile",
            Verb::Delete => "Delete",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Verb::Create => "Created",
            Verb::Update => "Updated",
            Verb::Delete => "Deleted",
        }
    }
}

/// Outcome of one verb on one Machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineEvent {
    /// Verb that ran
    pub verb: Verb,
    /// Error message when the verb failed
    pub error: Option<String>,
}

impl MachineEvent {
    /// The verb completed
    pub fn succeeded(verb: Verb) -> Self {
        Self { verb, error: None }
    }

    /// The verb failed with `error`
    pub fn failed(verb: Verb, error: impl Into<String>) -> Self {
        Self {
            verb,
            error: Some(error.into()),
        }
    }

    /// Whether this is reported as a Warning
    pub fn is_warning(&self) -> bool {
        self.error.is_some()
    }

    /// Event reason
    pub fn reason(&self) -> &'static str {
        self.verb.reason(self.is_warning())
    }

    fn to_event(&self, machine: &ObjectReference) -> Event {
        let note = match &self.error {
            Some(error) => error.clone(),
            None => format!(
                "{} Machine {}",
                self.verb.past_tense(),
                machine.name.as_deref().unwrap_or_default()
            ),
        };
        Event {
            type_: if self.is_warning() {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: self.reason().to_string(),
            note: Some(note),
            action: self.verb.action().to_string(),
            secondary: None,
        }
    }
}

/// Sink for Machine Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on `machine`
    async fn publish(&self, machine: &ObjectReference, event: MachineEvent);
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when set
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, machine: &ObjectReference, event: MachineEvent) {
        if let Err(e) = self.recorder.publish(&event.to_event(machine), machine).await {
            warn!(
                machine = machine.name.as_deref().unwrap_or_default(),
                reason = event.reason(),
                error = %e,
                "failed to publish machine event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_ref() -> ObjectReference {
        ObjectReference {
            kind: Some("Machine".to_string()),
            name: Some("worker-0".to_string()),
            namespace: Some("openshift-machine-api".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn success_is_normal_with_past_tense_note() {
        let event = MachineEvent::succeeded(Verb::Delete).to_event(&machine_ref());
        assert!(matches!(event.type_, EventType::Normal));
        assert_eq!(event.reason, "Delete");
        assert_eq!(event.action, "Delete");
        assert_eq!(event.note.as_deref(), Some("Deleted Machine worker-0"));
    }

    #[test]
    fn failure_is_warning_carrying_the_error() {
        let event = MachineEvent::failed(Verb::Create, "template not found").to_event(&machine_ref());
        assert!(matches!(event.type_, EventType::Warning));
        assert_eq!(event.reason, "FailedCreate");
        assert_eq!(event.action, "Provision");
        assert_eq!(event.note.as_deref(), Some("template not found"));
    }

    #[test]
    fn failure_reasons_mirror_verbs() {
        for verb in [Verb::Create, Verb::Update, Verb::Delete] {
            assert_eq!(verb.reason(true), format!("Failed{}", verb.reason(false)));
        }
    }
}
