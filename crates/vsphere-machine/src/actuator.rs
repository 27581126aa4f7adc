//! Actuator entry points called by the Machine controller
//!
//! Each verb builds a fresh [`MachineScope`], runs the reconciler, writes the
//! Machine back once and records a Kubernetes Event for the outcome.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use tracing::warn;

use machine_api_common::crd::Machine;
use machine_api_common::events::{EventPublisher, MachineEvent, Verb};
use machine_api_common::FeatureGates;
use vsphere_client::SessionCache;

use crate::client::KubeClient;
use crate::error::Result;
use crate::reconciler;
use crate::scope::{MachineScope, ScopeParams};

/// vSphere implementation of the machine actuator
pub struct Actuator {
    kube: Arc<dyn KubeClient>,
    sessions: Arc<SessionCache>,
    feature_gates: FeatureGates,
    events: Arc<dyn EventPublisher>,
}

impl Actuator {
    /// Create an actuator sharing `sessions` across all reconciles
    pub fn new(
        kube: Arc<dyn KubeClient>,
        sessions: Arc<SessionCache>,
        feature_gates: FeatureGates,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            sessions,
            feature_gates,
            events,
        }
    }

    async fn scope(&self, machine: &Machine) -> Result<MachineScope> {
        MachineScope::new(ScopeParams {
            machine,
            kube: self.kube.clone(),
            sessions: &self.sessions,
            feature_gates: self.feature_gates.clone(),
        })
        .await
    }

    /// Create the Machine's VM, or advance a creation in progress
    pub async fn create(&self, machine: &Machine) -> Result<()> {
        self.run(machine, Verb::Create).await
    }

    /// Reflect the VM's state into the Machine
    pub async fn update(&self, machine: &Machine) -> Result<()> {
        self.run(machine, Verb::Update).await
    }

    /// Tear the VM down; `Ok` once it is gone
    pub async fn delete(&self, machine: &Machine) -> Result<()> {
        self.run(machine, Verb::Delete).await
    }

    /// Whether the VM exists and creation is complete
    pub async fn exists(&self, machine: &Machine) -> Result<bool> {
        let mut scope = self.scope(machine).await?;
        reconciler::exists(&mut scope).await
    }

    async fn run(&self, machine: &Machine, verb: Verb) -> Result<()> {
        let object = machine.object_ref(&());
        let mut scope = match self.scope(machine).await {
            Ok(scope) => scope,
            Err(e) => {
                self.publish_failure(&object, verb, &e.to_string()).await;
                return Err(e);
            }
        };

        let result = match verb {
            Verb::Create => reconciler::create(&mut scope).await,
            Verb::Update => reconciler::update(&mut scope).await,
            Verb::Delete => reconciler::delete(&mut scope).await,
        };

        let patched = match scope.patch_machine().await {
            Ok(patched) => patched,
            Err(e) if result.is_ok() => {
                self.publish_failure(&object, verb, &e.to_string()).await;
                return Err(e);
            }
            Err(e) => {
                warn!(machine = %machine.name_any(), error = %e, "failed to patch machine");
                false
            }
        };

        match result {
            Ok(()) => {
                if verb != Verb::Update || patched {
                    self.events
                        .publish(&object, MachineEvent::succeeded(verb))
                        .await;
                }
                Ok(())
            }
            Err(e) => {
                if !e.is_requeue() {
                    self.publish_failure(&object, verb, &e.to_string()).await;
                }
                Err(e)
            }
        }
    }

    async fn publish_failure(&self, object: &ObjectReference, verb: Verb, message: &str) {
        self.events
            .publish(object, MachineEvent::failed(verb, message))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, CREDENTIALS_SECRET, MACHINE_NAME, MACHINE_UID, NAMESPACE};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use vsphere_client::PowerState;

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<MachineEvent>>,
    }

    impl RecordingPublisher {
        fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .expect("mutex should not be poisoned")
                .iter()
                .map(|event| event.reason().to_string())
                .collect()
        }

        fn warnings(&self) -> usize {
            self.events
                .lock()
                .expect("mutex should not be poisoned")
                .iter()
                .filter(|event| event.is_warning())
                .count()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, _machine: &ObjectReference, event: MachineEvent) {
            self.events
                .lock()
                .expect("mutex should not be poisoned")
                .push(event);
        }
    }

    fn actuator(h: &Harness) -> (Actuator, Arc<RecordingPublisher>) {
        let events = Arc::new(RecordingPublisher::default());
        let actuator = Actuator::new(
            h.kube.clone(),
            h.sessions.clone(),
            h.gates.clone(),
            events.clone(),
        );
        (actuator, events)
    }

    #[tokio::test]
    async fn create_records_task_and_event() {
        let h = Harness::new();
        let (actuator, events) = actuator(&h);
        let machine = h.store(h.machine());

        actuator.create(&machine).await.unwrap();

        assert_eq!(h.sim.clone_requests().len(), 1);
        assert_eq!(events.reasons(), vec!["Create".to_string()]);
        assert_eq!(h.kube.status_patches(), 1);
    }

    #[tokio::test]
    async fn configuration_error_records_warning() {
        let h = Harness::new();
        let (actuator, events) = actuator(&h);
        let mut machine = h.machine();
        machine.metadata.labels = None;
        let machine = h.store(machine);

        let err = actuator.create(&machine).await.unwrap_err();
        assert!(err.is_invalid_configuration());
        assert_eq!(events.reasons(), vec!["FailedCreate".to_string()]);
        assert_eq!(events.warnings(), 1);
    }

    #[tokio::test]
    async fn scope_failure_records_warning() {
        let h = Harness::new();
        h.kube.remove_secret(NAMESPACE, CREDENTIALS_SECRET);
        let (actuator, events) = actuator(&h);
        let machine = h.store(h.machine());

        actuator.update(&machine).await.unwrap_err();
        assert_eq!(events.reasons(), vec!["FailedUpdate".to_string()]);
    }

    #[tokio::test]
    async fn update_event_only_when_machine_changed() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        let (actuator, events) = actuator(&h);
        h.store(h.machine());

        actuator.update(&h.stored()).await.unwrap();
        actuator.update(&h.stored()).await.unwrap();

        assert_eq!(events.reasons(), vec!["Update".to_string()]);
    }

    #[tokio::test]
    async fn delete_in_progress_is_not_reported() {
        let h = Harness::new();
        h.sim.set_auto_complete(true);
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        let (actuator, events) = actuator(&h);
        h.store(h.machine());

        // power off, destroy, then gone
        assert!(actuator.delete(&h.stored()).await.unwrap_err().is_requeue());
        assert!(actuator.delete(&h.stored()).await.unwrap_err().is_requeue());
        actuator.delete(&h.stored()).await.unwrap();

        assert_eq!(events.reasons(), vec!["Delete".to_string()]);
        assert!(h.sim.vm_by_name(MACHINE_NAME).is_none());
    }

    #[tokio::test]
    async fn exists_reports_vm_presence() {
        let h = Harness::new();
        let (actuator, _) = actuator(&h);
        h.store(h.machine());
        assert!(!actuator.exists(&h.stored()).await.unwrap());

        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        assert!(actuator.exists(&h.stored()).await.unwrap());
    }
}
