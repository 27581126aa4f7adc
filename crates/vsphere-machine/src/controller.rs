//! Machine controller
//!
//! Drives the [`Actuator`] from a `kube::runtime::Controller` and keeps the
//! Machine's phase, finalizer and terminal error fields.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument};

use machine_api_common::crd::{phases, Machine};
use machine_api_common::events::{EventPublisher, KubeEventPublisher};
use machine_api_common::{FeatureGates, MACHINE_FINALIZER};
use vsphere_client::{SessionCache, VCenterConnector};

use crate::actuator::Actuator;
use crate::client::{KubeClient, KubeClientImpl};
use crate::error::{Error, Result, DEFAULT_REQUEUE_AFTER};

/// Name the controller reports events as
pub const CONTROLLER_NAME: &str = "vsphere-controller";

/// Default period between reconciles of a provisioned Machine
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

const MISSING_INSTANCE: &str = "Can't find created instance.";

/// Shared state for the Machine controller
pub struct Context {
    /// Kubernetes client for finalizers and phase bookkeeping
    pub kube: Arc<dyn KubeClient>,
    /// Actuator performing the vCenter work
    pub actuator: Actuator,
    /// Requeue period once a Machine is provisioned
    pub resync_period: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a fake Kubernetes client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, actuator: Actuator) -> Self {
        Self {
            kube,
            actuator,
            resync_period: DEFAULT_RESYNC_PERIOD,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    sessions: Option<Arc<SessionCache>>,
    events: Option<Arc<dyn EventPublisher>>,
    feature_gates: FeatureGates,
    resync_period: Duration,
    insecure: bool,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            sessions: None,
            events: None,
            feature_gates: FeatureGates::default(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            insecure: false,
        }
    }

    /// Enabled feature gates
    pub fn feature_gates(mut self, gates: FeatureGates) -> Self {
        self.feature_gates = gates;
        self
    }

    /// Requeue period once a Machine is provisioned
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Skip vCenter certificate verification
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the session cache, e.g. to point at a simulator
    pub fn sessions(mut self, sessions: Arc<SessionCache>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let sessions = self.sessions.unwrap_or_else(|| {
            Arc::new(SessionCache::new(Arc::new(VCenterConnector {
                insecure: self.insecure,
            })))
        });
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME)));
        Context {
            actuator: Actuator::new(kube.clone(), sessions, self.feature_gates, events),
            kube,
            resync_period: self.resync_period,
        }
    }
}

fn has_finalizer(machine: &Machine) -> bool {
    machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER)
}

/// Patch `status.phase`, clearing or setting the terminal error fields
async fn set_phase(
    kube: &dyn KubeClient,
    machine: &Machine,
    phase: &str,
    failure: Option<(&str, String)>,
) -> Result<()> {
    if machine.phase() == Some(phase) && failure.is_none() {
        return Ok(());
    }
    let (reason, message) = match failure {
        Some((reason, message)) => (Some(reason.to_string()), Some(message)),
        None => (None, None),
    };
    info!(phase, "setting machine phase");
    kube.merge_machine_status(
        &machine.namespace().unwrap_or_default(),
        &machine.name_any(),
        &json!({
            "status": {
                "phase": phase,
                "errorReason": reason,
                "errorMessage": message,
                "lastUpdated": Utc::now(),
            }
        }),
    )
    .await
}

/// Reconcile a Machine
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let name = machine.name_any();
    let namespace = machine.namespace().unwrap_or_default();
    debug!("reconciling machine");

    if machine.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(&machine) {
            return Ok(Action::await_change());
        }
        set_phase(ctx.kube.as_ref(), &machine, phases::DELETING, None).await?;
        ctx.actuator.delete(&machine).await?;
        ctx.kube
            .remove_machine_finalizer(&namespace, &name, MACHINE_FINALIZER)
            .await?;
        info!("machine deleted");
        return Ok(Action::await_change());
    }

    if !has_finalizer(&machine) {
        ctx.kube
            .add_machine_finalizer(&namespace, &name, MACHINE_FINALIZER)
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if machine.phase() == Some(phases::FAILED) {
        debug!("machine failed, waiting for user intervention");
        return Ok(Action::await_change());
    }

    let mut machine = (*machine).clone();
    if machine.phase().is_none() {
        set_phase(ctx.kube.as_ref(), &machine, phases::PROVISIONING, None).await?;
        machine.status.get_or_insert_with(Default::default).phase =
            Some(phases::PROVISIONING.to_string());
    }

    if ctx.actuator.exists(&machine).await? {
        ctx.actuator.update(&machine).await?;
        let phase = if machine.node_name().is_some() {
            phases::RUNNING
        } else {
            phases::PROVISIONED
        };
        set_phase(ctx.kube.as_ref(), &machine, phase, None).await?;
        return Ok(Action::requeue(ctx.resync_period));
    }

    if matches!(machine.phase(), Some(phases::PROVISIONED | phases::RUNNING)) {
        error!("instance for provisioned machine is gone");
        set_phase(
            ctx.kube.as_ref(),
            &machine,
            phases::FAILED,
            Some(("InvalidConfiguration", MISSING_INSTANCE.to_string())),
        )
        .await?;
        return Ok(Action::await_change());
    }

    match ctx.actuator.create(&machine).await {
        Ok(()) => Ok(Action::requeue(DEFAULT_REQUEUE_AFTER)),
        Err(e) if e.is_fatal() || e.is_invalid_configuration() => {
            error!(error = %e, "machine creation failed permanently");
            set_phase(
                ctx.kube.as_ref(),
                &machine,
                phases::FAILED,
                Some((e.reason(), e.to_string())),
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Error policy for Machine reconciliation
pub fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<Context>) -> Action {
    if let Some(after) = error.requeue_after() {
        debug!(machine = %machine.name_any(), %error, "requeuing");
        return Action::requeue(after);
    }
    error!(?error, machine = %machine.name_any(), "reconciliation failed");
    if !error.is_retryable() {
        return Action::await_change();
    }
    Action::requeue(DEFAULT_REQUEUE_AFTER)
}
