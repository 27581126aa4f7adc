//! Common types for the vSphere machine actuator: CRDs, well-known labels and
//! annotations, feature gates, events and telemetry setup.

#![deny(missing_docs)]

pub mod crd;
pub mod events;
pub mod feature_gates;
pub mod telemetry;

pub use feature_gates::{Feature, FeatureGates};

/// Label carrying the cluster identifier every Machine must have
pub const MACHINE_CLUSTER_ID_LABEL: &str = "machine.openshift.io/cluster-api-cluster";

/// Label carrying the region derived from vCenter tags
pub const MACHINE_REGION_LABEL: &str = "machine.openshift.io/region";

/// Label carrying the zone derived from vCenter tags
pub const MACHINE_ZONE_LABEL: &str = "machine.openshift.io/zone";

/// Annotation recording the last observed VM power state
pub const INSTANCE_STATE_ANNOTATION: &str = "machine.openshift.io/instance-state";

/// Annotation that, when present, skips node draining before deletion
pub const EXCLUDE_NODE_DRAINING_ANNOTATION: &str = "machine.openshift.io/exclude-node-draining";

/// Finalizer the machine controller keeps on every Machine it manages
pub const MACHINE_FINALIZER: &str = "machine.machine.openshift.io";

/// Finalizer placed on IPAddressClaims created for a Machine
pub const IP_CLAIM_PROTECTION_FINALIZER: &str = "machine.openshift.io/ip-claim-protection";

/// Label linking an IPAddressClaim back to the Machine it was created for
pub const IP_CLAIM_MACHINE_LABEL: &str = "machine.openshift.io/machine-name";

/// Namespace holding cluster-wide configuration (cloud config ConfigMap)
pub const OPENSHIFT_CONFIG_NAMESPACE: &str = "openshift-config";

/// Name of the cluster-scoped Infrastructure singleton
pub const INFRASTRUCTURE_NAME: &str = "cluster";
