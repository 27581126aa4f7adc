//! Custom Resource Definitions consumed and mutated by the actuator.

mod infrastructure;
mod ipam;
mod machine;
mod provider;
mod types;

pub use infrastructure::{
    ConfigMapFileReference, Infrastructure, InfrastructureSpec, InfrastructureStatus,
};
pub use ipam::{
    IPAddress, IPAddressClaim, IPAddressClaimSpec, IPAddressClaimStatus, IPAddressSpec,
    LocalObjectReference, TypedLocalObjectReference,
};
pub use machine::{
    phases, AddressType, Machine, MachineAddress, MachineSpec, MachineStatus, NodeReference,
    ProviderSpec,
};
pub use provider::{
    AddressesFromPool, CloneMode, DataDisk, LocalSecretReference, NetworkDeviceSpec, NetworkSpec,
    ProvisioningMode, VSphereMachineProviderSpec, VSphereMachineProviderStatus, Workspace,
};
pub use types::{
    condition_types, reasons, ConditionStatus, InstanceState, ProviderCondition,
};
