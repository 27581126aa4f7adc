//! Feature gates controlling optional provider spec fields
//!
//! Parsed from a `Name=bool,Name=bool` list. Unknown names are rejected so a
//! typo on the command line fails at startup rather than silently.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Optional features the actuator understands
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// Static IP addresses and IPAM pools on NICs
    VSphereStaticIPs,
    /// `workspace.vmGroup` placement
    VSphereHostVMGroupZonal,
    /// `dataDisks` on the provider spec
    VSphereMultiDisk,
}

impl Feature {
    /// All known features
    pub const ALL: [Feature; 3] = [
        Feature::VSphereStaticIPs,
        Feature::VSphereHostVMGroupZonal,
        Feature::VSphereMultiDisk,
    ];

    /// Gate name as written on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Feature::VSphereStaticIPs => "VSphereStaticIPs",
            Feature::VSphereHostVMGroupZonal => "VSphereHostVMGroupZonal",
            Feature::VSphereMultiDisk => "VSphereMultiDisk",
        }
    }

    /// Value used when the gate is not mentioned
    pub fn default_enabled(&self) -> bool {
        matches!(self, Feature::VSphereStaticIPs)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors parsing a feature gate list
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureGateError {
    /// Entry is not of the form `Name=bool`
    #[error("malformed feature gate entry '{0}', expected Name=true|false")]
    Malformed(String),

    /// Gate name is not recognised
    #[error("unknown feature gate '{0}'")]
    Unknown(String),
}

/// Resolved set of feature gates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureGates {
    gates: BTreeMap<Feature, bool>,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            gates: Feature::ALL
                .iter()
                .map(|f| (*f, f.default_enabled()))
                .collect(),
        }
    }
}

impl FeatureGates {
    /// Gates with every feature enabled
    pub fn all_enabled() -> Self {
        Self {
            gates: Feature::ALL.iter().map(|f| (*f, true)).collect(),
        }
    }

    /// Override a single gate
    pub fn with(mut self, feature: Feature, enabled: bool) -> Self {
        self.gates.insert(feature, enabled);
        self
    }

    /// Whether `feature` is enabled
    pub fn enabled(&self, feature: Feature) -> bool {
        self.gates
            .get(&feature)
            .copied()
            .unwrap_or_else(|| feature.default_enabled())
    }
}

impl FromStr for FeatureGates {
    type Err = FeatureGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut gates = FeatureGates::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| FeatureGateError::Malformed(entry.to_string()))?;
            let enabled: bool = value
                .trim()
                .parse()
                .map_err(|_| FeatureGateError::Malformed(entry.to_string()))?;
            let feature = Feature::ALL
                .iter()
                .find(|f| f.name() == name.trim())
                .ok_or_else(|| FeatureGateError::Unknown(name.trim().to_string()))?;
            gates.gates.insert(*feature, enabled);
        }
        Ok(gates)
    }
}

impl fmt::Display for FeatureGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .gates
            .iter()
            .map(|(feature, enabled)| format!("{feature}={enabled}"))
            .collect();
        f.write_str(&rendered.join(","))
    }
}
