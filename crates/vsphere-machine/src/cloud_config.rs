//! Region/zone tag category names from the cluster's cloud provider config
//!
//! The Infrastructure object `cluster` points at a ConfigMap in
//! `openshift-config`. Its value is either the legacy INI form
//!
//! ```text
//! [Labels]
//! region = "k8s-region"
//! zone = "k8s-zone"
//! ```
//!
//! or the YAML form with a top-level `labels:` map.

use serde::Deserialize;
use tracing::debug;

use machine_api_common::{INFRASTRUCTURE_NAME, OPENSHIFT_CONFIG_NAMESPACE};

use crate::client::KubeClient;
use crate::error::{Error, Result};

/// Tag category names that carry the region and zone of an inventory object
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RegionZoneLabels {
    /// Category name for regions
    #[serde(default)]
    pub region: Option<String>,
    /// Category name for zones
    #[serde(default)]
    pub zone: Option<String>,
}

impl RegionZoneLabels {
    /// Whether neither category is configured
    pub fn is_empty(&self) -> bool {
        self.region.is_none() && self.zone.is_none()
    }
}

#[derive(Deserialize)]
struct YamlConfig {
    #[serde(default)]
    labels: Option<RegionZoneLabels>,
}

/// Parse either config format
pub fn parse(contents: &str) -> Result<RegionZoneLabels> {
    if contents.trim().is_empty() {
        return Ok(RegionZoneLabels::default());
    }
    if is_ini(contents) {
        return Ok(parse_ini(contents));
    }
    let config: YamlConfig = serde_yaml::from_str(contents)
        .map_err(|e| Error::serialization(format!("failed to parse cloud config: {e}")))?;
    Ok(config.labels.map(non_empty).unwrap_or_default())
}

fn is_ini(contents: &str) -> bool {
    contents
        .lines()
        .map(str::trim)
        .any(|l| l.starts_with('[') && l.ends_with(']') && !l.contains(','))
}

fn parse_ini(contents: &str) -> RegionZoneLabels {
    let mut labels = RegionZoneLabels::default();
    let mut in_labels = false;
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_labels = line[1..line.len() - 1].trim().eq_ignore_ascii_case("labels");
            continue;
        }
        if !in_labels {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "region" => labels.region = Some(value),
            "zone" => labels.zone = Some(value),
            _ => {}
        }
    }
    non_empty(labels)
}

fn non_empty(labels: RegionZoneLabels) -> RegionZoneLabels {
    RegionZoneLabels {
        region: labels.region.filter(|r| !r.is_empty()),
        zone: labels.zone.filter(|z| !z.is_empty()),
    }
}

/// Read the configured category names
///
/// A missing Infrastructure object, cloud config reference, ConfigMap or key
/// yields empty labels; region/zone discovery is then skipped.
pub async fn region_zone_labels(kube: &dyn KubeClient) -> Result<RegionZoneLabels> {
    let Some(infrastructure) = kube.get_infrastructure(INFRASTRUCTURE_NAME).await? else {
        debug!("infrastructure object not found, skipping region/zone labels");
        return Ok(RegionZoneLabels::default());
    };
    let Some(reference) = infrastructure.spec.cloud_config.as_ref() else {
        return Ok(RegionZoneLabels::default());
    };
    if reference.name.is_empty() {
        return Ok(RegionZoneLabels::default());
    }

    let Some(config_map) = kube
        .get_config_map(OPENSHIFT_CONFIG_NAMESPACE, &reference.name)
        .await?
    else {
        debug!(config_map = %reference.name, "cloud config not found, skipping region/zone labels");
        return Ok(RegionZoneLabels::default());
    };

    match config_map
        .data
        .as_ref()
        .and_then(|d| d.get(reference.key_or_default()))
    {
        Some(contents) => parse(contents),
        None => Ok(RegionZoneLabels::default()),
    }
}
