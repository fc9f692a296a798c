use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use regex::Regex;
use tracing::debug;
use tracing::info;

use super::captures;
use crate::discovery::Device;
use crate::discovery::DeviceLookup;
use crate::discovery::BLOCK_SUBSYSTEM;
use crate::discovery::DEVTYPE_PARTITION;
use crate::discovery::PROPERTY_PARTNAME;
use crate::discovery::PROPERTY_SHORT_SERIAL;
use crate::discovery::SYSATTR_MODEL;
use crate::discovery::SYSATTR_SERIAL;
use crate::discovery::SYSATTR_WWID;
use crate::resource::AdapterError;
use crate::resource::AllocateError;
use crate::resource::Allocation;
use crate::resource::DeviceAdapter;
use crate::resource::DeviceSpec;
use crate::resource::Health;
use crate::resource::Instance;
use crate::resource::InstanceId;
use crate::resource::ResourceTemplate;
use crate::resource::SharedInstance;
use crate::resource::Topology;

/// Block partitions selected by their `PARTNAME` label.
pub struct Partitions {
    domain: String,
    matcher: Regex,
    lookup: Arc<dyn DeviceLookup>,
    topology_hints: bool,
}

impl Partitions {
    pub fn new(
        domain: impl Into<String>,
        matcher: Regex,
        lookup: Arc<dyn DeviceLookup>,
        topology_hints: bool,
    ) -> Self {
        Self {
            domain: domain.into(),
            matcher,
            lookup,
            topology_hints,
        }
    }

    /// Partition label and its capture groups, when the device is a matching
    /// partition.
    fn label<'a>(&self, device: &'a Device) -> Option<(&'a str, Vec<String>)> {
        if device.subsystem() != BLOCK_SUBSYSTEM || device.devtype() != DEVTYPE_PARTITION {
            return None;
        }
        let label = device.property(PROPERTY_PARTNAME)?;
        let groups = captures(&self.matcher, label)?;
        Some((label, groups))
    }
}

impl DeviceAdapter for Partitions {
    fn name(&self) -> &str {
        "partition"
    }

    fn template(&self, device: &Device) -> Option<ResourceTemplate> {
        let (_, groups) = self.label(device)?;
        Some(ResourceTemplate::new(
            self.domain.clone(),
            format!("part-{}", groups.join("_")),
        ))
    }

    fn instances(&self, device: &Device) -> Result<Vec<SharedInstance>, Report<AdapterError>> {
        let Some((label, groups)) = self.label(device) else {
            return Ok(vec![]);
        };
        let label = groups.into_iter().next().unwrap_or_else(|| label.to_string());

        let topology = if self.topology_hints {
            device.numa_node(self.lookup.as_ref()).map(|node| Topology {
                numa_nodes: vec![i64::from(node)],
            })
        } else {
            None
        };

        Ok(vec![Arc::new(Partition {
            domain: self.domain.clone(),
            label,
            device: device.clone(),
            topology,
            lookup: Arc::clone(&self.lookup),
        })])
    }
}

/// Upper-cases and replaces `.` and `-` with `_`.
fn sanitize_env(s: &str) -> String {
    s.replace(['.', '-'], "_").to_uppercase()
}

struct Partition {
    domain: String,
    label: String,
    device: Device,
    topology: Option<Topology>,
    lookup: Arc<dyn DeviceLookup>,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("domain", &self.domain)
            .field("label", &self.label)
            .field("device", &self.device.id())
            .finish()
    }
}

impl Partition {
    fn env_name(&self, env: &str) -> String {
        format!(
            "{}_PART_{}_{}",
            sanitize_env(&self.domain),
            sanitize_env(&self.label),
            sanitize_env(env)
        )
    }

    fn container_path(&self) -> PathBuf {
        ["/dev", "allocated", self.domain.as_str(), "part", self.label.as_str()]
            .iter()
            .collect()
    }
}

#[async_trait]
impl Instance for Partition {
    fn id(&self) -> InstanceId {
        InstanceId::new(self.label.clone())
    }

    fn health(&self) -> Health {
        Health::Healthy
    }

    fn topology(&self) -> Option<Topology> {
        self.topology.clone()
    }

    async fn allocate(&self) -> Result<Allocation, Report<AllocateError>> {
        let host_path = self
            .device
            .devnode()
            .ok_or_else(|| Report::new(AllocateError::MissingDeviceNode(self.id())))?;
        let container_path = self.container_path();
        let lookup = self.lookup.as_ref();

        let mut envs = BTreeMap::new();
        envs.insert(
            self.env_name("PATH"),
            container_path.to_string_lossy().into_owned(),
        );
        envs.insert(
            self.env_name("DISK_ID"),
            self.device
                .system_attribute_lookup(SYSATTR_WWID, lookup)
                .unwrap_or_default(),
        );
        envs.insert(
            self.env_name("DISK_MODEL"),
            self.device
                .system_attribute_lookup(SYSATTR_MODEL, lookup)
                .unwrap_or_default(),
        );
        let serial = self
            .device
            .system_attribute_lookup(SYSATTR_SERIAL, lookup)
            .or_else(|| self.device.property_lookup(PROPERTY_SHORT_SERIAL, lookup));
        if let Some(serial) = serial {
            envs.insert(self.env_name("DISK_SERIAL"), serial);
        }

        let allocation = Allocation {
            devices: vec![DeviceSpec {
                host_path: host_path.to_path_buf(),
                container_path,
                permissions: "rw".to_string(),
            }],
            envs,
            ..Allocation::default()
        };

        info!("allocated partition {}", self.label);
        debug!("{allocation:?}");
        Ok(allocation)
    }
}
