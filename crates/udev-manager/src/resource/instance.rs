use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire representation understood by the kubelet.
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance id, unique within one resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// NUMA affinity hint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub numa_nodes: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub permissions: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

/// What a container needs to use an allocated instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub devices: Vec<DeviceSpec>,
    pub mounts: Vec<Mount>,
    pub envs: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Allocation {
    /// Appends device specs and mounts; later env vars and annotations win.
    pub fn merge(&mut self, other: Allocation) {
        self.devices.extend(other.devices);
        self.mounts.extend(other.mounts);
        self.envs.extend(other.envs);
        self.annotations.extend(other.annotations);
    }
}

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("device node is missing for instance {0}")]
    MissingDeviceNode(InstanceId),
    #[error("failed to allocate instance {0}")]
    Failed(InstanceId),
}

/// One allocatable unit of a resource.
#[async_trait]
pub trait Instance: Send + Sync + fmt::Debug {
    fn id(&self) -> InstanceId;

    /// Live health as probed by the instance itself.
    fn health(&self) -> Health;

    fn topology(&self) -> Option<Topology>;

    async fn allocate(&self) -> Result<Allocation, Report<AllocateError>>;
}

pub type SharedInstance = Arc<dyn Instance>;

/// Instance together with the last explicit verdict for its id.
///
/// An explicit `Unhealthy` verdict overrides the live probe until an explicit
/// `Healthy` verdict replaces it.
#[derive(Debug, Clone)]
pub struct TrackedInstance {
    pub instance: SharedInstance,
    pub verdict: Health,
}

impl TrackedInstance {
    pub fn new(instance: SharedInstance, verdict: Health) -> Self {
        Self { instance, verdict }
    }

    pub fn health(&self) -> Health {
        match self.verdict {
            Health::Unhealthy => Health::Unhealthy,
            Health::Healthy => self.instance.health(),
        }
    }
}

pub type InstanceTable = BTreeMap<InstanceId, TrackedInstance>;

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Debug)]
    struct Probe(Health);

    #[async_trait]
    impl Instance for Probe {
        fn id(&self) -> InstanceId {
            InstanceId::from("probe")
        }

        fn health(&self) -> Health {
            self.0
        }

        fn topology(&self) -> Option<Topology> {
            None
        }

        async fn allocate(&self) -> Result<Allocation, Report<AllocateError>> {
            Ok(Allocation::default())
        }
    }

    #[test]
    fn unhealthy_verdict_overrides_live_health() {
        let live_healthy = Arc::new(Probe(Health::Healthy));
        let live_unhealthy = Arc::new(Probe(Health::Unhealthy));

        assert_eq!(
            TrackedInstance::new(live_healthy.clone(), Health::Unhealthy).health(),
            Health::Unhealthy
        );
        assert_eq!(
            TrackedInstance::new(live_healthy, Health::Healthy).health(),
            Health::Healthy
        );
        assert_eq!(
            TrackedInstance::new(live_unhealthy, Health::Healthy).health(),
            Health::Unhealthy,
            "a healthy verdict still defers to the live probe"
        );
    }

    #[test]
    fn merge_appends_lists_and_overwrites_maps() {
        let spec = |n: &str| DeviceSpec {
            host_path: PathBuf::from(format!("/dev/{n}")),
            container_path: PathBuf::from(format!("/dev/{n}")),
            permissions: "rw".to_string(),
        };
        let mut first = Allocation {
            devices: vec![spec("a")],
            envs: BTreeMap::from([("K".to_string(), "1".to_string())]),
            ..Allocation::default()
        };
        let second = Allocation {
            devices: vec![spec("b")],
            envs: BTreeMap::from([
                ("K".to_string(), "2".to_string()),
                ("L".to_string(), "3".to_string()),
            ]),
            annotations: BTreeMap::from([("note".to_string(), "x".to_string())]),
            ..Allocation::default()
        };

        first.merge(second);

        assert_eq!(first.devices, vec![spec("a"), spec("b")]);
        assert_eq!(
            first.envs,
            BTreeMap::from([
                ("K".to_string(), "2".to_string()),
                ("L".to_string(), "3".to_string()),
            ])
        );
        assert_eq!(first.annotations.len(), 1);
    }

    #[test]
    fn health_wire_strings() {
        assert_eq!(Health::Healthy.as_str(), "Healthy");
        assert_eq!(Health::Unhealthy.to_string(), "Unhealthy");
    }
}
