use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use regex::Regex;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::captures;
use super::link_health;
use super::matching_interface;
use crate::discovery::Device;
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

const RDMA_CM: &str = "rdma_cm";

/// Resolves network interfaces to their RDMA character devices through sysfs.
#[derive(Debug, Clone)]
pub struct RdmaMap {
    sysfs: PathBuf,
    devfs: PathBuf,
}

impl Default for RdmaMap {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

impl RdmaMap {
    pub fn new(sysfs: impl Into<PathBuf>, devfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            devfs: devfs.into(),
        }
    }

    /// Name of the RDMA device backing `ifname`, e.g. `mlx5_0`.
    pub fn rdma_device(&self, ifname: &str) -> Result<String, Report<AdapterError>> {
        let dir = self
            .sysfs
            .join("class/net")
            .join(ifname)
            .join("device/infiniband");

        let mut names: Vec<String> = fs::read_dir(&dir)
            .change_context(AdapterError::Resolve(ifname.to_string()))
            .attach_printable_lazy(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        names.into_iter().next().ok_or_else(|| {
            Report::new(AdapterError::Resolve(ifname.to_string()))
                .attach_printable(format!("no rdma device under {}", dir.display()))
        })
    }

    /// Character devices of `rdma_device`: its `uverbs`, `umad` and `issm`
    /// nodes plus the shared `rdma_cm` node when present.
    pub fn char_devices(&self, rdma_device: &str) -> Vec<PathBuf> {
        let mut devices = self.class_devices("infiniband_verbs", "uverbs", rdma_device);
        devices.extend(self.class_devices("infiniband_mad", "umad", rdma_device));
        devices.extend(self.class_devices("infiniband_mad", "issm", rdma_device));

        let rdma_cm = self.devfs.join("infiniband").join(RDMA_CM);
        if rdma_cm.exists() {
            devices.push(rdma_cm);
        }
        devices
    }

    /// Device nodes for entries of `/sys/class/<class>/<prefix>N` whose
    /// `ibdev` names `rdma_device`.
    fn class_devices(&self, class: &str, prefix: &str, rdma_device: &str) -> Vec<PathBuf> {
        let dir = self.sysfs.join("class").join(class);
        let Ok(entries) = fs::read_dir(&dir) else {
            debug!("{} is not readable", dir.display());
            return vec![];
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(prefix))
            .filter(|name| ibdev(&dir.join(name)).as_deref() == Some(rdma_device))
            .collect();
        names.sort();

        names
            .into_iter()
            .map(|name| self.devfs.join("infiniband").join(name))
            .collect()
    }
}

fn ibdev(class_entry: &Path) -> Option<String> {
    fs::read_to_string(class_entry.join("ibdev"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// RDMA-capable network interfaces, each exposing a fixed number of
/// instances that grant its character devices.
pub struct NetRdma {
    domain: String,
    matcher: Regex,
    resources_count: usize,
    rdma: RdmaMap,
}

impl NetRdma {
    pub fn new(
        domain: impl Into<String>,
        matcher: Regex,
        resources_count: usize,
        rdma: RdmaMap,
    ) -> Self {
        Self {
            domain: domain.into(),
            matcher,
            resources_count,
            rdma,
        }
    }
}

impl DeviceAdapter for NetRdma {
    fn name(&self) -> &str {
        "net-rdma"
    }

    fn template(&self, device: &Device) -> Option<ResourceTemplate> {
        let ifname = matching_interface(device, &self.matcher)?;
        let groups = captures(&self.matcher, ifname)?;
        Some(ResourceTemplate::new(
            self.domain.clone(),
            format!("netrdma-{}", groups.join("_")),
        ))
    }

    fn instances(&self, device: &Device) -> Result<Vec<SharedInstance>, Report<AdapterError>> {
        let Some(ifname) = matching_interface(device, &self.matcher) else {
            return Ok(vec![]);
        };

        let rdma_device = match self.rdma.rdma_device(ifname) {
            Ok(rdma_device) => rdma_device,
            Err(e) => {
                error!(interface = ifname, "failed to get rdma device: {e:?}");
                return Ok(vec![]);
            }
        };
        let char_devices = Arc::new(self.rdma.char_devices(&rdma_device));
        info!(
            interface = ifname,
            rdma_device = %rdma_device,
            "found rdma character devices: {char_devices:?}"
        );

        Ok((0..self.resources_count)
            .map(|idx| {
                Arc::new(RdmaShare {
                    ifname: ifname.to_string(),
                    idx,
                    device: device.clone(),
                    char_devices: Arc::clone(&char_devices),
                }) as SharedInstance
            })
            .collect())
    }
}

#[derive(Debug)]
struct RdmaShare {
    ifname: String,
    idx: usize,
    device: Device,
    char_devices: Arc<Vec<PathBuf>>,
}

#[async_trait]
impl Instance for RdmaShare {
    fn id(&self) -> InstanceId {
        InstanceId::new(format!("{}_{}", self.ifname, self.idx))
    }

    fn health(&self) -> Health {
        link_health(&self.device)
    }

    fn topology(&self) -> Option<Topology> {
        None
    }

    async fn allocate(&self) -> Result<Allocation, Report<AllocateError>> {
        let devices = self
            .char_devices
            .iter()
            .map(|path| DeviceSpec {
                host_path: path.clone(),
                container_path: path.clone(),
                permissions: "rw".to_string(),
            })
            .collect();
        Ok(Allocation {
            devices,
            ..Allocation::default()
        })
    }
}
