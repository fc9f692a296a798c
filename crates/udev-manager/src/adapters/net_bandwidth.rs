use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use regex::Regex;
use tracing::debug;

use super::captures;
use super::link_health;
use super::matching_interface;
use crate::discovery::Device;
use crate::discovery::SYSATTR_SPEED;
use crate::resource::AdapterError;
use crate::resource::AllocateError;
use crate::resource::Allocation;
use crate::resource::DeviceAdapter;
use crate::resource::Health;
use crate::resource::Instance;
use crate::resource::InstanceId;
use crate::resource::ResourceTemplate;
use crate::resource::SharedInstance;
use crate::resource::Topology;

/// Network interfaces split into fixed-size bandwidth shares.
pub struct NetBandwidth {
    domain: String,
    matcher: Regex,
    mbps_per_share: u64,
}

impl NetBandwidth {
    pub fn new(domain: impl Into<String>, matcher: Regex, mbps_per_share: u64) -> Self {
        Self {
            domain: domain.into(),
            matcher,
            mbps_per_share,
        }
    }
}

impl DeviceAdapter for NetBandwidth {
    fn name(&self) -> &str {
        "net-bandwidth"
    }

    fn template(&self, device: &Device) -> Option<ResourceTemplate> {
        let ifname = matching_interface(device, &self.matcher)?;
        let groups = captures(&self.matcher, ifname)?;
        Some(ResourceTemplate::new(
            self.domain.clone(),
            format!("netbw-{}", groups.join("_")),
        ))
    }

    fn instances(&self, device: &Device) -> Result<Vec<SharedInstance>, Report<AdapterError>> {
        let Some(ifname) = matching_interface(device, &self.matcher) else {
            return Ok(vec![]);
        };

        // link speed is -1 or absent while the interface is down
        let Some(speed) = device
            .system_attribute(SYSATTR_SPEED)
            .and_then(|speed| speed.parse::<i64>().ok())
        else {
            debug!(interface = ifname, "link speed is unknown");
            return Ok(vec![]);
        };
        let shares = u64::try_from(speed).unwrap_or(0) / self.mbps_per_share.max(1);

        Ok((0..shares)
            .map(|idx| {
                Arc::new(BandwidthShare {
                    ifname: ifname.to_string(),
                    idx,
                    device: device.clone(),
                }) as SharedInstance
            })
            .collect())
    }
}

#[derive(Debug)]
struct BandwidthShare {
    ifname: String,
    idx: u64,
    device: Device,
}

#[async_trait]
impl Instance for BandwidthShare {
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
        Ok(Allocation::default())
    }
}
