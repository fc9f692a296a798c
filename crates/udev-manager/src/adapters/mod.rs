//! Device-family adapters.
//!
//! Each adapter decides which resource bucket a device belongs to and which
//! allocatable instances it contributes:
//!
//! - [`Partitions`]: labelled block partitions, one instance per partition
//! - [`NetBandwidth`]: network interfaces split into bandwidth shares
//! - [`NetRdma`]: RDMA-capable interfaces exposing their character devices

mod net_bandwidth;
mod net_rdma;
mod partition;

use std::path::Path;

use regex::Regex;
use tracing::trace;

pub use self::net_bandwidth::NetBandwidth;
pub use self::net_rdma::NetRdma;
pub use self::net_rdma::RdmaMap;
pub use self::partition::Partitions;
use crate::discovery::Device;
use crate::discovery::NET_SUBSYSTEM;
use crate::discovery::PROPERTY_INTERFACE;
use crate::discovery::SYSATTR_OPERSTATE;
use crate::resource::Health;

/// Capture groups of `matcher` against `value`, or `None` without a match.
///
/// Groups that did not participate in the match read as empty strings.
fn captures(matcher: &Regex, value: &str) -> Option<Vec<String>> {
    let caps = matcher.captures(value)?;
    Some(
        caps.iter()
            .skip(1)
            .map(|group| group.map_or_else(String::new, |m| m.as_str().to_string()))
            .collect(),
    )
}

/// Interface name of a network device matching `matcher`.
fn matching_interface<'a>(device: &'a Device, matcher: &Regex) -> Option<&'a str> {
    if device.subsystem() != NET_SUBSYSTEM {
        return None;
    }
    device
        .property(PROPERTY_INTERFACE)
        .filter(|ifname| matcher.is_match(ifname))
}

/// Healthy while the link is up.
///
/// Reads `operstate` from sysfs on every call. An interface whose attribute
/// cannot be read is gone or going away and reports unhealthy; the value
/// captured in the device snapshot is never consulted.
fn link_health(device: &Device) -> Health {
    let path = Path::new(device.id().as_str()).join(SYSATTR_OPERSTATE);
    match std::fs::read_to_string(&path) {
        Ok(state) if state.trim() == "up" => Health::Healthy,
        Ok(_) => Health::Unhealthy,
        Err(e) => {
            trace!("failed to read {}: {e}", path.display());
            Health::Unhealthy
        }
    }
}
