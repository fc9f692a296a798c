use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

pub const BLOCK_SUBSYSTEM: &str = "block";
pub const NET_SUBSYSTEM: &str = "net";

pub const DEVTYPE_PARTITION: &str = "partition";

pub const PROPERTY_PARTNAME: &str = "PARTNAME";
pub const PROPERTY_SHORT_SERIAL: &str = "ID_SERIAL_SHORT";
pub const PROPERTY_INTERFACE: &str = "INTERFACE";

pub const SYSATTR_WWID: &str = "wwid";
pub const SYSATTR_MODEL: &str = "model";
pub const SYSATTR_SERIAL: &str = "serial";
pub const SYSATTR_SPEED: &str = "speed";
pub const SYSATTR_OPERSTATE: &str = "operstate";
pub const SYSATTR_NUMA_NODE: &str = "numa_node";

/// Attributes read eagerly when a device snapshot is taken.
pub const SNAPSHOT_SYSATTRS: &[&str] = &[
    SYSATTR_WWID,
    SYSATTR_MODEL,
    SYSATTR_SERIAL,
    SYSATTR_SPEED,
    SYSATTR_OPERSTATE,
    SYSATTR_NUMA_NODE,
];

// sysfs nesting is shallow; this only guards against malformed parent cycles
const MAX_PARENT_DEPTH: usize = 64;

/// Stable device identity: the kernel sys path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Resolves device identities to the last known device value.
pub trait DeviceLookup: Send + Sync {
    fn device_by_id(&self, id: &DeviceId) -> Option<Device>;
}

pub type DeviceTable = BTreeMap<DeviceId, Device>;

impl DeviceLookup for DeviceTable {
    fn device_by_id(&self, id: &DeviceId) -> Option<Device> {
        self.get(id).cloned()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct DeviceInfo {
    id: DeviceId,
    subsystem: String,
    devtype: String,
    devnode: Option<PathBuf>,
    devlinks: Vec<PathBuf>,
    properties: BTreeMap<String, String>,
    sysattrs: BTreeMap<String, String>,
    tags: Vec<String>,
    parent: Option<DeviceId>,
}

/// Immutable snapshot of one kernel device.
///
/// Cloning is cheap. A changed device is a new value with the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device(Arc<DeviceInfo>);

impl Device {
    pub fn builder(id: impl Into<DeviceId>) -> DeviceBuilder {
        DeviceBuilder {
            info: DeviceInfo {
                id: id.into(),
                subsystem: String::new(),
                devtype: String::new(),
                devnode: None,
                devlinks: Vec::new(),
                properties: BTreeMap::new(),
                sysattrs: BTreeMap::new(),
                tags: Vec::new(),
                parent: None,
            },
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.0.id
    }

    pub fn subsystem(&self) -> &str {
        &self.0.subsystem
    }

    pub fn devtype(&self) -> &str {
        &self.0.devtype
    }

    pub fn devnode(&self) -> Option<&Path> {
        self.0.devnode.as_deref()
    }

    pub fn devlinks(&self) -> &[PathBuf] {
        &self.0.devlinks
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.0.properties
    }

    pub fn system_attributes(&self) -> &BTreeMap<String, String> {
        &self.0.sysattrs
    }

    pub fn tags(&self) -> &[String] {
        &self.0.tags
    }

    pub fn parent_id(&self) -> Option<&DeviceId> {
        self.0.parent.as_ref()
    }

    /// Property on this device only; empty values read as absent.
    pub fn property(&self, key: &str) -> Option<&str> {
        non_empty(self.0.properties.get(key))
    }

    /// System attribute on this device only; empty values read as absent.
    pub fn system_attribute(&self, key: &str) -> Option<&str> {
        non_empty(self.0.sysattrs.get(key))
    }

    /// Resolves the parent against `lookup`; `None` when there is no parent
    /// or it is no longer known.
    pub fn parent(&self, lookup: &dyn DeviceLookup) -> Option<Device> {
        self.parent_id().and_then(|id| lookup.device_by_id(id))
    }

    /// Like [`Device::property`], falling back to the parent chain.
    pub fn property_lookup(&self, key: &str, lookup: &dyn DeviceLookup) -> Option<String> {
        self.walk(lookup, |device| device.property(key).map(str::to_owned))
    }

    /// Like [`Device::system_attribute`], falling back to the parent chain.
    pub fn system_attribute_lookup(&self, key: &str, lookup: &dyn DeviceLookup) -> Option<String> {
        self.walk(lookup, |device| device.system_attribute(key).map(str::to_owned))
    }

    /// NUMA node of the device or its nearest ancestor reporting one.
    ///
    /// The kernel reports `-1` when affinity is unknown.
    pub fn numa_node(&self, lookup: &dyn DeviceLookup) -> Option<u32> {
        self.system_attribute_lookup(SYSATTR_NUMA_NODE, lookup)
            .and_then(|node| node.parse::<i64>().ok())
            .and_then(|node| u32::try_from(node).ok())
    }

    fn walk<R>(
        &self,
        lookup: &dyn DeviceLookup,
        mut get: impl FnMut(&Device) -> Option<R>,
    ) -> Option<R> {
        let mut current = self.clone();
        for _ in 0..MAX_PARENT_DEPTH {
            if let Some(value) = get(&current) {
                return Some(value);
            }
            current = current.parent(lookup)?;
        }
        None
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

pub struct DeviceBuilder {
    info: DeviceInfo,
}

impl DeviceBuilder {
    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.info.subsystem = subsystem.into();
        self
    }

    pub fn devtype(mut self, devtype: impl Into<String>) -> Self {
        self.info.devtype = devtype.into();
        self
    }

    pub fn devnode(mut self, devnode: impl Into<PathBuf>) -> Self {
        self.info.devnode = Some(devnode.into());
        self
    }

    pub fn devlink(mut self, devlink: impl Into<PathBuf>) -> Self {
        self.info.devlinks.push(devlink.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.properties.insert(key.into(), value.into());
        self
    }

    pub fn system_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.sysattrs.insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.info.tags.push(tag.into());
        self
    }

    pub fn parent(mut self, parent: impl Into<DeviceId>) -> Self {
        self.info.parent = Some(parent.into());
        self
    }

    pub fn build(self) -> Device {
        Device(Arc::new(self.info))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn table(devices: impl IntoIterator<Item = Device>) -> DeviceTable {
        devices.into_iter().map(|d| (d.id().clone(), d)).collect()
    }

    #[test]
    fn empty_values_read_as_absent() {
        let device = Device::builder("/sys/a")
            .property("EMPTY", "")
            .system_attribute("padded", "  value\n")
            .build();

        assert_eq!(device.property("EMPTY"), None);
        assert_eq!(device.property("MISSING"), None);
        assert_eq!(device.system_attribute("padded"), Some("value"));
    }

    #[test]
    fn lookup_falls_back_to_parent_chain() {
        let root = Device::builder("/sys/root")
            .system_attribute(SYSATTR_NUMA_NODE, "1")
            .system_attribute(SYSATTR_WWID, "naa.5000")
            .build();
        let disk = Device::builder("/sys/root/disk")
            .parent("/sys/root")
            .system_attribute(SYSATTR_MODEL, "SAMSUNG")
            .build();
        let part = Device::builder("/sys/root/disk/part1")
            .parent("/sys/root/disk")
            .system_attribute(SYSATTR_MODEL, "")
            .build();
        let devices = table([root, disk, part.clone()]);

        assert_eq!(
            part.system_attribute_lookup(SYSATTR_MODEL, &devices),
            Some("SAMSUNG".to_string())
        );
        assert_eq!(
            part.system_attribute_lookup(SYSATTR_WWID, &devices),
            Some("naa.5000".to_string())
        );
        assert_eq!(part.numa_node(&devices), Some(1));
        assert_eq!(part.property_lookup("NOPE", &devices), None);
    }

    #[test]
    fn unknown_numa_node_is_none() {
        let device = Device::builder("/sys/a")
            .system_attribute(SYSATTR_NUMA_NODE, "-1")
            .build();
        assert_eq!(device.numa_node(&DeviceTable::new()), None);
    }

    #[test]
    fn missing_parent_stops_lookup() {
        let orphan = Device::builder("/sys/orphan").parent("/sys/gone").build();
        assert_eq!(orphan.parent(&DeviceTable::new()), None);
        assert_eq!(orphan.property_lookup("X", &DeviceTable::new()), None);
    }

    #[test]
    fn parent_cycle_terminates() {
        let a = Device::builder("/sys/a").parent("/sys/b").build();
        let b = Device::builder("/sys/b").parent("/sys/a").build();
        let devices = table([a.clone(), b]);
        assert_eq!(a.property_lookup("X", &devices), None);
    }
}
