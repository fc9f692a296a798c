//! libudev-backed [`DeviceSource`].

use std::io;
use std::os::fd::AsRawFd;
use std::thread;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::Action;
use super::Device;
use super::DeviceSource;
use super::DiscoveryError;
use super::KernelEvent;
use super::MonitorStream;
use super::SNAPSHOT_SYSATTRS;

const PROPERTY_DEVLINKS: &str = "DEVLINKS";
const PROPERTY_TAGS: &str = "TAGS";

// bounds how long the monitor thread lingers after its receiver is dropped
const POLL_TIMEOUT_MS: libc::c_int = 500;

/// Reads devices from libudev and listens on the udev netlink socket.
///
/// libudev handles are not shared across threads: enumeration runs on the
/// blocking pool, and every monitor socket lives on its own thread.
#[derive(Debug, Default)]
pub struct UdevSource;

impl UdevSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceSource for UdevSource {
    async fn enumerate(&self) -> Result<Vec<Device>, Report<DiscoveryError>> {
        tokio::task::spawn_blocking(|| -> io::Result<Vec<Device>> {
            let mut enumerator = udev::Enumerator::new()?;
            let devices = enumerator.scan_devices()?;
            Ok(devices.map(|device| snapshot(&device)).collect())
        })
        .await
        .change_context(DiscoveryError::Enumerate)?
        .change_context(DiscoveryError::Enumerate)
    }

    async fn monitor(&self) -> Result<MonitorStream, Report<DiscoveryError>> {
        let (tx, rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::Builder::new()
            .name("udev-monitor".to_string())
            .spawn(move || run_monitor(tx, ready_tx))
            .change_context(DiscoveryError::Monitor)?;

        ready_rx
            .await
            .change_context(DiscoveryError::Monitor)?
            .change_context(DiscoveryError::Monitor)?;
        info!("listening for udev events");
        Ok(rx)
    }
}

fn run_monitor(
    tx: mpsc::Sender<Result<KernelEvent, Report<DiscoveryError>>>,
    ready: oneshot::Sender<io::Result<()>>,
) {
    let socket = match udev::MonitorBuilder::new().and_then(|builder| builder.listen()) {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    while !tx.is_closed() {
        let mut fds = [libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        // SAFETY: `fds` is a valid array of one pollfd for the duration of the call
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("polling udev monitor failed: {err}");
            let _ = tx.blocking_send(Err(
                Report::new(err).change_context(DiscoveryError::MonitorStream)
            ));
            return;
        }
        if ready == 0 {
            continue;
        }

        for event in socket.iter() {
            let device = event.device();
            let action = device
                .action()
                .and_then(|action| action.to_str())
                .map(Action::parse)
                .unwrap_or(Action::Other);
            let device = snapshot(&device);
            if tx.blocking_send(Ok(KernelEvent { action, device })).is_err() {
                return;
            }
        }
    }
    debug!("udev monitor thread exiting");
}

fn snapshot(device: &udev::Device) -> Device {
    let mut builder = Device::builder(device.syspath().to_string_lossy().into_owned());

    if let Some(subsystem) = device.subsystem() {
        builder = builder.subsystem(subsystem.to_string_lossy());
    }
    if let Some(devtype) = device.devtype() {
        builder = builder.devtype(devtype.to_string_lossy());
    }
    if let Some(devnode) = device.devnode() {
        builder = builder.devnode(devnode);
    }

    for property in device.properties() {
        let name = property.name().to_string_lossy().into_owned();
        let value = property.value().to_string_lossy().into_owned();
        match name.as_str() {
            PROPERTY_DEVLINKS => {
                for link in value.split_whitespace() {
                    builder = builder.devlink(link);
                }
            }
            PROPERTY_TAGS => {
                for tag in value.split(':').filter(|tag| !tag.is_empty()) {
                    builder = builder.tag(tag);
                }
            }
            _ => {}
        }
        builder = builder.property(name, value);
    }

    for attribute in SNAPSHOT_SYSATTRS {
        if let Some(value) = device.attribute_value(attribute) {
            builder = builder.system_attribute(*attribute, value.to_string_lossy());
        }
    }

    if let Some(parent) = device.parent() {
        builder = builder.parent(parent.syspath().to_string_lossy().into_owned());
    }

    builder.build()
}
