//! Device discovery.
//!
//! One authority task owns the canonical device table. It ingests kernel
//! events from a [`DeviceSource`], answers queries, and republishes normalized
//! [`Event`]s through a [`Mux`]. Readers that tolerate staleness use
//! [`Discovery::device_by_id`], which reads the last published snapshot
//! without a round-trip.

mod device;
mod slice;
#[cfg(feature = "udev")]
mod udev;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use mux::call;
use mux::AwaitDone;
use mux::BoxSink;
use mux::Mux;
use mux::MuxConfig;
use mux::MuxError;
use mux::Predicate;
use mux::Rendezvous;
use mux::Sink;
use mux::Subscription;
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

pub use self::device::*;
pub use self::slice::Slice;
#[cfg(feature = "udev")]
pub use self::udev::UdevSource;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to enumerate devices")]
    Enumerate,
    #[error("failed to open kernel device monitor")]
    Monitor,
    #[error("kernel device monitor failed")]
    MonitorStream,
    #[error("failed to subscribe to device events")]
    Subscribe,
    #[error("device discovery is stopped")]
    Stopped,
}

/// Normalized device event published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The full table at subscription time, sorted by id; exactly once, first.
    Init(Vec<Device>),
    Added(Device),
    Removed(Device),
}

/// Kernel uevent action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    Online,
    Offline,
    Change,
    Other,
}

impl Action {
    pub fn parse(action: &str) -> Self {
        match action {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "change" => Self::Change,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelEvent {
    pub action: Action,
    pub device: Device,
}

/// Stream of kernel events; an `Err` item or the end of the channel means
/// the monitor is broken and must be reopened.
pub type MonitorStream = mpsc::Receiver<Result<KernelEvent, Report<DiscoveryError>>>;

/// Source of kernel device information.
#[async_trait]
pub trait DeviceSource: Send + Sync + 'static {
    /// Lists every device currently known to the kernel.
    async fn enumerate(&self) -> Result<Vec<Device>, Report<DiscoveryError>>;

    /// Opens a fresh notification stream.
    async fn monitor(&self) -> Result<MonitorStream, Report<DiscoveryError>>;
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Delay between attempts to reopen a broken monitor.
    pub retry_delay: Duration,
    /// Kernel events handled back to back before a waiting request is served.
    pub event_burst: usize,
    pub mux: MuxConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            event_burst: 64,
            mux: MuxConfig::default(),
        }
    }
}

enum Request {
    State(Rendezvous<Predicate<Device>, DeviceTable>),
    Subscribe(Rendezvous<BoxSink<Event>, Result<Subscription, MuxError>>),
    Stop(AwaitDone<()>),
}

/// Handle to the discovery authority task.
#[derive(Clone)]
pub struct Discovery {
    requests: mpsc::Sender<Request>,
    table: watch::Receiver<Arc<DeviceTable>>,
    mux_config: MuxConfig,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("devices", &self.table.borrow().len())
            .finish()
    }
}

impl Discovery {
    /// Enumerates the initial table and spawns the authority task.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::Enumerate`] if the initial enumeration fails
    pub async fn start(
        source: Arc<dyn DeviceSource>,
        config: DiscoveryConfig,
        token: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), Report<DiscoveryError>> {
        // open the monitor first so nothing between enumeration and monitoring is lost
        let monitor = match source.monitor().await {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                error!("failed to open kernel device monitor, will retry: {e:?}");
                None
            }
        };

        let devices: DeviceTable = source
            .enumerate()
            .await?
            .into_iter()
            .map(|device| (device.id().clone(), device))
            .collect();
        info!("discovered {} devices", devices.len());

        let (snapshot, table) = watch::channel(Arc::new(devices.clone()));
        let (requests, requests_rx) = mpsc::channel(16);

        let authority = Authority {
            source,
            devices,
            mux: Mux::new("discovery", config.mux.clone()),
            snapshot,
            retry_delay: config.retry_delay,
            event_burst: config.event_burst.max(1),
            submit_timeout: config.mux.submit_timeout,
        };
        let handle = tokio::spawn(authority.run(requests_rx, monitor, token));

        Ok((
            Self {
                requests,
                table,
                mux_config: config.mux,
            },
            handle,
        ))
    }

    /// Registers `sink`; it receives [`Event::Init`] before this returns and
    /// every later change afterwards.
    pub async fn subscribe(
        &self,
        sink: impl Sink<Event>,
    ) -> Result<Subscription, Report<DiscoveryError>> {
        let sink: BoxSink<Event> = Box::new(sink);
        call(&self.requests, sink, Request::Subscribe)
            .await
            .change_context(DiscoveryError::Stopped)?
            .change_context(DiscoveryError::Subscribe)
    }

    /// Copy of the devices matching `filter`.
    pub async fn state(
        &self,
        filter: Predicate<Device>,
    ) -> Result<DeviceTable, Report<DiscoveryError>> {
        call(&self.requests, filter, Request::State)
            .await
            .change_context(DiscoveryError::Stopped)
    }

    /// Live filtered view over the device table.
    pub async fn slice(&self, filter: Predicate<Device>) -> Result<Slice, Report<DiscoveryError>> {
        Slice::start(self, filter, self.mux_config.clone()).await
    }

    /// Stops the authority task and closes every subscriber.
    pub async fn close(&self) {
        if call(&self.requests, (), Request::Stop).await.is_err() {
            debug!("discovery already stopped");
        }
    }
}

impl DeviceLookup for Discovery {
    /// Reads the last published snapshot; may lag the authority task.
    fn device_by_id(&self, id: &DeviceId) -> Option<Device> {
        self.table.borrow().get(id).cloned()
    }
}

struct Authority {
    source: Arc<dyn DeviceSource>,
    devices: DeviceTable,
    mux: Mux<Event>,
    snapshot: watch::Sender<Arc<DeviceTable>>,
    retry_delay: Duration,
    event_burst: usize,
    submit_timeout: Duration,
}

async fn next_kernel_event(
    monitor: &mut Option<MonitorStream>,
) -> Option<Result<KernelEvent, Report<DiscoveryError>>> {
    match monitor {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Authority {
    #[tracing::instrument(skip_all)]
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut monitor: Option<MonitorStream>,
        token: CancellationToken,
    ) {
        let mut reconnect_at = monitor
            .is_none()
            .then(|| Instant::now() + self.retry_delay);
        let mut burst = 0;
        let mut stop = None;

        loop {
            // kernel events take priority, but a flood of them must not starve requests
            if burst >= self.event_burst {
                burst = 0;
                if let Ok(request) = requests.try_recv() {
                    stop = self.serve(request).await;
                    if stop.is_some() {
                        break;
                    }
                    continue;
                }
            }

            select! {
                biased;
                _ = token.cancelled() => {
                    info!("device discovery shutdown requested");
                    break;
                }
                event = next_kernel_event(&mut monitor) => {
                    burst += 1;
                    match event {
                        Some(Ok(event)) => self.handle(event).await,
                        Some(Err(e)) => {
                            error!("kernel device monitor failed, reconnecting in {:?}: {e:?}", self.retry_delay);
                            monitor = None;
                            reconnect_at = Some(Instant::now() + self.retry_delay);
                        }
                        None => {
                            error!("kernel device monitor closed, reconnecting in {:?}", self.retry_delay);
                            monitor = None;
                            reconnect_at = Some(Instant::now() + self.retry_delay);
                        }
                    }
                }
                request = requests.recv() => {
                    burst = 0;
                    let Some(request) = request else {
                        break;
                    };
                    stop = self.serve(request).await;
                    if stop.is_some() {
                        break;
                    }
                }
                _ = reconnect_due(reconnect_at) => {
                    match self.source.monitor().await {
                        Ok(stream) => {
                            info!("kernel device monitor reconnected");
                            monitor = Some(stream);
                            reconnect_at = None;
                            self.resync().await;
                        }
                        Err(e) => {
                            error!("failed to reopen kernel device monitor, retrying in {:?}: {e:?}", self.retry_delay);
                            reconnect_at = Some(Instant::now() + self.retry_delay);
                        }
                    }
                }
            }
        }

        self.mux.close().await;
        if let Some(request) = stop {
            info!("device discovery stopped");
            request.done();
        }
    }

    /// Answers `request`, handing back the completion of a stop request.
    async fn serve(&mut self, request: Request) -> Option<AwaitDone<()>> {
        match request {
            Request::State(request) => {
                let (filter, reply) = request.into_parts();
                reply.send(self.filtered(&filter));
            }
            Request::Subscribe(request) => {
                let (sink, reply) = request.into_parts();
                reply.send(self.subscribe(sink).await);
            }
            Request::Stop(request) => return Some(request),
        }
        None
    }

    fn filtered(&self, filter: &Predicate<Device>) -> DeviceTable {
        self.devices
            .iter()
            .filter(|(_, device)| filter.matches(device))
            .map(|(id, device)| (id.clone(), device.clone()))
            .collect()
    }

    async fn subscribe(&self, mut sink: BoxSink<Event>) -> Result<Subscription, MuxError> {
        let init = Event::Init(self.devices.values().cloned().collect());
        match timeout(self.submit_timeout, sink.submit(init)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(MuxError::Closed),
            Err(_) => {
                warn!("subscriber did not accept initial device table");
                return Err(MuxError::Timeout(self.submit_timeout));
            }
        }
        self.mux.subscribe(sink).await
    }

    async fn handle(&mut self, event: KernelEvent) {
        let KernelEvent { action, device } = event;
        let published = match action {
            Action::Add | Action::Online => {
                debug!(device = %device.id(), ?action, "device added");
                self.devices.insert(device.id().clone(), device.clone());
                Event::Added(device)
            }
            Action::Remove | Action::Offline => match self.devices.remove(device.id()) {
                Some(previous) => {
                    debug!(device = %device.id(), ?action, "device removed");
                    Event::Removed(previous)
                }
                None => {
                    debug!(device = %device.id(), ?action, "removed device was not known");
                    Event::Removed(device)
                }
            },
            Action::Change | Action::Other => {
                trace!(device = %device.id(), ?action, "ignoring device event");
                return;
            }
        };
        self.publish_snapshot();
        self.publish(published).await;
    }

    /// Reconciles the table with a fresh enumeration after the monitor was
    /// down, publishing the difference.
    async fn resync(&mut self) {
        let fresh = match self.source.enumerate().await {
            Ok(devices) => devices,
            Err(e) => {
                error!("failed to re-enumerate devices after reconnect: {e:?}");
                return;
            }
        };
        let fresh: DeviceTable = fresh
            .into_iter()
            .map(|device| (device.id().clone(), device))
            .collect();

        let mut events = Vec::new();
        for (id, device) in &self.devices {
            if !fresh.contains_key(id) {
                events.push(Event::Removed(device.clone()));
            }
        }
        for (id, device) in &fresh {
            if self.devices.get(id) != Some(device) {
                events.push(Event::Added(device.clone()));
            }
        }
        if events.is_empty() {
            return;
        }

        info!("device table changed while monitor was down: {} events", events.len());
        self.devices = fresh;
        self.publish_snapshot();
        for event in events {
            self.publish(event).await;
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(Arc::new(self.devices.clone()));
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.mux.submit(event).await {
            warn!("failed to publish device event: {e}");
        }
    }
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::testing::*;
    use super::*;

    type KernelSender = mpsc::Sender<Result<KernelEvent, Report<DiscoveryError>>>;

    async fn start(
        devices: Vec<Device>,
    ) -> (
        Discovery,
        Arc<FakeSource>,
        KernelSender,
        mpsc::UnboundedReceiver<KernelSender>,
    ) {
        start_with(
            devices,
            DiscoveryConfig {
                retry_delay: Duration::from_millis(20),
                ..DiscoveryConfig::default()
            },
        )
        .await
    }

    async fn start_with(
        devices: Vec<Device>,
        config: DiscoveryConfig,
    ) -> (
        Discovery,
        Arc<FakeSource>,
        KernelSender,
        mpsc::UnboundedReceiver<KernelSender>,
    ) {
        let (source, mut monitors) = FakeSource::new(devices);
        let (discovery, _handle) = Discovery::start(source.clone(), config, CancellationToken::new())
            .await
            .expect("should start");
        let kernel = monitors.recv().await.expect("monitor should be opened");
        (discovery, source, kernel, monitors)
    }

    #[test(tokio::test)]
    async fn subscriber_receives_init_first() {
        let (discovery, _source, kernel, _monitors) = start(vec![disk("sdb"), disk("sda")]).await;

        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = discovery.subscribe(tx).await.expect("should subscribe");
        kernel
            .send(event(Action::Add, disk("sdc")))
            .await
            .expect("send");

        assert_eq!(
            rx.recv().await,
            Some(Event::Init(vec![disk("sda"), disk("sdb")])),
            "init should hold the sorted table"
        );
        assert_eq!(rx.recv().await, Some(Event::Added(disk("sdc"))));
    }

    #[test(tokio::test)]
    async fn remove_publishes_previous_value() {
        let (discovery, _source, kernel, _monitors) = start(vec![disk("sda")]).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = discovery.subscribe(tx).await.expect("should subscribe");
        assert!(matches!(rx.recv().await, Some(Event::Init(_))));

        let stripped = Device::builder("/sys/block/sda").build();
        kernel
            .send(event(Action::Remove, stripped))
            .await
            .expect("send");

        assert_eq!(rx.recv().await, Some(Event::Removed(disk("sda"))));
        let state = discovery.state(Predicate::any()).await.expect("state");
        assert!(state.is_empty(), "table should be empty, got {state:?}");
    }

    #[test(tokio::test)]
    async fn remove_of_unknown_device_publishes_kernel_snapshot() {
        let (discovery, _source, kernel, _monitors) = start(vec![]).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = discovery.subscribe(tx).await.expect("should subscribe");
        assert_eq!(rx.recv().await, Some(Event::Init(vec![])));

        kernel
            .send(event(Action::Offline, disk("sdz")))
            .await
            .expect("send");
        assert_eq!(rx.recv().await, Some(Event::Removed(disk("sdz"))));
    }

    #[test(tokio::test)]
    async fn change_events_are_ignored() {
        let (discovery, _source, kernel, _monitors) = start(vec![disk("sda")]).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = discovery.subscribe(tx).await.expect("should subscribe");
        assert!(matches!(rx.recv().await, Some(Event::Init(_))));

        kernel
            .send(event(Action::Change, disk("sda")))
            .await
            .expect("send");
        kernel
            .send(event(Action::Online, disk("sdb")))
            .await
            .expect("send");
        assert_eq!(rx.recv().await, Some(Event::Added(disk("sdb"))));
    }

    #[test(tokio::test)]
    async fn state_filters_and_device_by_id_reads_snapshot() {
        let (discovery, _source, kernel, _monitors) = start(vec![disk("sda"), disk("sdb")]).await;

        let only_sda = Predicate::new(|d: &Device| d.id().as_str().ends_with("sda"));
        let state = discovery.state(only_sda).await.expect("state");
        assert_eq!(state.keys().cloned().collect::<Vec<_>>(), vec![DeviceId::from("/sys/block/sda")]);

        kernel
            .send(event(Action::Add, disk("sdc")))
            .await
            .expect("send");
        // round-trip through the authority task so the event is applied
        discovery.state(Predicate::any()).await.expect("state");
        assert_eq!(
            discovery.device_by_id(&DeviceId::from("/sys/block/sdc")),
            Some(disk("sdc"))
        );
    }

    #[test(tokio::test)]
    async fn monitor_failure_reconnects_and_resyncs() {
        let (discovery, source, kernel, mut monitors) = start(vec![disk("sda")]).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = discovery.subscribe(tx).await.expect("should subscribe");
        assert!(matches!(rx.recv().await, Some(Event::Init(_))));

        source.set_devices(vec![disk("sdb")]);
        kernel
            .send(Err(Report::new(DiscoveryError::MonitorStream)))
            .await
            .expect("send");

        let kernel = monitors.recv().await.expect("monitor should be reopened");
        assert_eq!(rx.recv().await, Some(Event::Removed(disk("sda"))));
        assert_eq!(rx.recv().await, Some(Event::Added(disk("sdb"))));

        kernel
            .send(event(Action::Add, disk("sdc")))
            .await
            .expect("send");
        assert_eq!(rx.recv().await, Some(Event::Added(disk("sdc"))));
    }

    #[test(tokio::test)]
    async fn failed_reopen_is_retried_until_the_monitor_is_back() {
        let (discovery, source, kernel, mut monitors) = start(vec![disk("sda")]).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = discovery.subscribe(tx).await.expect("should subscribe");
        assert!(matches!(rx.recv().await, Some(Event::Init(_))));

        source.fail_monitor(2);
        drop(kernel);

        let kernel = tokio::time::timeout(Duration::from_secs(5), monitors.recv())
            .await
            .expect("monitor should be reopened in time")
            .expect("monitor should be reopened");
        assert_eq!(source.pending_failures(), 0, "both failed attempts were retried");

        kernel
            .send(event(Action::Add, disk("sdb")))
            .await
            .expect("send");
        assert_eq!(rx.recv().await, Some(Event::Added(disk("sdb"))));
    }

    #[test(tokio::test)]
    async fn requests_are_served_during_an_event_flood() {
        let config = DiscoveryConfig {
            event_burst: 2,
            ..DiscoveryConfig::default()
        };
        let (discovery, _source, kernel, _monitors) = start_with(vec![disk("sda")], config).await;

        // the authority task does not run until this task waits on the reply
        for name in ["sdb", "sdc", "sdd", "sde", "sdf", "sdg"] {
            kernel
                .send(event(Action::Add, disk(name)))
                .await
                .expect("send");
        }
        let state = discovery.state(Predicate::any()).await.expect("state");
        assert_eq!(
            state.keys().cloned().collect::<Vec<_>>(),
            vec![
                DeviceId::from("/sys/block/sda"),
                DeviceId::from("/sys/block/sdb"),
                DeviceId::from("/sys/block/sdc"),
            ]
        );
    }

    #[test(tokio::test)]
    async fn close_closes_subscribers() {
        let (discovery, _source, _kernel, _monitors) = start(vec![]).await;
        let (tx, mut rx) = mpsc::channel(8);
        let _subscription = discovery.subscribe(tx).await.expect("should subscribe");
        assert_eq!(rx.recv().await, Some(Event::Init(vec![])));

        discovery.close().await;
        assert_eq!(rx.recv().await, None);
        assert!(discovery.state(Predicate::any()).await.is_err());
    }

    #[test(tokio::test)]
    async fn enumeration_failure_is_fatal() {
        struct Broken;

        #[async_trait]
        impl DeviceSource for Broken {
            async fn enumerate(&self) -> Result<Vec<Device>, Report<DiscoveryError>> {
                Err(Report::new(DiscoveryError::Enumerate))
            }

            async fn monitor(&self) -> Result<MonitorStream, Report<DiscoveryError>> {
                let (_tx, rx) = mpsc::channel(1);
                Ok(rx)
            }
        }

        let result =
            Discovery::start(Arc::new(Broken), DiscoveryConfig::default(), CancellationToken::new())
                .await;
        assert!(result.is_err());
    }
}
