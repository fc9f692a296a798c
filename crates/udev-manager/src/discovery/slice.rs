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
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use super::Device;
use super::DeviceTable;
use super::Discovery;
use super::DiscoveryError;
use super::Event;

enum Request {
    Subscribe(Rendezvous<BoxSink<Vec<Device>>, Result<Subscription, MuxError>>),
    Close(AwaitDone<()>),
}

/// Live view over the devices matching a predicate.
///
/// Every change touching the view republishes the whole filtered set, sorted
/// by id. New subscribers get the current set first.
#[derive(Clone)]
pub struct Slice {
    requests: mpsc::Sender<Request>,
}

impl Slice {
    pub(super) async fn start(
        discovery: &Discovery,
        filter: Predicate<Device>,
        config: MuxConfig,
    ) -> Result<Self, Report<DiscoveryError>> {
        let (events_tx, events) = mpsc::channel(64);
        // Init is queued on `events` before this returns
        let upstream = discovery.subscribe(events_tx).await?;

        let (requests, requests_rx) = mpsc::channel(8);
        let view = View {
            filter,
            devices: DeviceTable::new(),
            submit_timeout: config.submit_timeout,
            mux: Mux::new("slice", config),
        };
        tokio::spawn(view.run(events, requests_rx, upstream));

        Ok(Self { requests })
    }

    pub async fn subscribe(
        &self,
        sink: impl Sink<Vec<Device>>,
    ) -> Result<Subscription, Report<DiscoveryError>> {
        let sink: BoxSink<Vec<Device>> = Box::new(sink);
        call(&self.requests, sink, Request::Subscribe)
            .await
            .change_context(DiscoveryError::Stopped)?
            .change_context(DiscoveryError::Subscribe)
    }

    /// Detaches from discovery and closes every subscriber.
    pub async fn close(&self) {
        if call(&self.requests, (), Request::Close).await.is_err() {
            debug!("slice already closed");
        }
    }
}

struct View {
    filter: Predicate<Device>,
    devices: DeviceTable,
    mux: Mux<Vec<Device>>,
    submit_timeout: std::time::Duration,
}

impl View {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut requests: mpsc::Receiver<Request>,
        upstream: Subscription,
    ) {
        let mut upstream = Some(upstream);
        loop {
            select! {
                biased;
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if self.apply(event) {
                                self.publish().await;
                            }
                        }
                        None => {
                            debug!("discovery closed the slice");
                            upstream = None;
                            break;
                        }
                    }
                }
                request = requests.recv() => {
                    match request {
                        Some(Request::Subscribe(request)) => {
                            let (sink, reply) = request.into_parts();
                            reply.send(self.subscribe(sink).await);
                        }
                        Some(Request::Close(request)) => {
                            if let Some(upstream) = upstream.take() {
                                upstream.cancel().await;
                            }
                            self.mux.close().await;
                            request.done();
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some(upstream) = upstream {
            upstream.cancel().await;
        }
        self.mux.close().await;
    }

    /// Applies `event`, returning whether the view changed.
    fn apply(&mut self, event: Event) -> bool {
        match event {
            Event::Init(devices) => {
                self.devices = devices
                    .into_iter()
                    .filter(|device| self.filter.matches(device))
                    .map(|device| (device.id().clone(), device))
                    .collect();
                true
            }
            Event::Added(device) => {
                if self.filter.matches(&device) {
                    self.devices.insert(device.id().clone(), device);
                    true
                } else {
                    // a changed device may have stopped matching
                    self.devices.remove(device.id()).is_some()
                }
            }
            Event::Removed(device) => self.devices.remove(device.id()).is_some(),
        }
    }

    fn snapshot(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    async fn publish(&self) {
        if let Err(e) = self.mux.submit(self.snapshot()).await {
            warn!("failed to publish slice: {e}");
        }
    }

    async fn subscribe(&self, mut sink: BoxSink<Vec<Device>>) -> Result<Subscription, MuxError> {
        match timeout(self.submit_timeout, sink.submit(self.snapshot())).await {
            Ok(Ok(())) => self.mux.subscribe(sink).await,
            Ok(Err(_)) => Err(MuxError::Closed),
            Err(_) => Err(MuxError::Timeout(self.submit_timeout)),
        }
    }
}
