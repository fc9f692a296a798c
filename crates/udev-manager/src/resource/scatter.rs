use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use mux::Subscription;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::DeviceAdapter;
use super::Health;
use super::HealthEvent;
use super::Resource;
use super::ResourceTemplate;
use super::SharedInstance;
use crate::discovery::Device;
use crate::discovery::DeviceId;
use crate::discovery::Discovery;
use crate::discovery::DiscoveryError;
use crate::discovery::Event;
use crate::platform::k8s::RegistryError;

/// Accepts newly created resources for publication.
#[async_trait]
pub trait ResourceRegistrar: Send + Sync + 'static {
    async fn add(&self, resource: Resource) -> Result<(), Report<RegistryError>>;
}

/// Routes device events from discovery into resources, one per template.
pub struct Scatter {
    name: String,
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl Scatter {
    /// Subscribes to `discovery` and starts routing with `adapter`.
    pub async fn spawn(
        discovery: &Discovery,
        registrar: Arc<dyn ResourceRegistrar>,
        adapter: Arc<dyn DeviceAdapter>,
    ) -> Result<Self, Report<DiscoveryError>> {
        let name = adapter.name().to_string();
        // unbounded so discovery never waits on resource registration
        let (events_tx, events) = mpsc::unbounded_channel();
        let router = Router {
            adapter,
            registrar,
            routes: HashMap::new(),
            attached: HashMap::new(),
        };
        let task = tokio::spawn(router.run(events));
        let subscription = discovery.subscribe(events_tx).await?;

        Ok(Self {
            name,
            subscription,
            task,
        })
    }

    /// Detaches from discovery and waits for queued events to be routed.
    pub async fn stop(self) {
        self.subscription.cancel().await;
        if let Err(e) = self.task.await {
            error!(scatter = %self.name, "scatter task failed: {e}");
        }
    }
}

struct Router {
    adapter: Arc<dyn DeviceAdapter>,
    registrar: Arc<dyn ResourceRegistrar>,
    routes: HashMap<ResourceTemplate, Resource>,
    /// Instances each routed device contributed, replayed on its removal.
    /// A removed device's sysfs is gone, so its instances cannot be rebuilt.
    attached: HashMap<DeviceId, (ResourceTemplate, Vec<SharedInstance>)>,
}

impl Router {
    #[tracing::instrument(skip_all, fields(scatter = self.adapter.name()))]
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            match event {
                Event::Init(devices) => {
                    for device in devices {
                        self.added(&device).await;
                    }
                }
                Event::Added(device) => self.added(&device).await,
                Event::Removed(device) => self.removed(&device).await,
            }
        }
        debug!("scatter stopped, routed {} resources", self.routes.len());
    }

    async fn added(&mut self, device: &Device) {
        let Some(template) = self.adapter.template(device) else {
            return;
        };
        let instances = match self.adapter.instances(device) {
            Ok(instances) => instances,
            Err(e) => {
                error!(device = %device.id(), "failed to build instances: {e:?}");
                return;
            }
        };

        if let Some(resource) = self.routes.get(&template) {
            let event = HealthEvent {
                instances: instances.clone(),
                health: Health::Healthy,
            };
            if let Err(e) = resource.submit(event).await {
                warn!(device = %device.id(), "failed to update resource: {e:?}");
            }
            self.attached.insert(device.id().clone(), (template, instances));
            return;
        }

        if instances.is_empty() {
            debug!(device = %device.id(), %template, "device yields no instances");
            return;
        }

        let resource = Resource::spawn(template.clone(), instances.clone());
        match self.registrar.add(resource.clone()).await {
            Ok(()) => {
                info!(device = %device.id(), resource = resource.name(), "resource created");
                self.routes.insert(template.clone(), resource);
                self.attached.insert(device.id().clone(), (template, instances));
            }
            Err(e) => {
                error!(
                    device = %device.id(),
                    resource = resource.name(),
                    "failed to add resource: {e:?}"
                );
                resource.close().await;
            }
        }
    }

    async fn removed(&mut self, device: &Device) {
        let (template, instances) = match self.attached.remove(device.id()) {
            Some(attached) => attached,
            None => {
                let Some(template) = self.adapter.template(device) else {
                    return;
                };
                match self.adapter.instances(device) {
                    Ok(instances) => (template, instances),
                    Err(e) => {
                        error!(device = %device.id(), "failed to build instances: {e:?}");
                        return;
                    }
                }
            }
        };

        match self.routes.get(&template) {
            Some(resource) => {
                let event = HealthEvent {
                    instances,
                    health: Health::Unhealthy,
                };
                if let Err(e) = resource.submit(event).await {
                    warn!(device = %device.id(), "failed to update resource: {e:?}");
                }
            }
            None => {
                info!(device = %device.id(), %template, "removed device has no resource");
            }
        }
    }
}
