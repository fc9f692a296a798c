use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future::join_all;
use mux::call;
use mux::AwaitDone;
use mux::Rendezvous;
use notify::event::CreateKind;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::device_plugin::probe;
use super::device_plugin::socket_name;
use super::device_plugin::ProbeTarget;
use super::device_plugin::ResourcePlugin;
use super::device_plugin::KUBELET_SOCKET;
use crate::api::HealthProbe;
use crate::api::ProbeOutcome;
use crate::resource::Resource;
use crate::resource::ResourceRegistrar;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("resource {0} is already registered")]
    AlreadyExists(String),
    #[error("failed to start device plugin for {0}")]
    Plugin(String),
    #[error("failed to watch plugin directory {0}")]
    Watch(PathBuf),
    #[error("registry is stopped")]
    Stopped,
}

enum Request {
    Add(Rendezvous<Resource, Result<(), Report<RegistryError>>>),
    Hup(AwaitDone<()>),
    Targets(Rendezvous<(), Vec<ProbeTarget>>),
}

/// Handle to the task owning every device plugin.
#[derive(Clone)]
pub struct Registry {
    requests: mpsc::Sender<Request>,
}

impl Registry {
    /// Starts watching `plugin_dir` for kubelet restarts and spawns the
    /// registry task. Plugins are stopped when `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Watch`] if the directory cannot be created or watched
    pub async fn start(
        plugin_dir: impl Into<PathBuf>,
        token: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), Report<RegistryError>> {
        let plugin_dir = plugin_dir.into();
        tokio::fs::create_dir_all(&plugin_dir)
            .await
            .change_context(RegistryError::Watch(plugin_dir.clone()))?;

        let (fs_tx, fs_events) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    // receiver is gone once the registry stopped
                    let _ = fs_tx.send(event);
                }
                Err(e) => error!("plugin directory watch error: {e:?}"),
            },
            Config::default(),
        )
        .change_context(RegistryError::Watch(plugin_dir.clone()))?;
        watcher
            .watch(&plugin_dir, RecursiveMode::NonRecursive)
            .change_context(RegistryError::Watch(plugin_dir.clone()))?;

        info!("watching {} for kubelet restarts", plugin_dir.display());

        let (requests, requests_rx) = mpsc::channel(16);
        let authority = Authority {
            plugin_dir,
            token,
            slots: BTreeMap::new(),
        };
        let handle = tokio::spawn(authority.run(watcher, fs_events, requests_rx));

        Ok((Self { requests }, handle))
    }

    /// Serves `resource` and registers it with the kubelet.
    ///
    /// A failed registration is only logged: the plugin keeps serving and is
    /// registered again when the kubelet socket reappears.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::AlreadyExists`] if a resource with the same name was added
    /// - [`RegistryError::Plugin`] if the plugin socket cannot be served
    /// - [`RegistryError::Stopped`] if the registry task is gone
    pub async fn add(&self, resource: Resource) -> Result<(), Report<RegistryError>> {
        call(&self.requests, resource, Request::Add)
            .await
            .change_context(RegistryError::Stopped)?
    }

    /// Restarts and re-registers every plugin.
    pub async fn hup(&self) -> Result<(), Report<RegistryError>> {
        call(&self.requests, (), Request::Hup)
            .await
            .change_context(RegistryError::Stopped)
    }

    /// Probes every plugin concurrently.
    pub async fn probe_all(&self) -> Vec<ProbeOutcome> {
        let targets = match call(&self.requests, (), Request::Targets).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!("registry is unavailable for probing: {e}");
                return Vec::new();
            }
        };

        join_all(targets.into_iter().map(|target| async move {
            let healthy = match probe(&target).await {
                Ok(()) => true,
                Err(e) => {
                    debug!("{e:?}");
                    false
                }
            };
            ProbeOutcome {
                name: target.name,
                healthy,
            }
        }))
        .await
    }
}

#[async_trait]
impl ResourceRegistrar for Registry {
    async fn add(&self, resource: Resource) -> Result<(), Report<RegistryError>> {
        Registry::add(self, resource).await
    }
}

#[async_trait]
impl HealthProbe for Registry {
    async fn probe_all(&self) -> Vec<ProbeOutcome> {
        Registry::probe_all(self).await
    }
}

/// True for the creation of the kubelet registration socket, which marks a
/// kubelet (re)start.
fn is_kubelet_restart(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(CreateKind::Any | CreateKind::File | CreateKind::Other)
    ) && event
        .paths
        .iter()
        .any(|path| path.file_name().is_some_and(|name| name == KUBELET_SOCKET))
}

struct PluginSlot {
    resource: Resource,
    /// `None` while the plugin could not be recreated
    plugin: Option<ResourcePlugin>,
}

struct Authority {
    plugin_dir: PathBuf,
    token: CancellationToken,
    slots: BTreeMap<String, PluginSlot>,
}

impl Authority {
    #[tracing::instrument(skip_all, fields(plugin_dir = %self.plugin_dir.display()))]
    async fn run(
        mut self,
        // dropping the watcher ends the filesystem events
        _watcher: RecommendedWatcher,
        mut fs_events: mpsc::UnboundedReceiver<Event>,
        mut requests: mpsc::Receiver<Request>,
    ) {
        loop {
            select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("registry shutdown requested");
                    break;
                }
                Some(event) = fs_events.recv() => {
                    if is_kubelet_restart(&event) {
                        info!("kubelet socket created, restarting device plugins");
                        self.hup().await;
                    }
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }

        requests.close();
        for (_, slot) in std::mem::take(&mut self.slots) {
            if let Some(plugin) = slot.plugin {
                plugin.stop().await;
            }
        }
        info!("registry stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Add(request) => {
                let (resource, reply) = request.into_parts();
                reply.send(self.add(resource).await);
            }
            Request::Hup(request) => {
                self.hup().await;
                request.done();
            }
            Request::Targets(request) => {
                let targets = self
                    .slots
                    .keys()
                    .map(|name| ProbeTarget {
                        name: name.clone(),
                        socket_path: self.plugin_dir.join(socket_name(name)),
                    })
                    .collect();
                request.reply(targets);
            }
        }
    }

    async fn add(&mut self, resource: Resource) -> Result<(), Report<RegistryError>> {
        let name = resource.name().to_string();
        if self.slots.contains_key(&name) {
            return Err(Report::new(RegistryError::AlreadyExists(name)));
        }

        let plugin = ResourcePlugin::serve(resource.clone(), &self.plugin_dir, &self.token)
            .await
            .change_context(RegistryError::Plugin(name.clone()))?;
        register(&self.plugin_dir, &plugin).await;

        self.slots.insert(
            name,
            PluginSlot {
                resource,
                plugin: Some(plugin),
            },
        );
        Ok(())
    }

    async fn hup(&mut self) {
        for (name, slot) in &mut self.slots {
            if let Some(plugin) = slot.plugin.take() {
                plugin.stop().await;
            }
            match ResourcePlugin::serve(slot.resource.clone(), &self.plugin_dir, &self.token).await {
                Ok(plugin) => {
                    register(&self.plugin_dir, &plugin).await;
                    slot.plugin = Some(plugin);
                }
                Err(e) => error!(resource = %name, "failed to restart device plugin: {e:?}"),
            }
        }
    }
}

async fn register(plugin_dir: &Path, plugin: &ResourcePlugin) {
    if let Err(e) = plugin.register(&plugin_dir.join(KUBELET_SOCKET)).await {
        warn!(
            resource = plugin.resource().name(),
            "kubelet registration failed, retrying on kubelet restart: {e:?}"
        );
    }
}
