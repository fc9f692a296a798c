pub mod api {
    tonic::include_proto!("v1beta1");
}

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use api::device_plugin_client::DevicePluginClient;
use api::device_plugin_server::DevicePlugin;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateResponse;
use api::DevicePluginOptions;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use api::RegisterRequest;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use futures::StreamExt;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::resource::Allocation;
use crate::resource::InstanceId;
use crate::resource::InstanceTable;
use crate::resource::Resource;

/// Device plugin API version spoken with the kubelet.
pub const VERSION: &str = "v1beta1";
/// File name of the kubelet registration socket inside the plugin directory.
pub const KUBELET_SOCKET: &str = "kubelet.sock";
pub const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_ATTEMPTS: u32 = 3;
const REGISTER_RETRY_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to remove stale socket {0}")]
    RemoveSocket(PathBuf),
    #[error("failed to bind socket {0}")]
    Bind(PathBuf),
    #[error("failed to connect to {0}")]
    Connect(PathBuf),
    #[error("failed to register {0} with the kubelet")]
    Register(String),
    #[error("probe of device plugin {0} failed")]
    Probe(String),
}

/// Socket file name for a resource: every character outside `[A-Za-z0-9_-]`
/// becomes `-`.
pub fn socket_name(resource_name: &str) -> String {
    let sanitized: String = resource_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{sanitized}.sock")
}

/// Address of a plugin endpoint to health-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub name: String,
    pub socket_path: PathBuf,
}

/// Device plugin serving one resource over a unix socket.
#[derive(Debug)]
pub struct ResourcePlugin {
    resource: Resource,
    socket_path: PathBuf,
    token: CancellationToken,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl ResourcePlugin {
    /// Binds the plugin socket in `plugin_dir` and starts serving.
    ///
    /// # Errors
    ///
    /// - [`PluginError::RemoveSocket`] if a stale socket cannot be removed
    /// - [`PluginError::Bind`] if the socket cannot be bound
    pub async fn serve(
        resource: Resource,
        plugin_dir: &Path,
        parent: &CancellationToken,
    ) -> Result<Self, Report<PluginError>> {
        let socket_path = plugin_dir.join(socket_name(resource.name()));

        // clean up old socket file if it exists
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!("removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Report::new(e))
                    .change_context(PluginError::RemoveSocket(socket_path.clone()));
            }
        }

        let listener =
            UnixListener::bind(&socket_path).change_context(PluginError::Bind(socket_path.clone()))?;

        let token = parent.child_token();
        let service = DevicePluginService {
            resource: resource.clone(),
            token: token.clone(),
        };

        info!(
            resource = resource.name(),
            "serving device plugin on {}",
            socket_path.display()
        );

        let shutdown = token.clone();
        let name = resource.name().to_string();
        let server = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await;
                    debug!(resource = %name, "shutting down device plugin server");
                })
                .await
        });

        Ok(Self {
            resource,
            socket_path,
            token,
            server,
        })
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Socket file name relative to the plugin directory, as advertised to
    /// the kubelet.
    pub fn endpoint(&self) -> String {
        socket_name(self.resource.name())
    }

    pub fn probe_target(&self) -> ProbeTarget {
        ProbeTarget {
            name: self.resource.name().to_string(),
            socket_path: self.socket_path.clone(),
        }
    }

    /// Advertises the plugin to the kubelet listening on `kubelet_socket`.
    ///
    /// Makes up to [`REGISTER_ATTEMPTS`] attempts, [`REGISTER_RETRY_DELAY`]
    /// apart, to ride out a kubelet that is still coming up.
    pub async fn register(&self, kubelet_socket: &Path) -> Result<(), Report<PluginError>> {
        let name = self.resource.name();
        let mut attempt = 1;
        loop {
            match self.register_once(kubelet_socket).await {
                Ok(()) => {
                    info!(resource = name, "registered device plugin with kubelet");
                    return Ok(());
                }
                Err(e) if attempt < REGISTER_ATTEMPTS => {
                    debug!(
                        resource = name,
                        attempt,
                        "kubelet registration failed, retrying in {REGISTER_RETRY_DELAY:?}: {e:?}"
                    );
                    tokio::time::sleep(REGISTER_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn register_once(&self, kubelet_socket: &Path) -> Result<(), Report<PluginError>> {
        let name = self.resource.name();
        debug!(resource = name, "registering device plugin with kubelet");

        let channel = connect_uds(kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: VERSION.to_string(),
            endpoint: self.endpoint(),
            resource_name: name.to_string(),
            options: Some(DevicePluginOptions::default()),
        };

        timeout(REGISTER_TIMEOUT, client.register(Request::new(request)))
            .await
            .change_context(PluginError::Register(name.to_string()))?
            .change_context(PluginError::Register(name.to_string()))?;
        Ok(())
    }

    /// Stops serving and removes the socket file.
    pub async fn stop(self) {
        let name = self.resource.name().to_string();
        self.token.cancel();

        let mut server = self.server;
        match timeout(SHUTDOWN_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(resource = %name, "device plugin server failed: {e}"),
            Ok(Err(e)) => error!(resource = %name, "device plugin server task failed: {e}"),
            Err(_) => {
                warn!(resource = %name, "device plugin server did not stop in {SHUTDOWN_TIMEOUT:?}, aborting");
                server.abort();
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(resource = %name, "failed to remove socket {}: {e}", self.socket_path.display());
            }
        }
        info!(resource = %name, "device plugin stopped");
    }
}

/// Dials the plugin socket and asks for its options, within [`PROBE_TIMEOUT`].
pub async fn probe(target: &ProbeTarget) -> Result<(), Report<PluginError>> {
    let attempt = async {
        let channel = connect_uds(&target.socket_path).await?;
        DevicePluginClient::new(channel)
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .change_context(PluginError::Probe(target.name.clone()))?;
        Ok::<(), Report<PluginError>>(())
    };

    timeout(PROBE_TIMEOUT, attempt)
        .await
        .change_context(PluginError::Probe(target.name.clone()))?
}

/// create Unix Domain Socket client connection
pub async fn connect_uds(socket_path: &Path) -> Result<Channel, Report<PluginError>> {
    let path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since we're using a Unix socket connector
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }))
        .await
        .change_context(PluginError::Connect(socket_path.to_path_buf()))
}

fn wire_devices(table: &InstanceTable) -> Vec<api::Device> {
    table
        .iter()
        .map(|(id, tracked)| api::Device {
            id: id.to_string(),
            health: tracked.health().as_str().to_string(),
            topology: tracked.instance.topology().map(|topology| api::TopologyInfo {
                nodes: topology
                    .numa_nodes
                    .iter()
                    .map(|node| api::NumaNode { id: *node })
                    .collect(),
            }),
        })
        .collect()
}

fn wire_allocation(allocation: Allocation) -> ContainerAllocateResponse {
    ContainerAllocateResponse {
        envs: allocation.envs.into_iter().collect::<HashMap<_, _>>(),
        mounts: allocation
            .mounts
            .into_iter()
            .map(|mount| api::Mount {
                container_path: mount.container_path.to_string_lossy().into_owned(),
                host_path: mount.host_path.to_string_lossy().into_owned(),
                read_only: mount.read_only,
            })
            .collect(),
        devices: allocation
            .devices
            .into_iter()
            .map(|spec| api::DeviceSpec {
                container_path: spec.container_path.to_string_lossy().into_owned(),
                host_path: spec.host_path.to_string_lossy().into_owned(),
                permissions: spec.permissions,
            })
            .collect(),
        annotations: allocation.annotations.into_iter().collect::<HashMap<_, _>>(),
        cdi_devices: Vec::new(),
    }
}

/// DevicePlugin service implementation backed by a [`Resource`].
#[derive(Debug)]
struct DevicePluginService {
    resource: Resource,
    /// ends open ListAndWatch streams when the plugin stops
    token: CancellationToken,
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(resource = self.resource.name(), "kubelet started watching devices");

        let stream = self
            .resource
            .list_and_watch()
            .map(|table| {
                Ok(ListAndWatchResponse {
                    devices: wire_devices(&table),
                })
            })
            .take_until(self.token.clone().cancelled_owned());

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let name = self.resource.name();
        let table = self.resource.instances();
        let mut container_responses = Vec::new();

        for container in request.into_inner().container_requests {
            info!(resource = name, devices = ?container.devices_ids, "allocating devices");

            let mut allocation = Allocation::default();
            for id in &container.devices_ids {
                let Some(tracked) = table.get(&InstanceId::from(id.as_str())) else {
                    warn!(resource = name, "allocation requested for unknown device {id}");
                    return Err(Status::not_found(format!(
                        "device {id} not found in resource {name}"
                    )));
                };
                let granted = tracked.instance.allocate().await.map_err(|e| {
                    error!(resource = name, "failed to allocate device {id}: {e:?}");
                    Status::internal(format!("failed to allocate device {id}: {e}"))
                })?;
                allocation.merge(granted);
            }
            container_responses.push(wire_allocation(allocation));
        }

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnixListenerStream;

    use super::*;
    use crate::platform::k8s::api::registration_server::Registration;
    use crate::platform::k8s::api::registration_server::RegistrationServer;
    use crate::resource::testing::instance;
    use crate::resource::testing::StaticInstance;
    use crate::resource::DeviceSpec;
    use crate::resource::Health;
    use crate::resource::HealthEvent;
    use crate::resource::ResourceTemplate;

    fn granting(id: &str, env: &str) -> Arc<StaticInstance> {
        Arc::new(StaticInstance {
            id: InstanceId::from(id),
            health: Health::Healthy,
            allocation: Some(Allocation {
                devices: vec![DeviceSpec {
                    host_path: PathBuf::from(format!("/dev/{id}")),
                    container_path: PathBuf::from(format!("/dev/c/{id}")),
                    permissions: "rw".to_string(),
                }],
                envs: BTreeMap::from([("SHARED".to_string(), env.to_string())]),
                ..Allocation::default()
            }),
        })
    }

    fn failing(id: &str) -> Arc<StaticInstance> {
        Arc::new(StaticInstance {
            id: InstanceId::from(id),
            health: Health::Healthy,
            allocation: None,
        })
    }

    async fn client(plugin: &ResourcePlugin) -> DevicePluginClient<Channel> {
        DevicePluginClient::new(connect_uds(plugin.socket_path()).await.expect("connect"))
    }

    #[test]
    fn socket_names_are_sanitized() {
        assert_eq!(socket_name("ydb.tech/part-01"), "ydb-tech-part-01.sock");
        assert_eq!(socket_name("a_b/c d"), "a_b-c-d.sock");
    }

    #[test(tokio::test)]
    async fn list_and_watch_streams_full_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = Resource::spawn(ResourceTemplate::new("test.local", "r"), vec![instance("a")]);
        let plugin = ResourcePlugin::serve(resource.clone(), dir.path(), &CancellationToken::new())
            .await
            .expect("serve");

        let mut stream = client(&plugin)
            .await
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("list_and_watch")
            .into_inner();

        let first = stream.message().await.expect("message").expect("first batch");
        assert_eq!(
            first.devices,
            vec![api::Device {
                id: "a".to_string(),
                health: "Healthy".to_string(),
                topology: None,
            }]
        );

        resource
            .submit(HealthEvent {
                instances: vec![instance("b")],
                health: Health::Unhealthy,
            })
            .await
            .expect("submit");
        let second = stream.message().await.expect("message").expect("second batch");
        let health: Vec<_> = second
            .devices
            .iter()
            .map(|d| (d.id.as_str(), d.health.as_str()))
            .collect();
        assert_eq!(health, vec![("a", "Healthy"), ("b", "Unhealthy")]);

        plugin.stop().await;
        assert!(
            matches!(stream.message().await, Ok(None) | Err(_)),
            "stream should end when the plugin stops"
        );
    }

    #[test(tokio::test)]
    async fn allocate_merges_per_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = Resource::spawn(
            ResourceTemplate::new("test.local", "r"),
            vec![granting("a", "from-a"), granting("b", "from-b")],
        );
        let plugin = ResourcePlugin::serve(resource, dir.path(), &CancellationToken::new())
            .await
            .expect("serve");

        let response = client(&plugin)
            .await
            .allocate(Request::new(AllocateRequest {
                container_requests: vec![api::ContainerAllocateRequest {
                    devices_ids: vec!["a".to_string(), "b".to_string()],
                }],
            }))
            .await
            .expect("allocate")
            .into_inner();

        assert_eq!(response.container_responses.len(), 1);
        let container = &response.container_responses[0];
        let hosts: Vec<_> = container.devices.iter().map(|d| d.host_path.as_str()).collect();
        assert_eq!(hosts, vec!["/dev/a", "/dev/b"]);
        assert_eq!(container.envs.get("SHARED").map(String::as_str), Some("from-b"));

        plugin.stop().await;
    }

    #[test(tokio::test)]
    async fn allocate_reports_unknown_and_failing_devices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = Resource::spawn(
            ResourceTemplate::new("test.local", "r"),
            vec![failing("broken")],
        );
        let plugin = ResourcePlugin::serve(resource, dir.path(), &CancellationToken::new())
            .await
            .expect("serve");
        let mut client = client(&plugin).await;

        let request = |id: &str| {
            Request::new(AllocateRequest {
                container_requests: vec![api::ContainerAllocateRequest {
                    devices_ids: vec![id.to_string()],
                }],
            })
        };

        let unknown = client.allocate(request("missing")).await.expect_err("unknown id");
        assert_eq!(unknown.code(), tonic::Code::NotFound);

        let failed = client.allocate(request("broken")).await.expect_err("failing instance");
        assert_eq!(failed.code(), tonic::Code::Internal);

        plugin.stop().await;
    }

    #[test(tokio::test)]
    async fn probe_follows_plugin_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = Resource::spawn(ResourceTemplate::new("test.local", "r"), vec![]);
        // a stale file at the socket path is replaced
        std::fs::write(dir.path().join(socket_name(resource.name())), b"").expect("stale");

        let plugin = ResourcePlugin::serve(resource, dir.path(), &CancellationToken::new())
            .await
            .expect("serve");
        let target = plugin.probe_target();
        probe(&target).await.expect("probe should succeed while serving");

        plugin.stop().await;
        assert!(probe(&target).await.is_err(), "probe should fail after stop");
        assert!(!target.socket_path.exists(), "socket should be removed");
    }

    struct Kubelet(mpsc::UnboundedSender<RegisterRequest>);

    #[tonic::async_trait]
    impl Registration for Kubelet {
        async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
            let _ = self.0.send(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    #[test(tokio::test)]
    async fn registration_waits_for_a_late_kubelet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = CancellationToken::new();
        let resource = Resource::spawn(ResourceTemplate::new("test.local", "r"), vec![]);
        let plugin = ResourcePlugin::serve(resource, dir.path(), &token)
            .await
            .expect("serve");

        let kubelet_socket = dir.path().join(KUBELET_SOCKET);
        let (tx, mut registrations) = mpsc::unbounded_channel();
        let kubelet = {
            let socket = kubelet_socket.clone();
            let shutdown = token.clone();
            tokio::spawn(async move {
                // comes up after the first attempt has already failed
                tokio::time::sleep(Duration::from_millis(200)).await;
                let listener = UnixListener::bind(socket).expect("bind kubelet");
                tonic::transport::Server::builder()
                    .add_service(RegistrationServer::new(Kubelet(tx)))
                    .serve_with_incoming_shutdown(
                        UnixListenerStream::new(listener),
                        shutdown.cancelled_owned(),
                    )
                    .await
            })
        };

        plugin.register(&kubelet_socket).await.expect("register");
        let registration = registrations.recv().await.expect("registration");
        assert_eq!(registration.resource_name, "test.local/r");

        plugin.stop().await;
        token.cancel();
        kubelet.await.expect("kubelet task").expect("kubelet server");
    }

    #[test(tokio::test)]
    async fn registration_gives_up_without_a_kubelet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resource = Resource::spawn(ResourceTemplate::new("test.local", "r"), vec![]);
        let plugin = ResourcePlugin::serve(resource, dir.path(), &CancellationToken::new())
            .await
            .expect("serve");

        let started = tokio::time::Instant::now();
        let err = plugin
            .register(&dir.path().join(KUBELET_SOCKET))
            .await
            .expect_err("no kubelet");
        assert!(started.elapsed() >= REGISTER_RETRY_DELAY * (REGISTER_ATTEMPTS - 1));
        assert!(matches!(err.current_context(), PluginError::Connect(_) | PluginError::Register(_)));

        plugin.stop().await;
    }
}
