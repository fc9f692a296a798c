//! Kubelet device plugin integration.
//!
//! Every [`Resource`](crate::resource::Resource) is exposed as one device
//! plugin serving the v1beta1 API on its own unix socket. The [`Registry`]
//! owns all plugins and re-registers them whenever the kubelet restarts.

pub mod device_plugin;
mod registry;

pub use device_plugin::api;
pub use device_plugin::probe;
pub use device_plugin::socket_name;
pub use device_plugin::PluginError;
pub use device_plugin::ProbeTarget;
pub use device_plugin::ResourcePlugin;
pub use device_plugin::DEFAULT_DEVICE_PLUGIN_DIR;
pub use device_plugin::KUBELET_SOCKET;
pub use device_plugin::VERSION;
pub use registry::Registry;
pub use registry::RegistryError;
