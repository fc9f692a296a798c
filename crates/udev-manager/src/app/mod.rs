//! Application wiring
//!
//! Starts discovery, the plugin registry, one scatter per configured device
//! family and the health server, then waits for a shutdown signal.

pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use error_stack::Context;
use error_stack::Report;
use mux::MuxConfig;
use utils::version;

use crate::adapters::NetBandwidth;
use crate::adapters::NetRdma;
use crate::adapters::Partitions;
use crate::adapters::RdmaMap;
use crate::api::HealthServer;
use crate::app::tasks::Tasks;
use crate::config::Cli;
use crate::config::Config;
use crate::discovery::DeviceLookup;
use crate::discovery::DeviceSource;
use crate::discovery::Discovery;
use crate::discovery::DiscoveryConfig;
use crate::platform::k8s::Registry;
use crate::resource::DeviceAdapter;
use crate::resource::ResourceRegistrar;
use crate::resource::Scatter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn report<C: Context>(report: Report<C>) -> anyhow::Error {
    anyhow!("{report:?}")
}

/// Reads and validates the configuration document named by the CLI.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let data = cli.config.read().map_err(report)?;
    Config::from_yaml(&data).map_err(report)
}

/// Builds one adapter per configured device family entry.
pub fn adapters(config: &Config, lookup: Arc<dyn DeviceLookup>) -> Vec<Arc<dyn DeviceAdapter>> {
    let mut adapters: Vec<Arc<dyn DeviceAdapter>> = Vec::new();
    for rule in &config.partitions {
        adapters.push(Arc::new(Partitions::new(
            rule.domain.clone(),
            rule.matcher.clone(),
            Arc::clone(&lookup),
            !config.disable_topology_hints,
        )));
    }
    for rule in &config.network_bandwidth {
        adapters.push(Arc::new(NetBandwidth::new(
            config.domain.clone(),
            rule.matcher.clone(),
            rule.mbps_per_share,
        )));
    }
    for rule in &config.network_rdma {
        adapters.push(Arc::new(NetRdma::new(
            config.domain.clone(),
            rule.matcher.clone(),
            rule.resources_count,
            RdmaMap::default(),
        )));
    }
    adapters
}

/// Application core structure with explicit dependencies
pub struct Application {
    cli: Cli,
    config: Config,
}

impl Application {
    pub fn new(cli: Cli, config: Config) -> Self {
        Self { cli, config }
    }

    /// Run the application until a shutdown signal, then stop every component
    pub async fn run(&self, source: Arc<dyn DeviceSource>) -> Result<()> {
        tracing::info!("Starting udev-manager {}", &**version::VERSION);

        let mut tasks = Tasks::new();
        let token = tasks.token();

        let discovery_config = DiscoveryConfig {
            mux: MuxConfig {
                submit_timeout: self.cli.mux_submit_timeout(),
                ..MuxConfig::default()
            },
            ..DiscoveryConfig::default()
        };
        let (discovery, handle) = Discovery::start(source, discovery_config, token.clone())
            .await
            .map_err(report)?;
        tasks.push("discovery", handle);

        let (registry, handle) = Registry::start(self.cli.device_plugin_dir.clone(), token.clone())
            .await
            .map_err(report)?;
        tasks.push("registry", handle);

        let registrar: Arc<dyn ResourceRegistrar> = Arc::new(registry.clone());
        let mut scatters = Vec::new();
        for adapter in adapters(&self.config, Arc::new(discovery.clone())) {
            let scatter = Scatter::spawn(&discovery, Arc::clone(&registrar), adapter)
                .await
                .map_err(report)?;
            scatters.push(scatter);
        }
        tracing::info!("Started {} device scatters", scatters.len());

        let server = HealthServer::new(self.cli.health_listen_addr.clone(), Arc::new(registry));
        let server_token = token.clone();
        tasks.spawn("health server", async move {
            if let Err(e) = server.run(server_token).await {
                tracing::error!("Health server failed: {e:?}");
            }
        });

        let result = tasks.wait_for_completion().await;

        tracing::info!("Shutting down application...");
        for scatter in scatters {
            scatter.stop().await;
        }
        discovery.close().await;
        tasks.shutdown(SHUTDOWN_TIMEOUT).await;

        tracing::info!("Application shutdown completed");
        result
    }
}
