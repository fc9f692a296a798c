use anyhow::Result;
use clap::Parser;
use udev_manager::app;
use udev_manager::app::Application;
use udev_manager::config::Cli;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init();

    let config = app::load_config(&cli)?;
    tracing::info!(
        domain = %config.domain,
        partitions = config.partitions.len(),
        network_bandwidth = config.network_bandwidth.len(),
        network_rdma = config.network_rdma.len(),
        "Loaded config from {}",
        cli.config
    );

    run(Application::new(cli, config)).await
}

#[cfg(feature = "udev")]
async fn run(app: Application) -> Result<()> {
    use std::sync::Arc;

    use udev_manager::discovery::UdevSource;

    app.run(Arc::new(UdevSource::new())).await
}

#[cfg(not(feature = "udev"))]
async fn run(_app: Application) -> Result<()> {
    anyhow::bail!("udev-manager was built without the udev feature")
}
