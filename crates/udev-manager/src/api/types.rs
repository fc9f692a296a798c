use async_trait::async_trait;

/// Result of probing one device plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub name: String,
    pub healthy: bool,
}

/// Source of plugin health for the `/healthz` endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe_all(&self) -> Vec<ProbeOutcome>;
}
