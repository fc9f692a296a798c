use error_stack::Report;
use thiserror::Error;

use super::ResourceTemplate;
use super::SharedInstance;
use crate::discovery::Device;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to read device attribute {0}")]
    Attribute(String),
    #[error("failed to resolve associated devices for {0}")]
    Resolve(String),
}

/// Maps devices of one family onto resources.
pub trait DeviceAdapter: Send + Sync + 'static {
    /// Short family name used in logs.
    fn name(&self) -> &str;

    /// Resource bucket the device belongs to, if any.
    fn template(&self, device: &Device) -> Option<ResourceTemplate>;

    /// Instances the device contributes to its bucket.
    fn instances(&self, device: &Device) -> Result<Vec<SharedInstance>, Report<AdapterError>>;
}
