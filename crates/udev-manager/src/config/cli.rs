use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use error_stack::Report;
use error_stack::ResultExt;
use utils::version;

use super::document::ConfigError;
use crate::platform::k8s::DEFAULT_DEVICE_PLUGIN_DIR;

#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "UDEV_MANAGER_CONFIG",
        help = r#"Configuration source, in form "file:<path>", "env:<ENV_VARIABLE>" or "stdin""#
    )]
    pub config: ConfigSource,

    #[arg(
        long,
        env = "HEALTH_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "Listen address of the /healthz HTTP server"
    )]
    pub health_listen_addr: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        default_value = DEFAULT_DEVICE_PLUGIN_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device plugin directory holding kubelet.sock and the plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = "1000",
        help = "Timeout in milliseconds for delivering one device event to all subscribers"
    )]
    pub mux_submit_timeout_ms: u64,
}

impl Cli {
    pub fn mux_submit_timeout(&self) -> Duration {
        Duration::from_millis(self.mux_submit_timeout_ms)
    }
}

/// Where the YAML configuration document is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Env(String),
    Stdin,
}

impl FromStr for ConfigSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(path) = value.strip_prefix("file:") {
            Ok(Self::File(PathBuf::from(path)))
        } else if let Some(variable) = value.strip_prefix("env:") {
            Ok(Self::Env(variable.to_string()))
        } else if value == "stdin" {
            Ok(Self::Stdin)
        } else {
            Err(format!("invalid config source: {value}"))
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Env(variable) => write!(f, "env:{variable}"),
            Self::Stdin => f.write_str("stdin"),
        }
    }
}

impl ConfigSource {
    /// Reads the whole document.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Open`] if the file, variable or stdin cannot be read
    pub fn read(&self) -> Result<String, Report<ConfigError>> {
        let open = || ConfigError::Open(self.to_string());
        match self {
            Self::File(path) => std::fs::read_to_string(path).change_context_lazy(open),
            Self::Env(variable) => match std::env::var(variable) {
                Ok(data) if !data.is_empty() => Ok(data),
                Ok(_) => Err(Report::new(open())
                    .attach_printable(format!("environment variable {variable} is empty"))),
                Err(e) => Err(Report::new(e).change_context(open())),
            },
            Self::Stdin => {
                let mut data = String::new();
                std::io::stdin()
                    .read_to_string(&mut data)
                    .change_context_lazy(open)?;
                Ok(data)
            }
        }
    }
}
