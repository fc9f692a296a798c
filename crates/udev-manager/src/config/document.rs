use error_stack::Report;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {0}")]
    Open(String),
    #[error("failed to parse config document")]
    Parse,
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

const DOMAIN_PATTERN: &str =
    r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$";

/// Configuration document as written in YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub disable_topology_hints: bool,
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,
    #[serde(default, rename = "networkBandwidth")]
    pub network_bandwidth: Vec<NetBandwidthEntry>,
    #[serde(default, rename = "networkRdma")]
    pub network_rdma: Vec<NetRdmaEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartitionEntry {
    #[serde(default)]
    pub matcher: String,
    /// Overrides the document domain for this entry.
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetBandwidthEntry {
    #[serde(default)]
    pub matcher: String,
    #[serde(default)]
    pub mbps_per_share: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetRdmaEntry {
    #[serde(default)]
    pub matcher: String,
    #[serde(default)]
    pub resources_count: usize,
}

/// Validated configuration with compiled matchers.
#[derive(Debug, Clone)]
pub struct Config {
    pub domain: String,
    pub disable_topology_hints: bool,
    pub partitions: Vec<PartitionRule>,
    pub network_bandwidth: Vec<NetBandwidthRule>,
    pub network_rdma: Vec<NetRdmaRule>,
}

#[derive(Debug, Clone)]
pub struct PartitionRule {
    pub matcher: Regex,
    /// Effective domain, after applying the entry override.
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct NetBandwidthRule {
    pub matcher: Regex,
    pub mbps_per_share: u64,
}

#[derive(Debug, Clone)]
pub struct NetRdmaRule {
    pub matcher: Regex,
    pub resources_count: usize,
}

impl Config {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Parse`] if the document is not valid YAML for the schema
    /// - [`ConfigError::Invalid`] listing every validation failure with its path
    pub fn from_yaml(data: &str) -> Result<Self, Report<ConfigError>> {
        let document: ConfigDocument = serde_yaml::from_str(data)
            .map_err(|e| Report::new(ConfigError::Parse).attach_printable(e.to_string()))?;
        document.validate()
    }
}

impl ConfigDocument {
    /// Validates every field, collecting all problems before failing.
    pub fn validate(self) -> Result<Config, Report<ConfigError>> {
        let domain_regex = Regex::new(DOMAIN_PATTERN)
            .map_err(|e| Report::new(ConfigError::Parse).attach_printable(e.to_string()))?;
        let mut errors = Vec::new();

        if self.domain.is_empty() {
            errors.push(".domain: must be set".to_string());
        } else if !domain_regex.is_match(&self.domain) {
            errors.push(format!(
                ".domain: {:?} must be a valid domain name",
                self.domain
            ));
        }

        let mut partitions = Vec::new();
        for (i, entry) in self.partitions.iter().enumerate() {
            let path = format!(".partitions[{i}]");
            if let Some(domain) = &entry.domain {
                if !domain_regex.is_match(domain) {
                    errors.push(format!("{path}.domain: {domain:?} must be a valid domain name"));
                }
            }
            let Some(matcher) = compile(&path, &entry.matcher, &mut errors) else {
                continue;
            };
            // group 0 is the whole match
            if matcher.captures_len() > 2 {
                errors.push(format!(
                    "{path}.matcher: {:?} must have at most one capturing group",
                    entry.matcher
                ));
                continue;
            }
            partitions.push(PartitionRule {
                matcher,
                domain: entry.domain.clone().unwrap_or_else(|| self.domain.clone()),
            });
        }

        let mut network_bandwidth = Vec::new();
        for (i, entry) in self.network_bandwidth.iter().enumerate() {
            let path = format!(".networkBandwidth[{i}]");
            if entry.mbps_per_share == 0 {
                errors.push(format!("{path}.mbpsPerShare: must be greater than 0"));
            }
            if let Some(matcher) = compile(&path, &entry.matcher, &mut errors) {
                network_bandwidth.push(NetBandwidthRule {
                    matcher,
                    mbps_per_share: entry.mbps_per_share,
                });
            }
        }

        let mut network_rdma = Vec::new();
        for (i, entry) in self.network_rdma.iter().enumerate() {
            let path = format!(".networkRdma[{i}]");
            if entry.resources_count == 0 {
                errors.push(format!("{path}.resourcesCount: must be greater than 0"));
            }
            if let Some(matcher) = compile(&path, &entry.matcher, &mut errors) {
                network_rdma.push(NetRdmaRule {
                    matcher,
                    resources_count: entry.resources_count,
                });
            }
        }

        if !errors.is_empty() {
            return Err(Report::new(ConfigError::Invalid(errors)));
        }

        Ok(Config {
            domain: self.domain,
            disable_topology_hints: self.disable_topology_hints,
            partitions,
            network_bandwidth,
            network_rdma,
        })
    }
}

fn compile(path: &str, matcher: &str, errors: &mut Vec<String>) -> Option<Regex> {
    if matcher.is_empty() {
        errors.push(format!("{path}.matcher: must be set"));
        return None;
    }
    match Regex::new(matcher) {
        Ok(regex) => Some(regex),
        Err(e) => {
            errors.push(format!("{path}.matcher: {matcher:?} must be a valid regexp: {e}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn invalid(data: &str) -> Vec<String> {
        let err = Config::from_yaml(data).expect_err("should be invalid");
        match err.current_context() {
            ConfigError::Invalid(errors) => errors.clone(),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parses_full_document() {
        let config = Config::from_yaml(
            r#"
domain: ydb.tech
disable_topology_hints: true
partitions:
  - matcher: ydb_disk_(.*)
  - matcher: ^scratch$
    domain: scratch.ydb.tech
networkBandwidth:
  - matcher: ^eth0$
    mbpsPerShare: 1000
networkRdma:
  - matcher: ^ib([0-9]+)$
    resourcesCount: 8
"#,
        )
        .expect("valid config");

        assert_eq!(config.domain, "ydb.tech");
        assert!(config.disable_topology_hints);
        let domains: Vec<_> = config.partitions.iter().map(|p| p.domain.as_str()).collect();
        assert_eq!(domains, vec!["ydb.tech", "scratch.ydb.tech"]);
        assert!(config.partitions[0].matcher.is_match("ydb_disk_01"));
        assert_eq!(config.network_bandwidth[0].mbps_per_share, 1000);
        assert_eq!(config.network_rdma[0].resources_count, 8);
    }

    #[test]
    fn sections_are_optional() {
        let config = Config::from_yaml("domain: example.com\n").expect("valid config");
        assert!(!config.disable_topology_hints);
        assert!(config.partitions.is_empty());
        assert!(config.network_bandwidth.is_empty());
        assert!(config.network_rdma.is_empty());
    }

    #[test]
    fn collects_every_error_with_its_path() {
        let errors = invalid(
            r#"
domain: not_a_domain
partitions:
  - matcher: ok_(.*)
  - matcher: "(a)(b)"
  - matcher: "("
    domain: -bad-
networkBandwidth:
  - matcher: eth0
    mbpsPerShare: 0
networkRdma:
  - resourcesCount: 0
"#,
        );

        assert_eq!(errors.len(), 7, "{errors:#?}");
        assert_eq!(errors[0], r#".domain: "not_a_domain" must be a valid domain name"#);
        assert_eq!(
            errors[1],
            r#".partitions[1].matcher: "(a)(b)" must have at most one capturing group"#
        );
        assert_eq!(
            errors[2],
            r#".partitions[2].domain: "-bad-" must be a valid domain name"#
        );
        assert!(errors[3].starts_with(r#".partitions[2].matcher: "(" must be a valid regexp"#));
        assert_eq!(errors[4], ".networkBandwidth[0].mbpsPerShare: must be greater than 0");
        assert_eq!(errors[5], ".networkRdma[0].resourcesCount: must be greater than 0");
        assert_eq!(errors[6], ".networkRdma[0].matcher: must be set");
    }

    #[test]
    fn missing_domain_is_reported() {
        assert_eq!(invalid("partitions: []\n"), vec![".domain: must be set".to_string()]);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = Config::from_yaml("domain: [unterminated").expect_err("parse error");
        assert!(matches!(err.current_context(), ConfigError::Parse));

        let err = Config::from_yaml("networkBandwidth:\n  - mbpsPerShare: -5\n")
            .expect_err("negative share size");
        assert!(matches!(err.current_context(), ConfigError::Parse));
    }
}
