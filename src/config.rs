use std::{
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use hickory_proto::rr::Name;
use serde::Deserialize;
use url::Url;

/// Only configuration layout this build understands.
pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

const DEFAULT_RPC_ENDPOINT: &str = "https://rpc.mainnet.near.org";
const DEFAULT_CONTRACT_ACCOUNT: &str = "nearlink.near";
const DEFAULT_ACCOUNT_SUFFIX: &str = ".link";
const DEFAULT_NAMESERVER: &str = "ns1.nearlink.io.";

/// Runtime configuration parsed from `nearlink.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct NearLinkConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub records: RecordsSection,
    #[serde(default)]
    pub authority: AuthoritySection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_dns_listen")]
    pub dns_listen: String,
    #[serde(default)]
    pub doh_listen: Option<String>,
    #[serde(default = "default_doh_path")]
    pub doh_path: String,
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleSection {
    #[serde(default = "default_rpc_endpoint")]
    pub rpc_endpoint: String,
    #[serde(default = "default_contract_account")]
    pub contract_account: String,
    #[serde(default = "default_finality")]
    pub finality: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Suffix removed from a queried domain to obtain the ledger account id.
    #[serde(default = "default_account_suffix")]
    pub account_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordsSection {
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub gateway_a: Vec<String>,
    #[serde(default)]
    pub gateway_aaaa: Vec<String>,
    #[serde(default)]
    pub dnslink: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthoritySection {
    #[serde(default)]
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default)]
    pub doh_endpoint: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    /// Directory receiving daily-rotated JSON log files.
    #[serde(default)]
    pub json_dir: Option<PathBuf>,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

fn default_dns_listen() -> String {
    "0.0.0.0:53".into()
}

fn default_doh_path() -> String {
    "/dns-query".into()
}

fn default_rpc_endpoint() -> String {
    DEFAULT_RPC_ENDPOINT.into()
}

fn default_contract_account() -> String {
    DEFAULT_CONTRACT_ACCOUNT.into()
}

fn default_finality() -> String {
    "final".into()
}

fn default_timeout_seconds() -> u64 {
    5
}

fn default_account_suffix() -> String {
    DEFAULT_ACCOUNT_SUFFIX.into()
}

fn default_nameservers() -> Vec<String> {
    vec![DEFAULT_NAMESERVER.into()]
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            dns_listen: default_dns_listen(),
            doh_listen: None,
            doh_path: default_doh_path(),
            metrics_listen: None,
        }
    }
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            rpc_endpoint: default_rpc_endpoint(),
            contract_account: default_contract_account(),
            finality: default_finality(),
            timeout_seconds: default_timeout_seconds(),
            account_suffix: default_account_suffix(),
        }
    }
}

impl Default for RecordsSection {
    fn default() -> Self {
        Self {
            nameservers: default_nameservers(),
            gateway_a: Vec::new(),
            gateway_aaaa: Vec::new(),
            dnslink: false,
        }
    }
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            doh_endpoint: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for NearLinkConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            server: ServerSection::default(),
            oracle: OracleSection::default(),
            records: RecordsSection::default(),
            authority: AuthoritySection::default(),
            upstream: UpstreamSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl NearLinkConfig {
    /// Read, normalise and validate a configuration file.
    pub fn load_config_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read NearLink config at {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Malformed NearLink config at {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw).context("Invalid TOML")?;
        config.normalise();
        config.validate()?;
        Ok(config)
    }

    /// Apply trailing-dot and case conventions to names loaded from disk.
    pub fn normalise(&mut self) {
        for nameserver in &mut self.records.nameservers {
            *nameserver = ensure_trailing_dot(nameserver.trim());
        }
        for zone in &mut self.authority.zones {
            *zone = ensure_trailing_dot(&zone.trim().to_ascii_lowercase());
        }
        self.oracle.account_suffix = self
            .oracle
            .account_suffix
            .trim()
            .trim_end_matches('.')
            .to_ascii_lowercase();
        let path = self.server.doh_path.trim();
        self.server.doh_path = if path.is_empty() {
            default_doh_path()
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
    }

    /// Reject configurations the resolver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.version != SUPPORTED_CONFIG_VERSION {
            bail!(
                "unsupported config version {} (expected {})",
                self.version,
                SUPPORTED_CONFIG_VERSION
            );
        }
        if self.records.nameservers.is_empty() {
            bail!("records.nameservers must list at least one nameserver");
        }
        for nameserver in &self.records.nameservers {
            Name::from_ascii(nameserver)
                .with_context(|| format!("invalid nameserver name: {nameserver}"))?;
        }
        for zone in &self.authority.zones {
            Name::from_ascii(zone).with_context(|| format!("invalid authority zone: {zone}"))?;
        }
        Url::parse(&self.oracle.rpc_endpoint).with_context(|| {
            format!("invalid oracle rpc_endpoint: {}", self.oracle.rpc_endpoint)
        })?;
        if self.oracle.contract_account.trim().is_empty() {
            bail!("oracle.contract_account must not be empty");
        }
        parse_socket(&self.server.dns_listen, "server.dns_listen")?;
        if let Some(doh) = &self.server.doh_listen {
            parse_socket(doh, "server.doh_listen")?;
        }
        if let Some(metrics) = &self.server.metrics_listen {
            parse_socket(metrics, "server.metrics_listen")?;
        }
        if let Some(endpoint) = &self.upstream.doh_endpoint {
            Url::parse(endpoint)
                .with_context(|| format!("invalid upstream doh_endpoint: {endpoint}"))?;
        }
        Ok(())
    }

    /// Summarise non-fatal problems with a loaded configuration.
    pub fn health_report(&self) -> ConfigHealthReport {
        let mut issues = Vec::new();

        for entry in &self.records.gateway_a {
            if Ipv4Addr::from_str(entry.trim()).is_err() {
                issues.push(format!("gateway_a entry is not an IPv4 address: {entry}"));
            }
        }
        for entry in &self.records.gateway_aaaa {
            if Ipv6Addr::from_str(entry.trim()).is_err() {
                issues.push(format!("gateway_aaaa entry is not an IPv6 address: {entry}"));
            }
        }
        if self.records.gateway_a.is_empty() && self.records.gateway_aaaa.is_empty() {
            issues.push("no gateway addresses configured; A/AAAA fallback is disabled".into());
        }
        if self.oracle.account_suffix.is_empty() {
            issues.push("oracle.account_suffix is empty; domains are queried verbatim".into());
        }
        if self.upstream.doh_endpoint.is_none() {
            issues.push("no upstream configured; NODATA answers are served locally".into());
        }

        ConfigHealthReport {
            version: self.version,
            dns_listen: self.server.dns_listen.clone(),
            doh_listen: self.server.doh_listen.clone(),
            metrics_listen: self.server.metrics_listen.clone(),
            rpc_endpoint: self.oracle.rpc_endpoint.clone(),
            contract_account: self.oracle.contract_account.clone(),
            nameservers: self.records.nameservers.clone(),
            zones: self.authority.zones.clone(),
            upstream: self.upstream.doh_endpoint.clone(),
            issues,
        }
    }
}

fn parse_socket(address: &str, label: &str) -> Result<SocketAddr> {
    address
        .trim()
        .parse::<SocketAddr>()
        .with_context(|| format!("{label} address is invalid: {address}"))
}

pub(crate) fn ensure_trailing_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Immutable view of the configuration consumed by the resolver core.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub version: u32,
    pub contract_account: String,
    pub account_suffix: String,
    pub nameservers: Vec<Name>,
    pub gateway_a: Vec<String>,
    pub gateway_aaaa: Vec<String>,
    pub dnslink: bool,
}

impl ResolverSettings {
    pub fn from_config(config: &NearLinkConfig) -> Result<Self> {
        let nameservers = config
            .records
            .nameservers
            .iter()
            .map(|ns| {
                Name::from_ascii(ensure_trailing_dot(ns))
                    .with_context(|| format!("invalid nameserver name: {ns}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: config.version,
            contract_account: config.oracle.contract_account.trim().to_string(),
            account_suffix: config.oracle.account_suffix.clone(),
            nameservers,
            gateway_a: config.records.gateway_a.clone(),
            gateway_aaaa: config.records.gateway_aaaa.clone(),
            dnslink: config.records.dnslink,
        })
    }

    /// Ledger account id for a domain: trailing dot and chain suffix removed.
    pub fn account_id(&self, domain: &str) -> String {
        let lower = domain.trim_end_matches('.').to_ascii_lowercase();
        if self.account_suffix.is_empty() {
            return lower;
        }
        match lower.strip_suffix(&self.account_suffix) {
            Some(stripped) if !stripped.is_empty() => stripped.to_string(),
            _ => lower,
        }
    }

    pub fn gateways_for(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::V4 => &self.gateway_a,
            IpFamily::V6 => &self.gateway_aaaa,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn matches(&self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (IpFamily::V4, IpAddr::V4(_)) | (IpFamily::V6, IpAddr::V6(_))
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConfigHealthReport {
    pub version: u32,
    pub dns_listen: String,
    pub doh_listen: Option<String>,
    pub metrics_listen: Option<String>,
    pub rpc_endpoint: String,
    pub contract_account: String,
    pub nameservers: Vec<String>,
    pub zones: Vec<String>,
    pub upstream: Option<String>,
    pub issues: Vec<String>,
}

/// Outcome of writing a managed configuration file to disk.
#[derive(Debug, Clone)]
pub struct ConfigWriteOutcome {
    pub path: PathBuf,
    pub action: ConfigWriteAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWriteAction {
    Created,
    Updated,
    Skipped,
}

/// Write the commented default configuration template to `path`.
pub fn write_default_config(path: &Path, overwrite: bool) -> Result<ConfigWriteOutcome> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "Failed to create NearLink config directory {}",
                parent.display()
            )
        })?;
    }

    let rendered = render_default_config(&NearLinkConfig::default());
    let skipped = ConfigWriteOutcome {
        path: path.to_path_buf(),
        action: ConfigWriteAction::Skipped,
    };

    if path.exists() {
        if !overwrite {
            return Ok(skipped);
        }
        let current = fs::read_to_string(path).unwrap_or_default();
        if current == rendered {
            return Ok(skipped);
        }
        fs::write(path, rendered)
            .with_context(|| format!("Failed to update NearLink config at {}", path.display()))?;
        return Ok(ConfigWriteOutcome {
            path: path.to_path_buf(),
            action: ConfigWriteAction::Updated,
        });
    }

    fs::write(path, rendered)
        .with_context(|| format!("Failed to write NearLink config to {}", path.display()))?;
    Ok(ConfigWriteOutcome {
        path: path.to_path_buf(),
        action: ConfigWriteAction::Created,
    })
}

fn render_default_config(config: &NearLinkConfig) -> String {
    let mut output = String::new();
    output.push_str("# NearLink DNS configuration\n");
    output.push_str("# Generated by `nearlink-dns --write-default-config`.\n\n");
    output.push_str(&format!("version = {}\n\n", config.version));

    output.push_str("[server]\n");
    output.push_str(&format!("dns_listen = \"{}\"\n", config.server.dns_listen));
    output.push_str("# doh_listen = \"127.0.0.1:8053\"\n");
    output.push_str(&format!("doh_path = \"{}\"\n", config.server.doh_path));
    output.push_str("# metrics_listen = \"127.0.0.1:9153\"\n\n");

    output.push_str("[oracle]\n");
    output.push_str(&format!(
        "rpc_endpoint = \"{}\"\n",
        config.oracle.rpc_endpoint
    ));
    output.push_str(&format!(
        "contract_account = \"{}\"\n",
        config.oracle.contract_account
    ));
    output.push_str(&format!("finality = \"{}\"\n", config.oracle.finality));
    output.push_str(&format!(
        "timeout_seconds = {}\n",
        config.oracle.timeout_seconds
    ));
    output.push_str(&format!(
        "account_suffix = \"{}\"\n\n",
        config.oracle.account_suffix
    ));

    output.push_str("[records]\n");
    output.push_str(&format!(
        "nameservers = [{}]\n",
        quoted_list(&config.records.nameservers)
    ));
    output.push_str("gateway_a = []\n");
    output.push_str("gateway_aaaa = []\n");
    output.push_str(&format!("dnslink = {}\n\n", config.records.dnslink));

    output.push_str("[authority]\n");
    output.push_str("# Empty list: answer for every name routed here.\n");
    output.push_str("zones = []\n\n");

    output.push_str("[upstream]\n");
    output.push_str("# doh_endpoint = \"https://cloudflare-dns.com/dns-query\"\n");
    output.push_str(&format!(
        "timeout_seconds = {}\n\n",
        config.upstream.timeout_seconds
    ));

    output.push_str("[logging]\n");
    output.push_str("# json_dir = \"/var/log/nearlink\"\n");
    output
}

fn quoted_list(values: &[String]) -> String {
    values
        .iter()
        .map(|value| format!("\"{value}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compute the default path to the runtime configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("io", "nearlink", "NearLink")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("nearlink.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
version = 1

[server]
dns_listen = "127.0.0.1:5353"
doh_path = "resolve"

[oracle]
rpc_endpoint = "https://rpc.testnet.near.org"
contract_account = "dns.testnet"
account_suffix = ".link."

[records]
nameservers = ["ns1.example.com", "ns2.example.com."]
gateway_a = ["1.2.3.4", "5.6.7.8"]
gateway_aaaa = ["2001:db8::1", "not-an-address"]

[authority]
zones = ["Near.Link"]
"#;

    #[test]
    fn load_normalises_names() {
        let config = NearLinkConfig::from_toml_str(SAMPLE).expect("config parses");
        assert_eq!(
            config.records.nameservers,
            vec!["ns1.example.com.".to_string(), "ns2.example.com.".to_string()]
        );
        assert_eq!(config.authority.zones, vec!["near.link.".to_string()]);
        assert_eq!(config.oracle.account_suffix, ".link");
        assert_eq!(config.server.doh_path, "/resolve");
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let raw = SAMPLE.replace("version = 1", "version = 2");
        let err = NearLinkConfig::from_toml_str(&raw).expect_err("version 2 rejected");
        assert!(format!("{err:#}").contains("unsupported config version"));
    }

    #[test]
    fn empty_nameserver_list_is_rejected() {
        let raw = SAMPLE.replace(
            "nameservers = [\"ns1.example.com\", \"ns2.example.com.\"]",
            "nameservers = []",
        );
        let err = NearLinkConfig::from_toml_str(&raw).expect_err("nameservers required");
        assert!(format!("{err:#}").contains("at least one nameserver"));
    }

    #[test]
    fn invalid_listener_is_rejected() {
        let raw = SAMPLE.replace("127.0.0.1:5353", "localhost");
        let err = NearLinkConfig::from_toml_str(&raw).expect_err("bad listener");
        assert!(format!("{err:#}").contains("server.dns_listen"));
    }

    #[test]
    fn health_report_flags_malformed_gateways() {
        let config = NearLinkConfig::from_toml_str(SAMPLE).expect("config parses");
        let report = config.health_report();
        assert!(
            report
                .issues
                .iter()
                .any(|issue| issue.contains("not-an-address"))
        );
        assert!(!report.issues.iter().any(|issue| issue.contains("1.2.3.4")));
    }

    #[test]
    fn account_id_strips_chain_suffix() {
        let config = NearLinkConfig::from_toml_str(SAMPLE).expect("config parses");
        let settings = ResolverSettings::from_config(&config).expect("settings");
        assert_eq!(settings.account_id("alice.near.link."), "alice.near");
        assert_eq!(settings.account_id("Alice.Near.Link"), "alice.near");
        assert_eq!(settings.account_id("alice.chain."), "alice.chain");
        assert_eq!(settings.account_id(".link."), ".link");
    }

    #[test]
    fn write_default_config_respects_overwrite_flag() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("nearlink.toml");

        let outcome = write_default_config(&path, false).expect("write ok");
        assert_eq!(outcome.action, ConfigWriteAction::Created);

        let outcome = write_default_config(&path, false).expect("write ok");
        assert_eq!(outcome.action, ConfigWriteAction::Skipped);

        fs::write(&path, "junk = true\n").expect("write junk");
        let outcome = write_default_config(&path, true).expect("write ok");
        assert_eq!(outcome.action, ConfigWriteAction::Updated);

        let loaded = NearLinkConfig::load_config_file(&path).expect("template loads");
        assert_eq!(loaded.version, SUPPORTED_CONFIG_VERSION);
        assert_eq!(loaded.records.nameservers, vec![DEFAULT_NAMESERVER.to_string()]);
    }
}
