// Core data structures shared by the master and slave tiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire value of the zone that matches every other zone
pub const ALL_ZONES: &str = "*";

// ============================================================================
// Registration Entry
// ============================================================================

/// Record a monitored service writes into the coordination store
///
/// Read-only to this system; leaves named `ip:port` carry it as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationEntry {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub metric_port: u16,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cluster_tag: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub hostname: String,
    /// Replica role ("master"/"slave") for components running in master-slave mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl RegistrationEntry {
    /// Create an entry with only the address fields set
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ..Default::default()
        }
    }

    /// Parse an entry from a coordination-store leaf value
    pub fn from_bytes(value: &[u8]) -> crate::error::Result<Self> {
        let entry: Self = serde_json::from_slice(value)?;
        if entry.ip.is_empty() {
            return Err(crate::error::Error::malformed("registration entry has no ip"));
        }
        Ok(entry)
    }

    /// Serialize into a leaf value
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of strings and integers always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Leaf name used for this entry (`ip:port`)
    pub fn leaf_name(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

// ============================================================================
// Zone
// ============================================================================

/// Partition of checks; slaves declare the zones they serve
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Zone(String);

impl Zone {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The distinguished zone matching every zone
    pub fn all() -> Self {
        Self(ALL_ZONES.to_string())
    }

    pub fn is_all(&self) -> bool {
        self.0 == ALL_ZONES
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a subscription to any of `zones` covers this zone
    pub fn covered_by(&self, zones: &[Zone]) -> bool {
        zones.iter().any(|z| z.is_all() || z == self)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Zone {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// Job
// ============================================================================

/// Change carried by a job event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Add,
    Update,
    Delete,
    Handled,
}

/// Probe protocol of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Http => "HTTP",
        }
    }

    /// Parse the uppercase wire form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TCP" => Some(Self::Tcp),
            "HTTP" => Some(Self::Http),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a job: `(zone, protocol, url)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub zone: Zone,
    pub protocol: Protocol,
    pub url: String,
}

impl JobKey {
    /// Job name segment used in durable paths (`PROTOCOL-url`)
    pub fn name(&self) -> String {
        format!("{}-{}", self.protocol, self.url)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.name())
    }
}

/// One checkable unit derived from a registered endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub module: String,
    pub action: JobAction,
    pub zone: Zone,
    pub protocol: Protocol,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl Job {
    pub fn new(module: impl Into<String>, zone: Zone, protocol: Protocol, url: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            action: JobAction::Add,
            zone,
            protocol,
            url: url.into(),
            status: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            zone: self.zone.clone(),
            protocol: self.protocol,
            url: self.url.clone(),
        }
    }

    /// Copy of this job carrying a different action
    pub fn with_action(&self, action: JobAction) -> Self {
        Self {
            action,
            ..self.clone()
        }
    }

    /// Copy of this job carrying a probe outcome
    pub fn with_status(&self, status: JobStatus) -> Self {
        Self {
            action: JobAction::Handled,
            status: Some(status),
            ..self.clone()
        }
    }
}

// ============================================================================
// Slave / Status
// ============================================================================

/// Host details of a running process
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub version: String,
}

impl ServerInfo {
    /// Describe the current process
    pub fn local(ip: impl Into<String>) -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            ip: ip.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Identity a slave presents to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveInfo {
    pub cluster_name: String,
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub server_info: ServerInfo,
}

impl SlaveInfo {
    pub fn new(cluster_name: impl Into<String>, zones: Vec<Zone>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            zones,
            server_info: ServerInfo::default(),
        }
    }

    /// Subscriber identity used by the job pool
    pub fn subscriber_id(&self) -> String {
        if self.server_info.hostname.is_empty() {
            self.cluster_name.clone()
        } else {
            format!("{}@{}", self.cluster_name, self.server_info.hostname)
        }
    }
}

/// Outcome of one probe cycle, written by a collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub slave_info: SlaveInfo,
    pub success: bool,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}
