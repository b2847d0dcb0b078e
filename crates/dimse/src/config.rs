//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DimseError, Result};
use crate::negotiation::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};
use crate::pdu::{DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};
use crate::DEFAULT_DIMSE_PORT;

/// Implementation Class UID announced in association negotiation.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.186538461392384102930291283711873527741";

/// Implementation Version Name announced in association negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE_RS_020";

/// Configuration for DIMSE services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU length this side accepts, announced to peers
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// ARTIM timeout in milliseconds, bounding association request,
    /// accept and release handshakes
    #[serde(default = "default_artim_timeout")]
    pub artim_timeout_ms: u64,

    /// Maximum wait for each DIMSE response, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    /// Preferred transfer syntaxes (in order of preference)
    #[serde(default = "default_transfer_syntaxes")]
    pub preferred_transfer_syntaxes: Vec<String>,

    /// Abstract syntaxes the SCP accepts. Empty accepts whatever the
    /// registered services handle.
    #[serde(default)]
    pub accepted_sop_classes: Vec<String>,

    #[serde(default = "default_implementation_class_uid")]
    pub implementation_class_uid: String,

    #[serde(default = "default_implementation_version_name")]
    pub implementation_version_name: String,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Enable C-ECHO service
    #[serde(default = "default_true")]
    pub enable_echo: bool,

    /// Enable C-FIND service
    #[serde(default = "default_true")]
    pub enable_find: bool,

    /// Enable C-STORE service
    #[serde(default = "default_true")]
    pub enable_store: bool,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Use TLS for this connection
    #[serde(default)]
    pub use_tls: bool,

    /// Name to verify the server certificate against (defaults to host)
    #[serde(default)]
    pub tls_server_name: Option<String>,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    #[serde(default)]
    pub artim_timeout_ms: Option<u64>,

    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    #[serde(default)]
    pub max_pdu: Option<u32>,
}

/// TLS configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM format)
    pub cert_path: Option<PathBuf>,

    /// Path to private key file (PEM format)
    pub key_path: Option<PathBuf>,

    /// Path to CA bundle file, used to verify peers
    pub ca_bundle_path: Option<PathBuf>,

    /// Require client certificates
    #[serde(default)]
    pub require_client_cert: bool,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "DIMSE_SCU".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            artim_timeout_ms: default_artim_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            tls: None,
            preferred_transfer_syntaxes: default_transfer_syntaxes(),
            accepted_sop_classes: Vec::new(),
            implementation_class_uid: default_implementation_class_uid(),
            implementation_version_name: default_implementation_version_name(),
            max_associations: default_max_associations(),
            enable_echo: true,
            enable_find: true,
            enable_store: true,
        }
    }
}

impl DimseConfig {
    /// Create a configuration with defaults for the given local AE title
    pub fn new(local_aet: impl Into<String>) -> Self {
        Self {
            local_aet: local_aet.into(),
            ..Self::default()
        }
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn artim_timeout(&self) -> Duration {
        Duration::from_millis(self.artim_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Check if TLS is enabled
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.local_aet)?;
        validate_max_pdu(self.max_pdu)?;

        if self.connect_timeout_ms == 0
            || self.artim_timeout_ms == 0
            || self.operation_timeout_ms == 0
        {
            return Err(DimseError::config("Timeouts must be greater than 0"));
        }

        if self.preferred_transfer_syntaxes.is_empty() {
            return Err(DimseError::config(
                "At least one preferred transfer syntax is required",
            ));
        }

        if self.implementation_class_uid.is_empty() || self.implementation_class_uid.len() > 64 {
            return Err(DimseError::config(
                "Implementation class UID must be 1-64 characters",
            ));
        }

        if self.implementation_version_name.len() > 16 {
            return Err(DimseError::config(
                "Implementation version name must be at most 16 characters",
            ));
        }

        if self.max_associations == 0 {
            return Err(DimseError::config(
                "Max associations must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            use_tls: false,
            tls_server_name: None,
            connect_timeout_ms: None,
            artim_timeout_ms: None,
            operation_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Enable TLS for this node
    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_operation_timeout(mut self, timeout_ms: u64) -> Self {
        self.operation_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_pdu(mut self, max_pdu: u32) -> Self {
        self.max_pdu = Some(max_pdu);
        self
    }

    /// Key identifying this destination, `AE@host:port`.
    pub fn destination_key(&self) -> String {
        format!("{}@{}:{}", self.ae_title, self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        if let Some(max_pdu) = self.max_pdu {
            validate_max_pdu(max_pdu)?;
        }

        Ok(())
    }
}

/// Check an AE title: 1-16 characters of printable ASCII other than
/// backslash, not all spaces.
pub fn validate_ae_title(title: &str) -> Result<()> {
    if title.is_empty() || title.len() > 16 {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{title}' must be 1-16 characters"
        )));
    }
    if title.trim().is_empty() {
        return Err(DimseError::InvalidAeTitle("AE title cannot be blank".into()));
    }
    if let Some(bad) = title
        .chars()
        .find(|c| !(c.is_ascii_graphic() || *c == ' ') || *c == '\\')
    {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{title}' contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

fn validate_max_pdu(max_pdu: u32) -> Result<()> {
    if max_pdu != 0 && !(MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu) {
        return Err(DimseError::config(format!(
            "Max PDU size must be 0 (unlimited) or between {MINIMUM_PDU_SIZE} and {MAXIMUM_PDU_SIZE} bytes"
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    DEFAULT_MAX_PDU
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_artim_timeout() -> u64 {
    30_000
}

fn default_operation_timeout() -> u64 {
    60_000
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
    ]
}

fn default_implementation_class_uid() -> String {
    IMPLEMENTATION_CLASS_UID.to_string()
}

fn default_implementation_version_name() -> String {
    IMPLEMENTATION_VERSION_NAME.to_string()
}

fn default_max_associations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}
