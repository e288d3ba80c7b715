//! Configuration for the signalling server

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub transport: TransportConfig,
    pub registrar: RegistrarConfig,
    pub b2bua: B2buaConfig,
    pub subscriber: SubscriberConfig,
    pub abuse_filter: AbuseFilterConfig,
    pub dialplan: DialplanConfig,
    pub webrtc_relay: WebrtcRelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub sip_domain: String,
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub sip_listen_port: u16,
    pub sip_tls_listen_port: u16,
    /// PEM certificate chain for the SIP/TLS listener. Acquiring and
    /// rotating the certificate itself is an external collaborator's
    /// job (e.g. a key vault); this crate only ever reads the file.
    pub tls_cert_path: Option<String>,
    /// PEM PKCS8 private key matching `tls_cert_path`.
    pub tls_key_path: Option<String>,
    pub public_contact_hostname: Option<String>,
    pub public_contact_ipv4: Option<IpAddr>,
    pub public_contact_ipv6: Option<IpAddr>,
    pub private_subnets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    pub worker_count: usize,
    pub max_queue: usize,
    pub min_binding_expiry: u32,
    pub max_binding_expiry: u32,
    pub max_bindings_per_account: usize,
    pub sweep_interval_secs: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue: 1000,
            min_binding_expiry: 60,
            max_binding_expiry: 3600,
            max_bindings_per_account: 10,
            sweep_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct B2buaConfig {
    pub worker_count: usize,
    pub max_queue: usize,
}

impl Default for B2buaConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub worker_count: usize,
    pub max_queue: usize,
    pub notify_delay_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_queue: 1000,
            notify_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseFilterConfig {
    pub reg_failure_threshold: u32,
    pub retransmit_threshold: u32,
    pub accept_failure_threshold: u32,
    pub ip_literal_violation_weight: u32,
    pub ban_reset_window_secs: u64,
    pub base_ban_duration_mins: u64,
}

impl Default for AbuseFilterConfig {
    fn default() -> Self {
        Self {
            reg_failure_threshold: 5,
            retransmit_threshold: 20,
            accept_failure_threshold: 5,
            ip_literal_violation_weight: 3,
            ban_reset_window_secs: 600,
            base_ban_duration_mins: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanConfig {
    pub max_operations: u64,
    pub max_call_levels: usize,
}

impl Default for DialplanConfig {
    fn default() -> Self {
        Self {
            max_operations: 200_000,
            max_call_levels: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcRelayConfig {
    pub listen_addr: String,
}

impl Default for WebrtcRelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8088".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    Full,
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig =
            toml::from_str(&contents).map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(
            config::Environment::with_prefix("SIGNALRTC").separator("__"),
        );

        let config = settings.build()?;
        let server_config = config.try_deserialize()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registrar.min_binding_expiry > self.registrar.max_binding_expiry {
            return Err(Error::parse("registrar min expiry exceeds max expiry"));
        }
        if self.registrar.min_binding_expiry < 1 {
            return Err(Error::parse("registrar min expiry must be positive"));
        }
        if self.b2bua.max_queue == 0 {
            return Err(Error::parse("b2bua max queue must be positive"));
        }
        if self.general.sip_domain.is_empty() {
            return Err(Error::parse("sip_domain must not be empty"));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                node_id: "signalrtc-1".to_string(),
                sip_domain: "example.com".to_string(),
                admins: Vec::new(),
            },
            transport: TransportConfig {
                sip_listen_port: 5060,
                sip_tls_listen_port: 5061,
                tls_cert_path: None,
                tls_key_path: None,
                public_contact_hostname: None,
                public_contact_ipv4: None,
                public_contact_ipv6: None,
                private_subnets: vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()],
            },
            registrar: RegistrarConfig::default(),
            b2bua: B2buaConfig::default(),
            subscriber: SubscriberConfig::default(),
            abuse_filter: AbuseFilterConfig::default(),
            dialplan: DialplanConfig::default(),
            webrtc_relay: WebrtcRelayConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Full,
                file: None,
            },
        }
    }
}
