use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub ike: IkeSettings,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonSection {
    pub listen_address: String,
    pub listen_port: u16,
}

/// Settings steering CHILD_SA negotiation behavior.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IkeSettings {
    /// Tear down the IKE_SA when the first CHILD_SA of IKE_AUTH fails.
    pub close_ike_on_child_failure: bool,
    /// Select proposals in our configured order rather than the peer's.
    pub prefer_configured_proposals: bool,
    /// Accept private-use algorithm identifiers from unknown peers.
    pub accept_private_algs: bool,
    /// Close the whole IKE_SA when a CHILD_SA hits its inactivity timeout.
    pub inactivity_close_ike: bool,
    /// Base delay in seconds before retrying after TEMPORARY_FAILURE.
    pub retry_interval: u64,
    /// Random jitter in seconds subtracted from the retry delay.
    pub retry_jitter: u64,
}

impl Default for IkeSettings {
    fn default() -> Self {
        IkeSettings {
            close_ike_on_child_failure: false,
            prefer_configured_proposals: true,
            accept_private_algs: false,
            inactivity_close_ike: false,
            retry_interval: crate::network::ike::RETRY_INTERVAL,
            retry_jitter: crate::network::ike::RETRY_JITTER,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("ikev2d.toml").required(false))
            .add_source(File::with_name("/etc/ikev2d/config.toml").required(false))
            .add_source(Environment::with_prefix("IKEV2D"))
            .set_default("daemon.listen_address", "0.0.0.0")?
            .set_default("daemon.listen_port", 500)?
            .set_default("ike.close_ike_on_child_failure", false)?
            .set_default("ike.prefer_configured_proposals", true)?
            .set_default("ike.accept_private_algs", false)?
            .set_default("ike.inactivity_close_ike", false)?
            .set_default("ike.retry_interval", 15)?
            .set_default("ike.retry_jitter", 10)?
            .set_default("monitoring.log_level", "info")?
            .build()?;

        config.try_deserialize()
    }

    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let toml_content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<std::net::SocketAddr, std::net::AddrParseError> {
        let ip: Ipv4Addr = self.daemon.listen_address.parse()?;
        Ok(std::net::SocketAddr::new(ip.into(), self.daemon.listen_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ike_settings_defaults() {
        let settings = IkeSettings::default();
        assert!(!settings.close_ike_on_child_failure);
        assert!(settings.prefer_configured_proposals);
        assert_eq!(settings.retry_interval, 15);
        assert_eq!(settings.retry_jitter, 10);
    }
}
