use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: Discovery,
    #[serde(default)]
    pub inverter: Inverter,
    pub pvoutput: Option<PvOutput>,
    #[serde(default)]
    pub scheduler: Scheduler,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default = "Config::default_strict_data_check")]
    pub strict_data_check: bool,
}

// Discovery {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Discovery {
    pub interface_ip: Option<Ipv4Addr>,
    pub broadcast_ip: Option<Ipv4Addr>,
    pub advertisement_port: Option<u16>,
    pub listen_port: Option<u16>,
    pub accept_timeout_ms: Option<u64>,
    pub warn_after: Option<u32>,
}
impl Discovery {
    pub fn interface_ip(&self) -> Ipv4Addr {
        self.interface_ip.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    pub fn advertisement_target(&self) -> SocketAddr {
        SocketAddr::from((
            self.broadcast_ip.unwrap_or(Ipv4Addr::BROADCAST),
            self.advertisement_port.unwrap_or(samil::ADVERTISEMENT_PORT),
        ))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((
            self.interface_ip(),
            self.listen_port.unwrap_or(samil::LISTEN_PORT),
        ))
    }

    // also the time between two advertisements
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms.unwrap_or(5000))
    }

    pub fn warn_after(&self) -> u32 {
        self.warn_after.unwrap_or(10)
    }
} // }}}

// Inverter {{{
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Inverter {
    pub count: Option<usize>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "keep_alive_ms")]
    pub keep_alive: Option<Duration>,
    pub response_timeout_secs: Option<u64>,
    pub use_tcp_nodelay: Option<bool>,
}
impl Inverter {
    pub fn count(&self) -> usize {
        self.count.unwrap_or(1)
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive.unwrap_or(samil::KEEP_ALIVE)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_secs.map(Duration::from_secs)
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }
} // }}}

// PvOutput {{{
#[derive(Clone, Debug, Deserialize)]
pub struct PvOutput {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_pvoutput_url")]
    pub url: String,
    pub api_key: String,
    pub system_id: String,

    pub cache_size: Option<usize>,
}
impl PvOutput {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size.unwrap_or(10)
    }
} // }}}

// Scheduler {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Scheduler {
    pub interval_secs: Option<u64>,
}
impl Scheduler {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(300))
    }
} // }}}

#[derive(Clone, Debug)]
pub struct ConfigWrapper {
    config: Arc<Config>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.config.discovery
    }

    pub fn inverter(&self) -> &Inverter {
        &self.config.inverter
    }

    pub fn pvoutput(&self) -> Option<&PvOutput> {
        self.config.pvoutput.as_ref().filter(|p| p.enabled())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.config.scheduler
    }

    pub fn loglevel(&self) -> &str {
        &self.config.loglevel
    }

    pub fn strict_data_check(&self) -> bool {
        self.config.strict_data_check
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;

        info!("Configuration loaded successfully:");
        info!("  Discovery:");
        info!("    Listen: {}", config.discovery.listen_addr());
        info!("    Advertise to: {}", config.discovery.advertisement_target());
        info!("    Accept Timeout: {:?}", config.discovery.accept_timeout());
        info!("  Inverters: {}", config.inverter.count());
        info!("    Keep Alive: {:?}", config.inverter.keep_alive());
        match config.inverter.response_timeout() {
            Some(timeout) => info!("    Response Timeout: {:?}", timeout),
            None => info!("    Response Timeout: none"),
        }
        info!("    TCP NoDelay: {}", config.inverter.use_tcp_nodelay());

        match &config.pvoutput {
            Some(pvoutput) if pvoutput.enabled => {
                info!("  PVOutput: enabled");
                info!("    URL: {}", pvoutput.url());
                info!("    System ID: {}", pvoutput.system_id);
            }
            _ => info!("  PVOutput: disabled"),
        }

        info!("  Poll Interval: {:?}", config.scheduler.interval());
        info!("  Strict Data Check: {}", config.strict_data_check);
        info!("  Log Level: {}", config.loglevel);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.inverter.count() == 0 {
            bail!("inverter.count must be at least 1");
        }

        if self.inverter.keep_alive().is_zero() {
            bail!("inverter.keep_alive_ms must be greater than 0");
        }

        if self.inverter.response_timeout_secs == Some(0) {
            return Err(file_error!("Invalid response timeout: 0"));
        }

        if self.scheduler.interval().is_zero() {
            bail!("scheduler.interval_secs must be greater than 0");
        }

        if let Some(pvoutput) = &self.pvoutput {
            if pvoutput.enabled {
                if let Err(e) = url::Url::parse(&pvoutput.url) {
                    return Err(file_error!("Invalid PVOutput URL: {}", e));
                }
                if pvoutput.api_key.is_empty() {
                    return Err(file_error!("PVOutput API key cannot be empty"));
                }
                if pvoutput.system_id.is_empty() {
                    return Err(file_error!("PVOutput system ID cannot be empty"));
                }
                if pvoutput.cache_size() == 0 {
                    bail!("pvoutput.cache_size must be at least 1");
                }
            }
        }

        Ok(())
    }

    fn default_pvoutput_url() -> String {
        "https://pvoutput.org".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_strict_data_check() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_protocol_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(
            config.discovery.listen_addr(),
            "0.0.0.0:60001".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            config.discovery.advertisement_target(),
            "255.255.255.255:60000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.discovery.accept_timeout(), Duration::from_secs(5));
        assert_eq!(config.discovery.warn_after(), 10);
        assert_eq!(config.inverter.keep_alive(), Duration::from_secs(1));
        assert_eq!(config.inverter.response_timeout(), None);
        assert_eq!(config.scheduler.interval(), Duration::from_secs(300));
        assert!(config.pvoutput.is_none());
        assert_eq!(config.loglevel, "info");
    }

    #[test]
    fn keep_alive_in_milliseconds() {
        let config = Config::from_yaml("inverter:\n  keep_alive_ms: 250\n").unwrap();
        assert_eq!(config.inverter.keep_alive(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_zero_inverters() {
        assert!(Config::from_yaml("inverter:\n  count: 0\n").is_err());
    }

    #[test]
    fn rejects_bad_pvoutput_url() {
        let yaml = "pvoutput:\n  url: not a url\n  api_key: k\n  system_id: '1'\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn disabled_pvoutput_is_hidden() {
        let yaml = "pvoutput:\n  enabled: false\n  api_key: ''\n  system_id: ''\n";
        let config = ConfigWrapper::from_config(Config::from_yaml(yaml).unwrap());
        assert!(config.pvoutput().is_none());
    }
}
