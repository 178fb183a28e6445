use serde::{Deserialize, Serialize};

/// What to do with a reading that is the device's power-on default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOnPolicy {
    /// Store it with the stale flag set.
    Flag,
    /// Leave the previous reading (if any) in place.
    Suppress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub read_interval_ms: u64,
    pub push_interval_ms: u64,
    pub resync_interval_ms: u64,
    pub rescan_interval_ms: u64,
    pub conversion_latency_ms: u64,
    pub tick_interval_ms: u64,
    pub power_on_policy: PowerOnPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            read_interval_ms: 5_000,
            push_interval_ms: 30_000,
            resync_interval_ms: 7_200_000,
            rescan_interval_ms: 60_000,
            conversion_latency_ms: 750,
            tick_interval_ms: 1_000,
            power_on_policy: PowerOnPolicy::Flag,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub connect_timeout_secs: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub token: String,
    pub timeout_ms: u64,
    pub accept_invalid_certs: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "https://192.168.1.5/tempapi/".to_string(),
            token: String::new(),
            timeout_ms: 5_000,
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    /// 0 selects the platform's default port.
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.poll.sanitize();
        self.network.sanitize();
        self.api.sanitize();
        self.http.sanitize();
    }
}

impl PollConfig {
    pub fn sanitize(&mut self) {
        self.read_interval_ms = self.read_interval_ms.max(1_000);
        self.push_interval_ms = self.push_interval_ms.max(1_000);
        self.resync_interval_ms = self.resync_interval_ms.max(60_000);
        self.rescan_interval_ms = self.rescan_interval_ms.max(self.read_interval_ms);
        self.conversion_latency_ms = self.conversion_latency_ms.clamp(94, 2_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 5_000);
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.wifi_ssid = self.wifi_ssid.trim().to_string();
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 120);
    }
}

impl ApiConfig {
    pub fn sanitize(&mut self) {
        self.url = self.url.trim().to_string();
        self.timeout_ms = self.timeout_ms.clamp(500, 60_000);
    }

    pub fn is_configured(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

impl HttpConfig {
    pub fn sanitize(&mut self) {
        if self.host.trim().is_empty() {
            self.host = "0.0.0.0".to_string();
        }
    }

    pub fn port_or(&self, platform_default: u16) -> u16 {
        if self.port == 0 {
            platform_default
        } else {
            self.port
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"poll":{"read_interval_ms":2000},"api":{"token":"abc"}}"#)
                .unwrap();

        assert_eq!(config.poll.read_interval_ms, 2_000);
        assert_eq!(config.poll.push_interval_ms, 30_000);
        assert_eq!(config.poll.power_on_policy, PowerOnPolicy::Flag);
        assert_eq!(config.api.token, "abc");
        assert_eq!(config.api.timeout_ms, 5_000);
        assert_eq!(config.http.port_or(8080), 8080);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = RuntimeConfig::default();
        config.poll.read_interval_ms = 10;
        config.poll.rescan_interval_ms = 0;
        config.poll.conversion_latency_ms = 10_000;
        config.poll.tick_interval_ms = 0;
        config.network.connect_timeout_secs = 0;
        config.api.url = "  http://collector.local/api ".to_string();
        config.http.host = " ".to_string();

        config.sanitize();

        assert_eq!(config.poll.read_interval_ms, 1_000);
        assert_eq!(config.poll.rescan_interval_ms, 1_000);
        assert_eq!(config.poll.conversion_latency_ms, 2_000);
        assert_eq!(config.poll.tick_interval_ms, 100);
        assert_eq!(config.network.connect_timeout_secs, 1);
        assert_eq!(config.api.url, "http://collector.local/api");
        assert_eq!(config.http.host, "0.0.0.0");
    }

    #[test]
    fn power_on_policy_uses_lowercase_names() {
        let policy: PowerOnPolicy = serde_json::from_str("\"suppress\"").unwrap();
        assert_eq!(policy, PowerOnPolicy::Suppress);
        assert!(ApiConfig::default().is_configured());
    }
}
