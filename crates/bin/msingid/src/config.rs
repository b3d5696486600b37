//! configuration
//!
//! A JSON config file feeds a `Config` tree; `MSINGI_*` environment
//! variables override file values after load. Anything invalid is
//! rejected before the server opens a port or a file (exit code 3).

use crate::error::ConfigError;
use msingi_core::epoch::DEFAULT_EPOCH_LEN_S;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerCfg,
    pub cors: CorsCfg,
    pub admin: AdminCfg,
    pub lora: LoraCfg,
    pub epoch: EpochCfg,
    pub packet: PacketCfg,
    pub merkle: MerkleCfg,
    pub nullifier: NullifierCfg,
    pub auto_enroll: AutoEnrollCfg,
    pub prover: ProverCfg,
    pub demo_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerCfg {
    pub port: u16,
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            port: 3002,
            bind: "0.0.0.0".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsCfg {
    /// exact-origin allowlist; empty denies all cross-origin
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminMode {
    Loopback,
    SharedSecret,
    Demo,
}

impl FromStr for AdminMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loopback" => Ok(AdminMode::Loopback),
            "shared_secret" => Ok(AdminMode::SharedSecret),
            "demo" => Ok(AdminMode::Demo),
            other => Err(format!("unknown admin mode {:?}", other)),
        }
    }
}

impl fmt::Display for AdminMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminMode::Loopback => write!(f, "loopback"),
            AdminMode::SharedSecret => write!(f, "shared_secret"),
            AdminMode::Demo => write!(f, "demo"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdminCfg {
    pub mode: AdminMode,
    /// header value when mode is shared_secret; never logged
    pub secret: Option<String>,
}

impl Default for AdminCfg {
    fn default() -> Self {
        Self {
            mode: AdminMode::Loopback,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoraCfg {
    pub port: String,
    pub baud: u32,
    pub network_id: u8,
    pub address: u16,
    pub freq_hz: u64,
    pub sf: u8,
    pub bw_khz: u32,
    pub tx_power_dbm: u8,
}

impl Default for LoraCfg {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud: 115_200,
            network_id: 18,
            address: 1,
            freq_hz: 868_000_000,
            sf: 9,
            bw_khz: 125,
            tx_power_dbm: 14,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EpochCfg {
    pub len_s: u64,
    pub max_lag: u64,
    pub max_lead: u64,
}

impl Default for EpochCfg {
    fn default() -> Self {
        Self {
            len_s: DEFAULT_EPOCH_LEN_S,
            max_lag: 1,
            max_lead: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacketCfg {
    /// max |now - packet timestamp| in seconds
    pub skew_s: u64,
}

impl Default for PacketCfg {
    fn default() -> Self {
        Self { skew_s: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MerkleCfg {
    pub depth: usize,
    pub snapshot_path: PathBuf,
}

impl Default for MerkleCfg {
    fn default() -> Self {
        Self {
            depth: 20,
            snapshot_path: "./data/merkle.json".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NullifierCfg {
    pub store_path: PathBuf,
    pub retention_epochs: u64,
}

impl Default for NullifierCfg {
    fn default() -> Self {
        Self {
            store_path: "./data/nullifiers.log".into(),
            retention_epochs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoEnrollCfg {
    /// false = strict policy: unknown commitments are rejected
    pub enabled: bool,
    pub per_src_per_min: u32,
}

impl Default for AutoEnrollCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            per_src_per_min: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProverCfg {
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub mock: bool,
}

impl Default for ProverCfg {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 30_000,
            max_attempts: 3,
            mock: false,
        }
    }
}

impl Config {
    /// load from an optional file, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let bytes = std::fs::read(path)?;
                serde_json::from_slice(&bytes)?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// environment wins over file values
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_parsed("MSINGI_SERVER_PORT", &mut self.server.port)?;
        override_string("MSINGI_SERVER_BIND", &mut self.server.bind);
        if let Some(csv) = env_string("MSINGI_CORS_ALLOW_ORIGINS") {
            self.cors.allow_origins = csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        override_parsed("MSINGI_ADMIN_MODE", &mut self.admin.mode)?;
        if let Some(secret) = env_string("MSINGI_ADMIN_SECRET") {
            self.admin.secret = Some(secret);
        }
        override_string("MSINGI_LORA_PORT", &mut self.lora.port);
        override_parsed("MSINGI_LORA_BAUD", &mut self.lora.baud)?;
        override_parsed("MSINGI_LORA_NETWORK_ID", &mut self.lora.network_id)?;
        override_parsed("MSINGI_LORA_ADDRESS", &mut self.lora.address)?;
        override_parsed("MSINGI_LORA_FREQ_HZ", &mut self.lora.freq_hz)?;
        override_parsed("MSINGI_LORA_SF", &mut self.lora.sf)?;
        override_parsed("MSINGI_LORA_BW_KHZ", &mut self.lora.bw_khz)?;
        override_parsed("MSINGI_LORA_TX_POWER_DBM", &mut self.lora.tx_power_dbm)?;
        override_parsed("MSINGI_EPOCH_LEN_S", &mut self.epoch.len_s)?;
        override_parsed("MSINGI_EPOCH_MAX_LAG", &mut self.epoch.max_lag)?;
        override_parsed("MSINGI_EPOCH_MAX_LEAD", &mut self.epoch.max_lead)?;
        override_parsed("MSINGI_PACKET_SKEW_S", &mut self.packet.skew_s)?;
        override_parsed("MSINGI_MERKLE_DEPTH", &mut self.merkle.depth)?;
        if let Some(path) = env_string("MSINGI_MERKLE_SNAPSHOT_PATH") {
            self.merkle.snapshot_path = path.into();
        }
        if let Some(path) = env_string("MSINGI_NULLIFIER_STORE_PATH") {
            self.nullifier.store_path = path.into();
        }
        override_parsed(
            "MSINGI_NULLIFIER_RETENTION_EPOCHS",
            &mut self.nullifier.retention_epochs,
        )?;
        override_parsed("MSINGI_AUTO_ENROLL_ENABLED", &mut self.auto_enroll.enabled)?;
        override_parsed(
            "MSINGI_AUTO_ENROLL_PER_SRC_PER_MIN",
            &mut self.auto_enroll.per_src_per_min,
        )?;
        if let Some(url) = env_string("MSINGI_PROVER_URL") {
            self.prover.url = Some(url);
        }
        override_parsed("MSINGI_PROVER_TIMEOUT_MS", &mut self.prover.timeout_ms)?;
        override_parsed("MSINGI_PROVER_MAX_ATTEMPTS", &mut self.prover.max_attempts)?;
        override_parsed("MSINGI_PROVER_MOCK", &mut self.prover.mock)?;
        override_parsed("MSINGI_DEMO_MODE", &mut self.demo_mode)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.merkle.depth < 1 || self.merkle.depth > 32 {
            return Err(ConfigError::Invalid(format!(
                "merkle.depth {} outside 1..=32",
                self.merkle.depth
            )));
        }
        if self.epoch.len_s == 0 {
            return Err(ConfigError::Invalid("epoch.len_s must be positive".into()));
        }
        if !matches!(self.lora.bw_khz, 125 | 250 | 500) {
            return Err(ConfigError::Invalid(format!(
                "lora.bw_khz {} not one of 125/250/500",
                self.lora.bw_khz
            )));
        }
        if self.admin.mode == AdminMode::SharedSecret && self.admin.secret.is_none() {
            return Err(ConfigError::Invalid(
                "admin.mode shared_secret requires admin.secret".into(),
            ));
        }
        if self.prover.mock && !self.demo_mode {
            return Err(ConfigError::Invalid(
                "prover.mock requires demo_mode; refusing to serve mock proofs in production"
                    .into(),
            ));
        }
        if !self.prover.mock && self.prover.url.is_none() {
            return Err(ConfigError::Invalid(
                "prover.url required unless prover.mock is set".into(),
            ));
        }
        if self.prover.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "prover.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn override_string(key: &'static str, target: &mut String) {
    if let Some(value) = env_string(key) {
        *target = value;
    }
}

fn override_parsed<T>(key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(value) = env_string(key) {
        *target = value.parse().map_err(|e: T::Err| ConfigError::Env {
            key,
            value,
            detail: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // process env is shared across test threads; serialize mutations
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_documented_table() {
        let config = Config::default();
        assert_eq!(config.server.port, 3002);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.cors.allow_origins.is_empty());
        assert_eq!(config.admin.mode, AdminMode::Loopback);
        assert_eq!(config.lora.port, "/dev/ttyUSB0");
        assert_eq!(config.lora.baud, 115_200);
        assert_eq!(config.epoch.len_s, 86_400);
        assert_eq!(config.epoch.max_lag, 1);
        assert_eq!(config.epoch.max_lead, 0);
        assert_eq!(config.packet.skew_s, 300);
        assert_eq!(config.merkle.depth, 20);
        assert_eq!(config.nullifier.retention_epochs, 30);
        assert!(!config.auto_enroll.enabled);
        assert_eq!(config.auto_enroll.per_src_per_min, 5);
        assert_eq!(config.prover.timeout_ms, 30_000);
        assert_eq!(config.prover.max_attempts, 3);
        assert!(!config.prover.mock);
        assert!(!config.demo_mode);
    }

    #[test]
    fn file_values_parse() {
        let json = r#"{
            "server": { "port": 4100, "bind": "127.0.0.1" },
            "cors": { "allow_origins": ["https://dash.example"] },
            "admin": { "mode": "shared_secret", "secret": "hunter2" },
            "prover": { "url": "http://prover:9000" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.admin.mode, AdminMode::SharedSecret);
        assert_eq!(config.cors.allow_origins, vec!["https://dash.example"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_rejected() {
        let json = r#"{ "server": { "prot": 4100 } }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn env_overrides_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MSINGI_SERVER_PORT", "4555");
        let mut config = Config::default();
        config.server.port = 3002;
        config.apply_env().unwrap();
        assert_eq!(config.server.port, 4555);
        std::env::remove_var("MSINGI_SERVER_PORT");
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MSINGI_EPOCH_MAX_LAG", "not-a-number");
        let mut config = Config::default();
        assert!(matches!(
            config.apply_env(),
            Err(ConfigError::Env { key: "MSINGI_EPOCH_MAX_LAG", .. })
        ));
        std::env::remove_var("MSINGI_EPOCH_MAX_LAG");
    }

    #[test]
    fn cors_env_is_csv() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MSINGI_CORS_ALLOW_ORIGINS", "https://a.example, https://b.example");
        let mut config = Config::default();
        config.apply_env().unwrap();
        assert_eq!(
            config.cors.allow_origins,
            vec!["https://a.example", "https://b.example"]
        );
        std::env::remove_var("MSINGI_CORS_ALLOW_ORIGINS");
    }

    #[test]
    fn mock_without_demo_refused() {
        let mut config = Config::default();
        config.prover.mock = true;
        assert!(config.validate().is_err());
        config.demo_mode = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn shared_secret_requires_secret() {
        let mut config = Config::default();
        config.prover.url = Some("http://prover:9000".into());
        config.admin.mode = AdminMode::SharedSecret;
        assert!(config.validate().is_err());
        config.admin.secret = Some("s".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn prover_url_required_without_mock() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }
}
