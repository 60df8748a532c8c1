use crate::frames::LinkMode;
use crate::meters::MeterInfo;
use crate::telegram::IdentityMode;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("cannot parse config: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("meter \"{0}\": {1}")]
    Meter(String, String),
}

fn afl_timeout_default() -> u64 {
    60
}
fn afl_sessions_default() -> usize {
    8
}
fn receiver_link_modes_default() -> Vec<LinkMode> {
    vec![LinkMode::T1, LinkMode::C1]
}

#[derive(Deserialize, Serialize, Clone)]
pub struct ReceiverConfig {
    #[serde(default = "receiver_link_modes_default")]
    pub link_modes: Vec<LinkMode>,
    /// Seconds of silence before a partial AFL session is discarded.
    #[serde(default = "afl_timeout_default")]
    pub afl_timeout_secs: u64,
    /// Bound on concurrently tracked AFL fragment sessions.
    #[serde(default = "afl_sessions_default")]
    pub afl_max_sessions: usize,
}

fn receiver_default() -> ReceiverConfig {
    ReceiverConfig {
        link_modes: receiver_link_modes_default(),
        afl_timeout_secs: afl_timeout_default(),
        afl_max_sessions: afl_sessions_default(),
    }
}

fn key_default() -> String {
    "NOKEY".to_string()
}

#[derive(Deserialize, Serialize, Clone)]
pub struct MeterConfig {
    pub name: String,
    /// Driver name, optionally with a driver specific parameter string
    /// in parentheses: `driver(extras)`. `auto` selects by detection.
    pub driver: String,
    #[serde(default)]
    pub address_expressions: Vec<String>,
    /// 32 hex characters for AES-128, or NOKEY.
    #[serde(default = "key_default")]
    pub key: String,
    #[serde(default)]
    pub link_modes: Vec<LinkMode>,
    #[serde(default)]
    pub identity_mode: IdentityMode,
    #[serde(default)]
    pub selected_fields: Vec<String>,
    #[serde(default)]
    pub extra_constant_fields: Vec<String>,
    #[serde(default)]
    pub extra_calculated_fields: Vec<String>,
    #[serde(default)]
    pub poll_interval: u64,
}

impl MeterConfig {
    pub fn to_meter_info(&self) -> MeterInfo {
        let (driver, extras) = split_driver_extras(&self.driver);
        MeterInfo {
            name: self.name.clone(),
            driver,
            driver_extras: extras,
            key: self.key.clone(),
            address_expressions: self.address_expressions.clone(),
            identity_mode: self.identity_mode,
            link_modes: self.link_modes.clone(),
            selected_fields: self.selected_fields.clone(),
            extra_constant_fields: self.extra_constant_fields.clone(),
            extra_calculated_fields: self.extra_calculated_fields.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

/// `apator162(offset=25)` -> ("apator162", "offset=25")
fn split_driver_extras(driver: &str) -> (String, String) {
    match driver.split_once('(') {
        Some((name, rest)) => {
            let extras = rest.strip_suffix(')').unwrap_or(rest);
            (name.trim().to_string(), extras.to_string())
        }
        None => (driver.trim().to_string(), String::new()),
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "receiver_default")]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
}

impl Config {
    pub fn from_str(s: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yml::from_str(s)?;
        Ok(config)
    }

    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_string(), e))?;
        let config = Config::from_str(&content)?;
        info!(
            "(config) loaded {} with {} meter(s)",
            path,
            config.meters.len()
        );
        Ok(config)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
receiver:
  link_modes: [T1]
  afl_timeout_secs: 120
meters:
  - name: MyWarmWater
    driver: supercom587
    address_expressions: ["12345678"]
    key: NOKEY
    identity_mode: ID_MFCT
    selected_fields: [name, id, total_m3, timestamp]
    extra_constant_fields: ["floor=3"]
  - name: Duschagain
    driver: mkradio4(variant=4)
    address_expressions: ["02410120"]
"#;

    #[test]
    fn parses_with_defaults() {
        let c = Config::from_str(YAML).unwrap();
        assert_eq!(c.receiver.link_modes, vec![LinkMode::T1]);
        assert_eq!(c.receiver.afl_timeout_secs, 120);
        assert_eq!(c.receiver.afl_max_sessions, 8);
        assert_eq!(c.meters.len(), 2);

        let mi = c.meters[0].to_meter_info();
        assert_eq!(mi.driver, "supercom587");
        assert_eq!(mi.key, "NOKEY");
        assert_eq!(mi.identity_mode, IdentityMode::IdMfct);

        let mi = c.meters[1].to_meter_info();
        assert_eq!(mi.driver, "mkradio4");
        assert_eq!(mi.driver_extras, "variant=4");
        assert_eq!(mi.key, "NOKEY");
        assert_eq!(mi.identity_mode, IdentityMode::Id);
    }

    #[test]
    fn empty_config_gets_defaults() {
        let c = Config::from_str("{}").unwrap();
        assert_eq!(c.receiver.link_modes, vec![LinkMode::T1, LinkMode::C1]);
        assert!(c.meters.is_empty());
    }

    #[test]
    fn load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(YAML.as_bytes()).unwrap();
        let c = Config::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(c.meters[0].name, "MyWarmWater");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            Config::load("/nonexistent/wmbusrx.yml"),
            Err(ConfigError::Io(_, _))
        ));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(Config::from_str("meters: [ {").is_err());
    }
}
