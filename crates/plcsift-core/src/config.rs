use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EngineError, Result};

pub const ENIP_TCP_PORT: u16 = 44818;
pub const ENIP_IO_PORT: u16 = 2222;
pub const MODBUS_PORT: u16 = 502;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub ports: PortConfig,
    pub reassembly: ReassemblyConfig,
    pub heuristics: HeuristicsConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.enip.is_empty() && self.ports.modbus.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one ENIP or Modbus port is required".into(),
            ));
        }
        if let Some(port) = self.ports.enip.iter().find(|p| self.ports.modbus.contains(p)) {
            return Err(EngineError::InvalidConfig(format!(
                "port {port} is listed as both ENIP and Modbus"
            )));
        }
        if self.reassembly.max_flow_buffer == 0 {
            return Err(EngineError::InvalidConfig(
                "reassembly.max_flow_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortConfig {
    pub enip: Vec<u16>,
    pub modbus: Vec<u16>,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            enip: vec![ENIP_TCP_PORT, ENIP_IO_PORT],
            modbus: vec![MODBUS_PORT],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Upper bound on retained bytes per flow direction.
    pub max_flow_buffer: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig { max_flow_buffer: 1 << 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Run the DH+ detector on payloads from unclassified ports.
    pub detect_dhplus: bool,
    /// Emit `Unknown` messages for unclassified payloads instead of dropping them.
    pub keep_unknown: bool,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        HeuristicsConfig {
            detect_dhplus: true,
            keep_unknown: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ports.enip, vec![44818, 2222]);
        assert_eq!(config.ports.modbus, vec![502]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            "[ports]\nmodbus = [502, 5020]\n\n[heuristics]\nkeep_unknown = true\n",
        )
        .unwrap();
        assert_eq!(config.ports.modbus, vec![502, 5020]);
        assert_eq!(config.ports.enip, vec![44818, 2222]);
        assert!(config.heuristics.keep_unknown);
        assert!(config.heuristics.detect_dhplus);
    }

    #[test]
    fn test_overlapping_ports_rejected() {
        let err = EngineConfig::from_toml_str("[ports]\nenip = [502]\n").unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = EngineConfig::from_toml_str("[reassembly]\nmax_flow_buffer = 0\n").unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = EngineConfig::from_toml_str("[ports\nenip = ").unwrap_err();
        assert!(matches!(err, EngineError::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[reassembly]\nmax_flow_buffer = 4096").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.reassembly.max_flow_buffer, 4096);
    }
}
