//! Per-project firewall configuration

use serde::{Deserialize, Serialize};

use crate::error::{FirewallError, FirewallResult};
use crate::whitelist::IpWhitelist;

pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    pub enabled: bool,
    pub rate_limit_per_minute: u32,
    pub auto_block_suspicious: bool,
    pub whitelist_ips: Vec<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            auto_block_suspicious: false,
            whitelist_ips: Vec::new(),
        }
    }
}

impl FirewallConfig {
    /// Validate before saving; trims whitelist entries in place
    pub fn validate(&mut self) -> FirewallResult<()> {
        if self.rate_limit_per_minute == 0 {
            return Err(FirewallError::InvalidConfig(
                "rate_limit must be at least 1 request per minute".to_string(),
            ));
        }
        self.whitelist_ips = self
            .whitelist_ips
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        IpWhitelist::parse(&self.whitelist_ips)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FirewallConfig::default();
        assert!(config.enabled);
        assert_eq!(config.rate_limit_per_minute, 100);
        assert!(!config.auto_block_suspicious);
        assert!(config.whitelist_ips.is_empty());
    }

    #[test]
    fn test_validate_trims_and_checks_whitelist() {
        let mut config = FirewallConfig {
            whitelist_ips: vec![" 10.0.0.0/8 ".into(), "".into()],
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.whitelist_ips, vec!["10.0.0.0/8".to_string()]);

        config.whitelist_ips.push("999.1.1.1".into());
        assert!(matches!(
            config.validate(),
            Err(FirewallError::InvalidWhitelistEntry(_))
        ));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = FirewallConfig {
            rate_limit_per_minute: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
