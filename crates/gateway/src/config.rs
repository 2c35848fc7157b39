//! Rule file loading and validation
//!
//! The admission policy - method allow-list, transaction allow rules,
//! deploy and unlimited address lists - lives in one JSON file loaded at
//! startup. Every structural invariant is enforced here, before a matcher
//! is built; a bad rule file refuses to start the gateway.

use crate::gateway::DEFAULT_ALLOWED_METHODS;
use crate::rules::{parse_pattern_list, RuleError, RuleMatcher, TxAllowRule, TxAllowRuleConfig};
use eyre::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// The gateway's admission policy as configured on disk
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesConfig {
    /// JSON-RPC methods the gateway forwards; defaults apply when empty
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    /// Ordered transaction allow rules
    #[serde(default)]
    pub tx_allow_rules: Vec<TxAllowRuleConfig>,
    /// Senders allowed to deploy contracts
    #[serde(default)]
    pub deploy_allow_list: Vec<String>,
    /// Senders exempt from rate limiting
    #[serde(default)]
    pub unlimited_addresses: Vec<String>,
}

impl RulesConfig {
    /// Loads and parses a rule file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read rule file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .wrap_err_with(|| format!("cannot parse rule file {}", path.display()))?;

        info!(
            rules = config.tx_allow_rules.len(),
            methods = config.allowed_methods.len(),
            "loaded rule file"
        );
        Ok(config)
    }

    /// The effective method allow-list
    pub fn allowed_method_set(&self) -> HashSet<String> {
        if self.allowed_methods.is_empty() {
            DEFAULT_ALLOWED_METHODS.iter().map(|m| m.to_string()).collect()
        } else {
            self.allowed_methods.iter().cloned().collect()
        }
    }

    /// Validates the rules and builds the matcher
    pub fn build_matcher(&self) -> Result<RuleMatcher, RuleError> {
        let rules = self
            .tx_allow_rules
            .iter()
            .cloned()
            .map(TxAllowRule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        let deploy_allow = parse_pattern_list(&self.deploy_allow_list)?;

        Ok(RuleMatcher::new(rules, deploy_allow, self.unlimited_addresses.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_rule_file_parses() {
        let raw = r#"{
            "allowedMethods": ["eth_sendRawTransaction", "eth_blockNumber"],
            "txAllowRules": [
                {
                    "fromList": ["*"],
                    "toList": ["0x00000000000000000000000000000000000000bb"],
                    "valueCondition": {"lte": "1000000000000000000"},
                    "rateLimit": {"name": "w", "interval": 60, "limit": 100, "perFrom": true}
                }
            ],
            "deployAllowList": ["0x00000000000000000000000000000000000000aa"],
            "unlimitedAddresses": ["0x00000000000000000000000000000000000000cc"]
        }"#;

        let config: RulesConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.allowed_method_set().len(), 2);
        config.build_matcher().unwrap();
    }

    #[test]
    fn test_empty_method_list_uses_defaults() {
        let config = RulesConfig::default();
        let methods = config.allowed_method_set();
        assert!(methods.contains("eth_sendRawTransaction"));
        assert!(methods.contains("eth_blockNumber"));
    }

    #[test]
    fn test_method_only_bucket_fails_load() {
        let raw = r#"{
            "txAllowRules": [
                {
                    "fromList": ["*"],
                    "toList": ["*"],
                    "rateLimit": {"name": "m", "interval": 60, "limit": 10, "perMethod": true}
                }
            ]
        }"#;

        let config: RulesConfig = serde_json::from_str(raw).unwrap();
        assert!(matches!(config.build_matcher(), Err(RuleError::MethodOnlyBucket(_))));
    }

    #[test]
    fn test_mixed_deploy_list_fails_load() {
        let raw = r#"{"deployAllowList": ["0xaa", "!0xbb"]}"#;
        let config: RulesConfig = serde_json::from_str(raw).unwrap();
        assert!(matches!(config.build_matcher(), Err(RuleError::MixedAddressList)));
    }
}
