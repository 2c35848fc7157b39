//! Transaction admission rules
//!
//! An ordered list of allow rules is evaluated against each decoded
//! transaction; the first fully-matching rule wins. Rules can carry a
//! rate-limit bucket which is checked inline as part of the match, so a
//! rule whose bucket is exhausted rejects the transaction rather than
//! falling through to later rules.

use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::tx::DecodedTransaction;
use alloy_primitives::U256;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Rule configuration rejected at load time
#[derive(Debug, Error)]
pub enum RuleError {
    /// A list mixes `0x…` and `!0x…` entries
    #[error("address list may not mix positive and negated patterns")]
    MixedAddressList,

    /// A wildcard shares a list with other patterns
    #[error("wildcard must be the only entry of an address list")]
    WildcardNotAlone,

    /// A rate-limit rule keys by method with no address dimension
    #[error("rate limit rule {0} keys by method only; set perFrom or perTo as well")]
    MethodOnlyBucket(String),
}

/// A single address pattern of an allow list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPattern {
    /// `*` - matches any address
    Wildcard,
    /// `0x…` - exact match, case-insensitive
    Exact(String),
    /// `!0x…` - matches anything except this address
    Negated(String),
}

impl AddressPattern {
    /// Parses one pattern string; exact and negated forms are normalized
    /// to lowercase
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            Self::Wildcard
        } else if let Some(rest) = raw.strip_prefix('!') {
            Self::Negated(rest.to_lowercase())
        } else {
            Self::Exact(raw.to_lowercase())
        }
    }

    /// Whether this pattern allows the given address
    pub fn allows(&self, addr: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(want) => addr.eq_ignore_ascii_case(want),
            Self::Negated(deny) => !addr.eq_ignore_ascii_case(deny),
        }
    }
}

/// Single-pattern convenience used throughout rule evaluation
pub fn is_allowed_string(pattern: &str, value: &str) -> bool {
    AddressPattern::parse(pattern).allows(value)
}

/// Parses a raw pattern list, enforcing the load-time invariants:
/// a wildcard must stand alone, and a list is uniformly positive or
/// uniformly negated.
pub fn parse_pattern_list(raw: &[String]) -> Result<Vec<AddressPattern>, RuleError> {
    let patterns: Vec<AddressPattern> = raw.iter().map(|s| AddressPattern::parse(s)).collect();

    if patterns.len() > 1 && patterns.iter().any(|p| *p == AddressPattern::Wildcard) {
        return Err(RuleError::WildcardNotAlone);
    }

    let negated = patterns.iter().filter(|p| matches!(p, AddressPattern::Negated(_))).count();
    let positive = patterns.iter().filter(|p| matches!(p, AddressPattern::Exact(_))).count();
    if negated > 0 && positive > 0 {
        return Err(RuleError::MixedAddressList);
    }

    Ok(patterns)
}

/// Whether an address passes a (validated) pattern list
///
/// A negated list requires the address to clear every entry; a positive
/// list requires a single match. An empty list allows nothing.
pub fn list_allows(list: &[AddressPattern], addr: &str) -> bool {
    if list.is_empty() {
        return false;
    }
    if list.iter().any(|p| matches!(p, AddressPattern::Negated(_))) {
        list.iter().all(|p| p.allows(addr))
    } else {
        list.iter().any(|p| p.allows(addr))
    }
}

/// Value comparison condition over a big unsigned integer
///
/// Any subset of the known operators may be set; all set operators must
/// pass. Unknown keys (captured via the flatten map) fail the whole
/// condition closed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComparisonSet {
    /// equal
    pub eq: Option<String>,
    /// not equal
    pub nq: Option<String>,
    /// greater than
    pub gt: Option<String>,
    /// greater than or equal
    pub gte: Option<String>,
    /// less than
    pub lt: Option<String>,
    /// less than or equal
    pub lte: Option<String>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

/// Parses a decimal or `0x`-prefixed hex big integer
fn parse_u256(raw: &str) -> Option<U256> {
    if let Some(hex) = raw.strip_prefix("0x") {
        U256::from_str_radix(hex, 16).ok()
    } else {
        U256::from_str_radix(raw, 10).ok()
    }
}

impl ComparisonSet {
    /// True when no operator (known or unknown) is present
    pub fn is_empty(&self) -> bool {
        self.eq.is_none()
            && self.nq.is_none()
            && self.gt.is_none()
            && self.gte.is_none()
            && self.lt.is_none()
            && self.lte.is_none()
            && self.unknown.is_empty()
    }

    /// Evaluates the condition against a value; unparsable bounds and
    /// unknown operators disallow
    pub fn allows(&self, value: U256) -> bool {
        if !self.unknown.is_empty() {
            return false;
        }

        let checks: [(&Option<String>, fn(U256, U256) -> bool); 6] = [
            (&self.eq, |v, b| v == b),
            (&self.nq, |v, b| v != b),
            (&self.gt, |v, b| v > b),
            (&self.gte, |v, b| v >= b),
            (&self.lt, |v, b| v < b),
            (&self.lte, |v, b| v <= b),
        ];

        for (bound, check) in checks {
            if let Some(raw) = bound {
                match parse_u256(raw) {
                    Some(b) if check(value, b) => {}
                    _ => return false,
                }
            }
        }

        true
    }
}

/// Identifies one rate-limit quota bucket
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Bucket name; first segment of the composite key
    pub name: String,
    /// Quota interval in seconds
    pub interval: u64,
    /// Maximum admissions per interval across all gateway processes
    pub limit: u64,
    /// Partition the bucket by sender address
    #[serde(default)]
    pub per_from: bool,
    /// Partition the bucket by recipient address
    #[serde(default)]
    pub per_to: bool,
    /// Partition the bucket by 4-byte method selector
    #[serde(default)]
    pub per_method: bool,
}

impl RateLimitRule {
    /// Rejects bucket configurations that would produce thundering-herd
    /// keys: a method-only partition with no address dimension
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.per_method && !self.per_from && !self.per_to {
            return Err(RuleError::MethodOnlyBucket(self.name.clone()));
        }
        Ok(())
    }

    /// The quota interval in milliseconds
    pub fn interval_millis(&self) -> u64 {
        self.interval * 1000
    }

    /// Builds the composite bucket key for a transaction:
    /// `name:from|*:to|*:selector|*`
    pub fn bucket_key(&self, tx: &DecodedTransaction) -> String {
        let from = if self.per_from { tx.from_hex() } else { "*".to_string() };
        let to = if self.per_to {
            tx.to_hex().unwrap_or_else(|| "*".to_string())
        } else {
            "*".to_string()
        };
        let method = if self.per_method {
            tx.selector().unwrap_or_else(|| "*".to_string())
        } else {
            "*".to_string()
        };
        format!("{}:{from}:{to}:{method}", self.name)
    }
}

/// Raw (unvalidated) allow-rule entry as it appears in the rule file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxAllowRuleConfig {
    /// Sender patterns
    pub from_list: Vec<String>,
    /// Recipient patterns
    pub to_list: Vec<String>,
    /// Optional value condition
    #[serde(default)]
    pub value_condition: Option<ComparisonSet>,
    /// Optional rate-limit bucket for this rule
    #[serde(default)]
    pub rate_limit: Option<RateLimitRule>,
}

/// A validated allow rule
#[derive(Debug, Clone)]
pub struct TxAllowRule {
    /// Sender patterns
    pub from_list: Vec<AddressPattern>,
    /// Recipient patterns
    pub to_list: Vec<AddressPattern>,
    /// Optional value condition
    pub value_condition: Option<ComparisonSet>,
    /// Optional rate-limit bucket
    pub rate_limit: Option<RateLimitRule>,
}

impl TxAllowRule {
    /// Validates one rule file entry
    pub fn from_config(cfg: TxAllowRuleConfig) -> Result<Self, RuleError> {
        if let Some(rl) = &cfg.rate_limit {
            rl.validate()?;
        }
        Ok(Self {
            from_list: parse_pattern_list(&cfg.from_list)?,
            to_list: parse_pattern_list(&cfg.to_list)?,
            value_condition: cfg.value_condition,
            rate_limit: cfg.rate_limit,
        })
    }

    /// Whether the transaction passes this rule's lists and condition
    fn matches(&self, tx: &DecodedTransaction) -> bool {
        if !list_allows(&self.from_list, &tx.from_hex()) {
            return false;
        }
        let to = tx.to_hex().unwrap_or_default();
        if !list_allows(&self.to_list, &to) {
            return false;
        }
        if let Some(cond) = &self.value_condition {
            if !cond.is_empty() && !cond.allows(tx.value) {
                return false;
            }
        }
        true
    }
}

/// Evaluates the ordered rule list against decoded transactions
///
/// Owns the process-wide deploy allow-list and the unlimited-address
/// list; both are constructed once at startup and handed to the gateway
/// by reference.
pub struct RuleMatcher {
    rules: Vec<TxAllowRule>,
    deploy_allow: Vec<AddressPattern>,
    unlimited: HashSet<String>,
}

impl RuleMatcher {
    /// Builds a matcher from validated parts
    pub fn new(
        rules: Vec<TxAllowRule>,
        deploy_allow: Vec<AddressPattern>,
        unlimited: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            rules,
            deploy_allow,
            unlimited: unlimited.into_iter().map(|a| a.to_lowercase()).collect(),
        }
    }

    /// Matches a transaction against the rule list, checking the matched
    /// rule's rate limit inline
    ///
    /// Returns the rate-limit bucket to charge on success, or `None` when
    /// the matched rule is unlimited for this sender. A rate-limit
    /// failure aborts the match; later rules are not consulted.
    pub async fn match_transaction<'a>(
        &'a self,
        tx: &DecodedTransaction,
        limiter: &RateLimiter,
    ) -> Result<Option<(String, &'a RateLimitRule)>, GatewayError> {
        for rule in &self.rules {
            if !rule.matches(tx) {
                continue;
            }
            if let Some(rl) = &rule.rate_limit {
                if !self.is_unlimited(&tx.from_hex()) {
                    let key = rl.bucket_key(tx);
                    limiter.check(&key, rl).await?;
                    return Ok(Some((key, rl)));
                }
            }
            return Ok(None);
        }
        Err(GatewayError::TransactionNotAllowed)
    }

    /// Deploy transactions bypass the rule list and check the deploy
    /// allow-list by sender only
    pub fn check_deploy(&self, from: &str) -> Result<(), GatewayError> {
        if list_allows(&self.deploy_allow, from) {
            Ok(())
        } else {
            Err(GatewayError::DeployNotAllowed)
        }
    }

    /// Whether a sender is exempt from rate limiting
    pub fn is_unlimited(&self, from: &str) -> bool {
        self.unlimited.contains(&from.to_lowercase())
    }
}
