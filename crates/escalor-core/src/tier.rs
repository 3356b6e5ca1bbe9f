use crate::{EscalorError, EscalorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single executor tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    /// Unique tier name, referenced by decisions and workflow steps.
    pub name: String,
    /// Position on the capability ladder. Escalation targets the next tier
    /// with a strictly higher priority.
    pub priority: u32,
    /// Quota units one execution on this tier consumes.
    #[serde(default = "default_cost")]
    pub cost: u64,
    /// Command argv invoked to execute work on this tier. The payload is
    /// appended as the final argument.
    pub command: Vec<String>,
    /// Wall-clock bound on a single handler invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Quota units admitted per window.
    pub quota_limit: u64,
    /// Tier to fall back to when this tier's quota is exhausted at
    /// admission time. Chains are walked transitively.
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_cost() -> u64 {
    1
}

fn default_timeout_secs() -> u64 {
    300
}

/// The validated set of configured tiers.
///
/// Construction rejects duplicate names, empty commands, fallback links to
/// unknown tiers, and cyclic fallback chains, so lookups and chain walks
/// never fail at enforcement time.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: Vec<TierSpec>,
}

impl TierCatalog {
    pub fn new(tiers: Vec<TierSpec>) -> EscalorResult<Self> {
        if tiers.is_empty() {
            return Err(EscalorError::Config("no tiers configured".to_string()));
        }

        let mut names = HashSet::new();
        for tier in &tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(EscalorError::Config(format!(
                    "duplicate tier name '{}'",
                    tier.name
                )));
            }
            if tier.command.is_empty() {
                return Err(EscalorError::Config(format!(
                    "tier '{}' has an empty command",
                    tier.name
                )));
            }
        }

        for tier in &tiers {
            if let Some(fb) = &tier.fallback {
                if !names.contains(fb.as_str()) {
                    return Err(EscalorError::Config(format!(
                        "tier '{}' falls back to unknown tier '{fb}'",
                        tier.name
                    )));
                }
            }
        }

        let catalog = Self { tiers };
        for tier in &catalog.tiers {
            catalog.check_fallback_acyclic(tier)?;
        }
        Ok(catalog)
    }

    fn check_fallback_acyclic(&self, start: &TierSpec) -> EscalorResult<()> {
        let mut seen = HashSet::new();
        let mut current = start;
        seen.insert(current.name.as_str());
        while let Some(fb) = &current.fallback {
            if !seen.insert(fb.as_str()) {
                return Err(EscalorError::Config(format!(
                    "fallback cycle involving tier '{}'",
                    start.name
                )));
            }
            match self.get(fb) {
                Some(next) => current = next,
                None => break, // unreachable after link validation
            }
        }
        Ok(())
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// The fallback chain starting at (and including) `name`, in admission
    /// order. Empty when `name` is unknown.
    pub fn fallback_chain(&self, name: &str) -> Vec<&TierSpec> {
        let mut chain = Vec::new();
        let mut current = self.get(name);
        while let Some(tier) = current {
            chain.push(tier);
            current = tier.fallback.as_deref().and_then(|fb| self.get(fb));
        }
        chain
    }

    /// The escalation target for `name`: the configured tier with the lowest
    /// priority strictly above the given tier's.
    pub fn next_higher(&self, name: &str) -> Option<&TierSpec> {
        let current = self.get(name)?;
        self.tiers
            .iter()
            .filter(|t| t.priority > current.priority)
            .min_by_key(|t| t.priority)
    }

    /// All configured tiers, in configuration order.
    pub fn all(&self) -> &[TierSpec] {
        &self.tiers
    }
}
