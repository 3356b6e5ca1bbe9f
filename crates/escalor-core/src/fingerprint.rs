use crate::{EscalorError, EscalorResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed identity of a unit of work.
///
/// Computed as SHA-256 over the normalized payload and the required tier,
/// hex-encoded. The same request routed to the same tier always resolves to
/// the same fingerprint, which is what deduplication and caching key on.
///
/// Deserialization routes through [`Fingerprint::parse`], so a state file
/// carrying a malformed id fails to load instead of producing a value the
/// rest of the system cannot rely on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for a payload routed to a tier.
    pub fn compute(payload: &str, tier: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize(payload).as_bytes());
        // Separator keeps ("ab", "c") distinct from ("a", "bc")
        hasher.update([0x1f]);
        hasher.update(tier.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a fingerprint from its hex form (64 lowercase hex digits).
    pub fn parse(s: &str) -> EscalorResult<Self> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Ok(Self(s.to_string()))
        } else {
            Err(EscalorError::Config(format!(
                "invalid fingerprint '{s}': expected 64 lowercase hex digits"
            )))
        }
    }

    /// The full hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = EscalorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collapse whitespace runs and trim, so cosmetically different payloads
/// fingerprint identically.
fn normalize(payload: &str) -> String {
    payload.split_whitespace().collect::<Vec<_>>().join(" ")
}
