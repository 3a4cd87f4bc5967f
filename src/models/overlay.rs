use serde::{Deserialize, Serialize};
use std::fmt;

/// Directory entry of a device registered on the overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayIdentity {
    pub id: String,
    /// Short host name the device registered with.
    pub name: String,
    pub fqdn: String,
    pub addresses: Vec<String>,
    pub online: bool,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub last_seen: Option<String>,
}

impl OverlayIdentity {
    /// Leftmost label of the FQDN.
    pub fn fqdn_label(&self) -> &str {
        self.fqdn.split('.').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    Exact,
    NormalizedExact,
    FqdnPrefix,
    None,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::Exact => "exact",
            Confidence::NormalizedExact => "normalized-exact",
            Confidence::FqdnPrefix => "fqdn-prefix",
            Confidence::None => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub identity: Option<OverlayIdentity>,
    pub confidence: Confidence,
}

impl MatchCandidate {
    pub fn none() -> Self {
        Self {
            identity: None,
            confidence: Confidence::None,
        }
    }

    pub fn found(identity: &OverlayIdentity, confidence: Confidence) -> Self {
        Self {
            identity: Some(identity.clone()),
            confidence,
        }
    }

    /// A removal prompt may be shown at all.
    pub fn is_actionable(&self) -> bool {
        self.identity.is_some() && self.confidence != Confidence::None
    }

    /// `--force` may skip the prompt for this candidate. FQDN-label matches
    /// are always confirmed interactively.
    pub fn allows_unattended_removal(&self) -> bool {
        matches!(self.confidence, Confidence::Exact | Confidence::NormalizedExact)
            && self.identity.is_some()
    }
}
