use tracing::debug;

use crate::models::{Confidence, MatchCandidate, OverlayIdentity};

/// Finds the directory entry most likely registered by `hostname`.
///
/// Each rule is tried against the whole directory before the next, weaker
/// one; within a rule the first entry in directory order wins.
pub fn find_candidate(hostname: &str, directory: &[OverlayIdentity]) -> MatchCandidate {
    if let Some(identity) = directory.iter().find(|i| i.name == hostname) {
        return MatchCandidate::found(identity, Confidence::Exact);
    }

    let wanted = hostname.trim();
    if wanted.is_empty() {
        return MatchCandidate::none();
    }

    if let Some(identity) = directory
        .iter()
        .find(|i| i.name.trim().eq_ignore_ascii_case(wanted))
    {
        return MatchCandidate::found(identity, Confidence::NormalizedExact);
    }

    if let Some(identity) = directory
        .iter()
        .find(|i| !i.fqdn.is_empty() && i.fqdn_label().eq_ignore_ascii_case(wanted))
    {
        return MatchCandidate::found(identity, Confidence::FqdnPrefix);
    }

    debug!("No overlay identity matches {}", hostname);
    MatchCandidate::none()
}
