//! Outbound reporting surface: informational lines, technical failures,
//! active-attack warnings, and trust-decision prompts.
//!
//! The engine never talks to a UI directly; hosts plug in a `Reporter`.

use crate::CertHash;

/// Everything a host needs to ask the user about an unknown certificate.
#[derive(Debug, Clone)]
pub struct TrustPrompt {
    pub host_key: String,
    pub cert_hash: CertHash,
    /// Server rating, absent when the server could not be reached.
    pub rating: Option<u8>,
    pub threshold: u8,
    pub report: String,
    pub was_timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Trust,
    Distrust,
    Undecided,
}

pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);

    /// A technical failure. `critical` means the whole client should stop.
    fn technical_failure(&self, message: &str, critical: bool);

    /// Cryptographic integrity failed on a server exchange. Distinct from
    /// ordinary failures: the user is told they may be under attack.
    fn warn_attack(&self, message: &str);

    /// Ask whether to trust a certificate for a host. The engine applies
    /// the answer to the trust cache; `Undecided` leaves the cache alone.
    fn prompt_trust_decision(&self, prompt: &TrustPrompt) -> TrustDecision;
}

/// Reporter that writes everything to the log and never decides trust.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn info(&self, message: &str) {
        log::info!("{message}");
    }

    fn technical_failure(&self, message: &str, critical: bool) {
        if critical {
            log::error!("{message}");
        } else {
            log::warn!("{message}");
        }
    }

    fn warn_attack(&self, message: &str) {
        log::error!("POSSIBLE ATTACK: {message}");
    }

    fn prompt_trust_decision(&self, prompt: &TrustPrompt) -> TrustDecision {
        log::warn!(
            "no interactive prompt available; leaving {} for {} undecided",
            prompt.cert_hash,
            prompt.host_key
        );
        TrustDecision::Undecided
    }
}
