use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// The identity a server presents during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub host: String,
    pub port: u16,
    pub key_algorithm: String,
    /// `SHA256:<base64>` fingerprint of the host key.
    pub fingerprint: String,
}

impl HostIdentity {
    pub fn host_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Accept,
    Reject,
}

pub trait TrustPolicy: Send + Sync + fmt::Debug {
    fn evaluate(&self, identity: &HostIdentity) -> TrustDecision;

    /// Insecure policies accept hosts without verifying them.
    fn is_insecure(&self) -> bool {
        false
    }
}

/// Accepts every host key. Insecure: only suitable for tests and trusted networks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAny;

impl TrustPolicy for AcceptAny {
    fn evaluate(&self, identity: &HostIdentity) -> TrustDecision {
        warn!(
            host = %identity.host_key(),
            fingerprint = %identity.fingerprint,
            "accepting host key without verification (insecure accept-any policy)"
        );
        TrustDecision::Accept
    }

    fn is_insecure(&self) -> bool {
        true
    }
}

/// Accepts only fingerprints pinned for the `host:port` being dialed. Fails closed.
#[derive(Debug, Default, Clone)]
pub struct PinnedFingerprint {
    pins: HashMap<String, HashSet<String>>,
}

impl PinnedFingerprint {
    pub fn new() -> PinnedFingerprint {
        PinnedFingerprint::default()
    }

    pub fn pin(&mut self, host: impl Into<String>, fingerprint: &str) -> &mut Self {
        self.pins
            .entry(host.into())
            .or_default()
            .insert(normalize_fingerprint(fingerprint));
        self
    }
}

impl TrustPolicy for PinnedFingerprint {
    fn evaluate(&self, identity: &HostIdentity) -> TrustDecision {
        let host = identity.host_key();
        let presented = normalize_fingerprint(&identity.fingerprint);
        let pinned = self
            .pins
            .get(&host)
            .or_else(|| self.pins.get(&identity.host))
            .is_some_and(|pins| pins.contains(&presented));
        if pinned {
            return TrustDecision::Accept;
        }
        error!(host = %host, fingerprint = %presented, "host key does not match any pinned fingerprint");
        TrustDecision::Reject
    }
}

/// Delegates the decision to caller-supplied code.
#[derive(Clone)]
pub struct CallbackPolicy {
    callback: Arc<dyn Fn(&HostIdentity) -> TrustDecision + Send + Sync>,
}

impl CallbackPolicy {
    pub fn new<F>(callback: F) -> CallbackPolicy
    where
        F: Fn(&HostIdentity) -> TrustDecision + Send + Sync + 'static,
    {
        CallbackPolicy {
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for CallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackPolicy").finish_non_exhaustive()
    }
}

impl TrustPolicy for CallbackPolicy {
    fn evaluate(&self, identity: &HostIdentity) -> TrustDecision {
        (self.callback)(identity)
    }
}

/// Learns the first fingerprint seen for each `host:port` and rejects any later change.
/// Safe to share between sessions.
#[derive(Debug, Default)]
pub struct TrustOnFirstUse {
    seen: Mutex<HashMap<String, String>>,
}

impl TrustOnFirstUse {
    pub fn new() -> TrustOnFirstUse {
        TrustOnFirstUse::default()
    }

    pub fn learned(&self, host: &str) -> Option<String> {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.get(host).cloned()
    }
}

impl TrustPolicy for TrustOnFirstUse {
    fn evaluate(&self, identity: &HostIdentity) -> TrustDecision {
        let host = identity.host_key();
        let presented = normalize_fingerprint(&identity.fingerprint);
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        match seen.get(&host) {
            Some(known) if *known == presented => TrustDecision::Accept,
            Some(known) => {
                error!(
                    host = %host,
                    expected = %known,
                    presented = %presented,
                    "host key changed since first use"
                );
                TrustDecision::Reject
            }
            None => {
                info!(host = %host, fingerprint = %presented, "learned host key on first use");
                seen.insert(host, presented);
                TrustDecision::Accept
            }
        }
    }
}

/// Trust policy selection as it appears in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum TrustConfig {
    #[default]
    AcceptAny,
    Pinned {
        /// `host:port` (or bare host) to accepted fingerprints.
        #[serde(default)]
        fingerprints: HashMap<String, Vec<String>>,
    },
    TrustOnFirstUse,
}

impl TrustConfig {
    pub fn build(&self) -> Arc<dyn TrustPolicy> {
        match self {
            TrustConfig::AcceptAny => Arc::new(AcceptAny),
            TrustConfig::Pinned { fingerprints } => {
                let mut policy = PinnedFingerprint::new();
                for (host, pins) in fingerprints {
                    for fingerprint in pins {
                        policy.pin(host.clone(), fingerprint);
                    }
                }
                Arc::new(policy)
            }
            TrustConfig::TrustOnFirstUse => Arc::new(TrustOnFirstUse::new()),
        }
    }
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    let trimmed = fingerprint.trim();
    let digest = trimmed.strip_prefix("SHA256:").unwrap_or(trimmed);
    format!("SHA256:{}", digest.trim_end_matches('='))
}
