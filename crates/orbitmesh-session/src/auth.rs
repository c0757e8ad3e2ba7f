//! Session authentication: long-lived access tokens and one-time bootstrap
//! tokens exchanged for a durable credential on first connect.

use dashmap::{DashMap, DashSet};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Result of evaluating a Hello's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Known access token.
    Known { agent_id: Uuid },
    /// Bootstrap token consumed; a fresh credential was minted.
    Enrolled { agent_id: Uuid, credential: String },
    /// No usable credential. Terminal for the session.
    Denied,
}

/// Token table. In production the access map is hydrated from the agent
/// store at startup (credential fingerprints); bootstrap tokens are minted
/// by an operator and registered here.
#[derive(Default)]
pub struct TokenAuthenticator {
    access: DashMap<String, Uuid>,
    bootstrap: DashSet<String>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a durable credential for an agent.
    pub fn register_access_token(&self, token: &str, agent_id: Uuid) {
        self.access.insert(token.to_string(), agent_id);
    }

    /// Add a single-use enrollment token.
    pub fn add_bootstrap_token(&self, token: &str) {
        self.bootstrap.insert(token.to_string());
    }

    /// Evaluate a Hello. An access token wins over a bootstrap token when
    /// both are (incorrectly) present.
    pub fn authenticate(
        &self,
        access_token: Option<&str>,
        bootstrap_token: Option<&str>,
    ) -> AuthDecision {
        if let Some(token) = access_token {
            return match self.access.get(token) {
                Some(entry) => AuthDecision::Known { agent_id: *entry },
                None => AuthDecision::Denied,
            };
        }
        if let Some(token) = bootstrap_token {
            // One-time: the remove is the consume.
            if self.bootstrap.remove(token).is_some() {
                let agent_id = Uuid::now_v7();
                let credential = format!("omt-{}", Uuid::new_v4().simple());
                self.access.insert(credential.clone(), agent_id);
                return AuthDecision::Enrolled {
                    agent_id,
                    credential,
                };
            }
            return AuthDecision::Denied;
        }
        AuthDecision::Denied
    }
}

/// SHA-256 fingerprint of a credential, stored on the agent record instead
/// of the credential itself.
pub fn credential_fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    format!("sha256:{digest:x}")
}
