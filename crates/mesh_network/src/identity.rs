//! Peer and agent identity.
//!
//! [`PeerId`] names one transport-level connection endpoint. Agent ids are
//! logical names chosen by agents; [`IdentityManager`] lets an agent claim
//! its id and later prove ownership with an [`AgentCertificate`], which is
//! what allows a reconnecting agent to take over a stale registration.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::NetworkError;

/// A unique identifier for a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof that an agent id was claimed on a given network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCertificate {
    pub agent_id: String,
    pub network_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Hex SHA-256 over the issuing network's secret and the fields above.
    pub signature: String,
}

/// Issues and checks agent-id certificates for one network.
pub struct IdentityManager {
    network_id: String,
    secret: [u8; 32],
    validity: Duration,
    claims: HashMap<String, AgentCertificate>,
}

impl IdentityManager {
    /// Create a manager with a fresh random secret.
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            secret: rand::random(),
            validity: Duration::hours(24),
            claims: HashMap::new(),
        }
    }

    /// Override how long issued certificates stay valid.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Claim `agent_id` and return a certificate for it.
    ///
    /// An id with an unexpired claim can only be re-claimed with `force`.
    pub fn claim_agent_id(
        &mut self,
        agent_id: &str,
        force: bool,
    ) -> Result<AgentCertificate, NetworkError> {
        if agent_id.trim().is_empty() {
            return Err(NetworkError::Protocol("agent_id is required".into()));
        }

        let now = Utc::now();
        if let Some(existing) = self.claims.get(agent_id) {
            if existing.expires_at > now && !force {
                return Err(NetworkError::DuplicateAgent(agent_id.to_string()));
            }
        }

        let mut cert = AgentCertificate {
            agent_id: agent_id.to_string(),
            network_id: self.network_id.clone(),
            issued_at: now,
            expires_at: now + self.validity,
            signature: String::new(),
        };
        cert.signature = self.sign(&cert);
        self.claims.insert(agent_id.to_string(), cert.clone());
        tracing::debug!("Issued certificate for agent '{agent_id}'");
        Ok(cert)
    }

    /// Check a certificate's signature, network and expiry.
    pub fn validate(&self, cert: &AgentCertificate) -> bool {
        cert.network_id == self.network_id
            && cert.expires_at > Utc::now()
            && self.sign(cert) == cert.signature
    }

    /// Whether `cert` is valid and names `agent_id`.
    pub fn validate_for(&self, cert: &AgentCertificate, agent_id: &str) -> bool {
        cert.agent_id == agent_id && self.validate(cert)
    }

    /// Drop the claim on `agent_id`.
    pub fn release(&mut self, agent_id: &str) -> bool {
        self.claims.remove(agent_id).is_some()
    }

    fn sign(&self, cert: &AgentCertificate) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(cert.agent_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(cert.network_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(cert.issued_at.timestamp_micros().to_be_bytes());
        hasher.update(cert.expires_at.timestamp_micros().to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
