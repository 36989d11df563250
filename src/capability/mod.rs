//! Capability tokens and the gate that checks them.
//!
//! A [`CapabilityToken`] is captured when a handle (or [`Fs`](crate::fs::Fs)
//! bridge) is constructed and travels with it. Later checks, notably the one
//! made for every accepted connection, consult that captured token rather
//! than whatever context happens to be running at the time.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A single grantable authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Own native handles and accept connections on them.
    Handle,
    /// Spawn child processes.
    Spawn,
    /// Watch or deliver signals.
    Signal,
    /// Touch the filesystem.
    Filesystem,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Handle,
        Capability::Spawn,
        Capability::Signal,
        Capability::Filesystem,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handle => "handle",
            Self::Spawn => "spawn",
            Self::Signal => "signal",
            Self::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of capabilities. Serializes as a list of names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct CapabilityToken {
    grants: u8,
}

impl CapabilityToken {
    /// A token that permits nothing.
    pub const fn empty() -> Self {
        Self { grants: 0 }
    }

    /// A token that permits everything.
    pub fn all() -> Self {
        Self::new(Capability::ALL)
    }

    pub fn new(grants: impl IntoIterator<Item = Capability>) -> Self {
        let grants = grants.into_iter().fold(0, |acc, cap| acc | cap.bit());
        Self { grants }
    }

    pub fn permits(&self, capability: Capability) -> bool {
        self.grants & capability.bit() != 0
    }

    /// Returns a copy with `capability` added.
    pub fn with(mut self, capability: Capability) -> Self {
        self.grants |= capability.bit();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.grants == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|cap| self.permits(*cap))
    }
}

impl From<Vec<Capability>> for CapabilityToken {
    fn from(grants: Vec<Capability>) -> Self {
        Self::new(grants)
    }
}

impl From<CapabilityToken> for Vec<Capability> {
    fn from(token: CapabilityToken) -> Self {
        token.iter().collect()
    }
}

/// A capability check refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("permission denied: {action} requires the '{capability}' capability")]
    Denied {
        capability: Capability,
        action: &'static str,
    },
}

impl PermissionError {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Denied { capability, .. } => *capability,
        }
    }
}

/// Authorizes native operations.
///
/// Handle *creation* is checked against the grants the bridge itself holds
/// (configured per reactor). Everything else, accepting connections
/// included, is checked against the token the caller captured.
#[derive(Debug, Clone)]
pub struct CapabilityGate {
    runtime: CapabilityToken,
}

impl CapabilityGate {
    pub fn new(runtime: CapabilityToken) -> Self {
        Self { runtime }
    }

    /// The grants held by the bridge itself.
    pub fn runtime(&self) -> CapabilityToken {
        self.runtime
    }

    /// Checked before any native resource is allocated.
    pub fn authorize_create(&self, action: &'static str) -> Result<(), PermissionError> {
        check(&self.runtime, Capability::Handle, action)
    }

    /// Checked once per incoming connection, against the listener's token.
    pub fn authorize_accept(&self, listener: &CapabilityToken) -> Result<(), PermissionError> {
        check(listener, Capability::Handle, "accept")
    }

    pub fn authorize_spawn(&self, token: &CapabilityToken) -> Result<(), PermissionError> {
        check(token, Capability::Spawn, "spawn")
    }

    pub fn authorize_signal(&self, token: &CapabilityToken) -> Result<(), PermissionError> {
        check(token, Capability::Signal, "signal")
    }

    pub fn authorize_fs(&self, token: &CapabilityToken) -> Result<(), PermissionError> {
        check(token, Capability::Filesystem, "filesystem access")
    }
}

fn check(
    token: &CapabilityToken,
    capability: Capability,
    action: &'static str,
) -> Result<(), PermissionError> {
    if token.permits(capability) {
        return Ok(());
    }
    warn!(%capability, action, "capability check failed");
    Err(PermissionError::Denied { capability, action })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_permits_nothing() {
        let token = CapabilityToken::empty();
        for cap in Capability::ALL {
            assert!(!token.permits(cap));
        }
        assert!(token.is_empty());
    }

    #[test]
    fn with_adds_one() {
        let token = CapabilityToken::empty().with(Capability::Handle);
        assert!(token.permits(Capability::Handle));
        assert!(!token.permits(Capability::Spawn));
    }

    #[test]
    fn serde_as_names() {
        let token = CapabilityToken::new([Capability::Signal, Capability::Handle]);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#"["handle","signal"]"#);
        let back: CapabilityToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn accept_uses_listener_token() {
        let gate = CapabilityGate::new(CapabilityToken::all());
        assert!(gate.authorize_create("tcp").is_ok());
        let err = gate.authorize_accept(&CapabilityToken::empty()).unwrap_err();
        assert_eq!(err.capability(), Capability::Handle);
        assert!(
            gate.authorize_accept(&CapabilityToken::empty().with(Capability::Handle))
                .is_ok()
        );
    }

    #[test]
    fn runtime_without_handle_refuses_creation() {
        let gate = CapabilityGate::new(CapabilityToken::empty().with(Capability::Spawn));
        assert!(gate.authorize_create("tcp").is_err());
    }
}
