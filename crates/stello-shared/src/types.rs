//! Core identifier and enum types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::KEY_SEPARATOR;
use crate::error::IdentityError;

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Opaque user identifier, assigned by the external auth service.
///
/// The core never inspects the id beyond checking that it is usable inside a
/// conversation key (non-empty, no separator character).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate that the id can appear inside a conversation key.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.0.is_empty() || self.0.contains(KEY_SEPARATOR) {
            return Err(IdentityError::InvalidUserId(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Unique message identifier, assigned by the store at append time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ConversationKey
// ---------------------------------------------------------------------------

/// Stable identifier for the conversation between two participants.
///
/// Derivation is commutative: `derive(a, b) == derive(b, a)`.  The two ids
/// are sorted lexicographically and joined with [`KEY_SEPARATOR`], which is
/// guaranteed (by validation) not to appear in either id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Derive the key for the unordered pair `(a, b)`.
    ///
    /// Fails with [`IdentityError::SameParticipant`] when both ids are equal
    /// and [`IdentityError::InvalidUserId`] when either id is empty or
    /// contains the separator.
    pub fn derive(a: &UserId, b: &UserId) -> Result<Self, IdentityError> {
        a.validate()?;
        b.validate()?;
        if a == b {
            return Err(IdentityError::SameParticipant);
        }

        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{lo}{KEY_SEPARATOR}{hi}")))
    }

    /// Parse a key that was previously produced by [`ConversationKey::derive`].
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let (lo, hi) = s
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| IdentityError::InvalidKey(s.to_string()))?;
        if lo.is_empty() || hi.is_empty() || hi.contains(KEY_SEPARATOR) || lo >= hi {
            return Err(IdentityError::InvalidKey(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The two participant ids, in the key's sorted order.
    pub fn participants(&self) -> (UserId, UserId) {
        // Well-formed by construction.
        let (lo, hi) = self.0.split_once(KEY_SEPARATOR).unwrap_or((&self.0, ""));
        (UserId::new(lo), UserId::new(hi))
    }

    /// Whether `user` is one of the two participants.
    pub fn involves(&self, user: &UserId) -> bool {
        let (lo, hi) = self.participants();
        lo == *user || hi == *user
    }

    /// Given one participant, return the other.
    pub fn other(&self, user: &UserId) -> Option<UserId> {
        let (lo, hi) = self.participants();
        if lo == *user {
            Some(hi)
        } else if hi == *user {
            Some(lo)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// User role, fixed at registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Patient => "patient",
        }
    }

    /// The role on the other side of a doctor/patient pairing.
    pub fn counterpart(&self) -> Option<Role> {
        match self {
            Role::Doctor => Some(Role::Patient),
            Role::Patient => Some(Role::Doctor),
            Role::Admin => None,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "doctor" => Ok(Role::Doctor),
            "patient" => Ok(Role::Patient),
            other => Err(format!("unknown role: {other:?}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Best-effort online/offline status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Online => f.write_str("online"),
            Presence::Offline => f.write_str("offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_commutative() {
        let a = UserId::from("uid-alpha");
        let b = UserId::from("uid-beta");

        let k1 = ConversationKey::derive(&a, &b).unwrap();
        let k2 = ConversationKey::derive(&b, &a).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn derive_rejects_same_participant() {
        let a = UserId::from("uid-alpha");
        assert_eq!(
            ConversationKey::derive(&a, &a),
            Err(IdentityError::SameParticipant)
        );
    }

    #[test]
    fn derive_rejects_bad_ids() {
        let good = UserId::from("uid-alpha");
        let empty = UserId::from("");
        let with_sep = UserId::from("uid:alpha");

        assert!(matches!(
            ConversationKey::derive(&empty, &good),
            Err(IdentityError::InvalidUserId(_))
        ));
        assert!(matches!(
            ConversationKey::derive(&good, &with_sep),
            Err(IdentityError::InvalidUserId(_))
        ));
    }

    #[test]
    fn participants_round_trip() {
        let a = UserId::from("zeta");
        let b = UserId::from("alpha");
        let key = ConversationKey::derive(&a, &b).unwrap();

        let (lo, hi) = key.participants();
        assert_eq!(lo, b);
        assert_eq!(hi, a);
        assert!(key.involves(&a));
        assert_eq!(key.other(&a), Some(b));
        assert_eq!(key.other(&UserId::from("nobody")), None);
    }

    #[test]
    fn parse_accepts_only_derived_form() {
        assert!(ConversationKey::parse("alpha:zeta").is_ok());
        assert!(ConversationKey::parse("alpha").is_err());
        assert!(ConversationKey::parse("zeta:alpha").is_err());
        assert!(ConversationKey::parse("a:b:c").is_err());
    }

    #[test]
    fn role_parse_and_display() {
        assert_eq!("doctor".parse::<Role>().unwrap(), Role::Doctor);
        assert_eq!(Role::Patient.to_string(), "patient");
        assert!("nurse".parse::<Role>().is_err());
        assert_eq!(Role::Doctor.counterpart(), Some(Role::Patient));
        assert_eq!(Role::Admin.counterpart(), None);
    }
}
