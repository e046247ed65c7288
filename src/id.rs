//! Replica-local identity minting.
//!
//! Every attached node and every object-update operation carries an id of
//! the shape `"<actor>:<clock>"`. `actor` names a replica and is fixed for
//! the lifetime of a [`crate::doc::Document`]; `clock` is a monotonic
//! per-replica counter. Two independent counters exist per document: one
//! mints node ids, the other mints operation ids (§4.7/GLOSSARY).
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Small integer naming a replica uniquely across a shared session.
pub type Actor = u32;

/// A monotonically increasing per-replica counter.
pub type Clock = u64;

/// A globally unique identifier of the form `"<actor>:<clock>"`.
///
/// The same shape is reused for operation identities (see [`OpId`], a
/// transparent alias): both are minted from independent counters on the
/// same replica.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Id {
    actor: Actor,
    clock: Clock,
}

impl Id {
    pub fn new(actor: Actor, clock: Clock) -> Self {
        Self { actor, clock }
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor, self.clock)
    }
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (actor, clock) = s.split_once(':').ok_or(ParseIdError)?;
        let actor = actor.parse().map_err(|_| ParseIdError)?;
        let clock = clock.parse().map_err(|_| ParseIdError)?;
        Ok(Self { actor, clock })
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for Id {
    type Error = ParseIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Failure parsing an [`Id`]/[`OpId`] from its `"actor:clock"` string form.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct ParseIdError;

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid id, expected \"actor:clock\"")
    }
}

impl std::error::Error for ParseIdError {}

/// An operation identity, minted from the per-replica `opClock` rather than
/// the node-id clock. Shares [`Id`]'s `"<actor>:<clock>"` shape (§4.3).
pub type OpId = Id;

/// A monotonic per-replica counter used to mint [`Id`]s or [`OpId`]s.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Minter {
    actor: Actor,
    next: Clock,
}

impl Minter {
    pub fn new(actor: Actor) -> Self {
        Self { actor, next: 0 }
    }

    pub fn mint(&mut self) -> Id {
        let id = Id::new(self.actor, self.next);
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip() {
        let id = Id::new(3, 42);
        assert_eq!(id.to_string(), "3:42");
        assert_eq!(id.to_string().parse::<Id>().unwrap(), id);
    }

    #[test]
    fn rejects_malformed() {
        assert!("no-colon".parse::<Id>().is_err());
        assert!("1:".parse::<Id>().is_err());
        assert!(":1".parse::<Id>().is_err());
        assert!("a:1".parse::<Id>().is_err());
    }

    #[test]
    fn minter_is_monotonic_per_actor() {
        let mut m = Minter::new(7);
        let a = m.mint();
        let b = m.mint();
        assert_eq!(a.actor(), 7);
        assert_eq!(b.actor(), 7);
        assert!(b.clock() > a.clock());
    }
}
