//! Queue identifiers addressing a specific outbound queue of a peer.

use std::fmt;

use crate::address::Address;

/// Distinguishes the application's ordered per-channel queues from the
/// single unordered queue used for acks and health messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalIdentifier {
    /// Used for `Delivered`/`Ping`/`Pong` — the distinguished `UNORDERED`
    /// value from §3 of SPEC_FULL.md.
    Unordered,
    /// Stands in for the host application's channel/queue-specific
    /// identifier (out of scope: what it means is up to the caller).
    Ordered(u64),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueIdentifier {
    pub recipient: Address,
    pub canonical_identifier: CanonicalIdentifier,
}

impl QueueIdentifier {
    pub fn unordered(recipient: Address) -> Self {
        Self {
            recipient,
            canonical_identifier: CanonicalIdentifier::Unordered,
        }
    }

    pub fn ordered(recipient: Address, id: u64) -> Self {
        Self {
            recipient,
            canonical_identifier: CanonicalIdentifier::Ordered(id),
        }
    }
}

impl fmt::Debug for QueueIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueIdentifier({}, {:?})", self.recipient, self.canonical_identifier)
    }
}
