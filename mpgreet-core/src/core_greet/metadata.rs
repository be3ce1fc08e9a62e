//! Causal metadata carried by greeting packets

use super::greet_type::GreetType;
use crate::core_crypto::{sha256_parts, Digest};
use std::collections::BTreeSet;

/// Causal metadata attached to every packet of an operation
///
/// `prev_pf` is the same for all packets of one operation; it is the id of
/// the final packet of the previous operation. `prev_ch` chains over every
/// packet seen so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingMetadata {
    pub prev_pf: Digest,
    pub prev_ch: Digest,
    pub author: String,
    pub parents: BTreeSet<Digest>,
}

impl GreetingMetadata {
    pub fn create(
        prev_pf: Digest,
        prev_ch: Digest,
        author: impl Into<String>,
        parents: impl IntoIterator<Item = Digest>,
    ) -> Self {
        Self {
            prev_pf,
            prev_ch,
            author: author.into(),
            parents: parents.into_iter().collect(),
        }
    }

    /// Metadata for a packet `author` sends in reply to the packet `received`
    pub fn advance(&self, author: impl Into<String>, received: Digest) -> Self {
        Self {
            prev_pf: self.prev_pf,
            prev_ch: chain_hash(&self.prev_ch, &received),
            author: author.into(),
            parents: BTreeSet::from([received]),
        }
    }
}

/// Extend a chain hash with one more packet id
pub fn chain_hash(prev_ch: &Digest, packet_id: &Digest) -> Digest {
    sha256_parts([prev_ch.as_slice(), packet_id.as_slice()])
}

/// Result of partially decoding a packet
///
/// Initial packets carry `metadata`. The packet that completes an operation
/// carries `prev_pi`, the id of that operation's initial packet (which is
/// its own id when the initial packet is already final).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingSummary {
    pub metadata: Option<GreetingMetadata>,
    pub prev_members: BTreeSet<String>,
    pub members: BTreeSet<String>,
    pub flow: GreetType,
    pub prev_pi: Option<Digest>,
}

impl GreetingSummary {
    pub fn is_initial(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn is_final(&self) -> bool {
        self.prev_pi.is_some()
    }
}
