//! Type-based packet allow-list.
//!
//! A packet passes when the allow-list is empty or when any of its `type`,
//! `subType` or `superType` is listed. Filtering happens after decoding, so
//! rejected packets are still fully decoded.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::packet::PacketEnvelope;

/// Allow-list of packet classification identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketFilter {
    allowed: HashSet<String>,
}

impl PacketFilter {
    /// Filter accepting every packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter accepting packets classified under any of `identifiers`.
    ///
    /// Empty identifiers are dropped; they would otherwise match every
    /// packet lacking a sub- or supertype.
    pub fn from_identifiers<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: identifiers
                .into_iter()
                .map(Into::into)
                .filter(|id: &String| !id.is_empty())
                .collect(),
        }
    }

    /// Whether `packet` should be dispatched.
    #[must_use]
    pub fn accepts(&self, packet: &PacketEnvelope) -> bool {
        self.allowed.is_empty()
            || self.allowed.contains(&packet.packet_type)
            || self.allowed.contains(&packet.sub_type)
            || self.allowed.contains(&packet.super_type)
    }

    /// Whether the filter accepts everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Listed identifiers, sorted.
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.allowed.iter().cloned().collect();
        ids.sort();
        ids
    }
}

/// Filter shared between the session (writer) and the pipeline (reader).
///
/// Replacement swaps the whole list under the lock; the pipeline takes the
/// lock once per packet at filter time.
#[derive(Debug, Clone, Default)]
pub struct SharedFilter {
    inner: Arc<RwLock<PacketFilter>>,
}

impl SharedFilter {
    /// Shared filter accepting every packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current allow-list.
    pub fn replace(&self, filter: PacketFilter) {
        *self.inner.write().expect("filter lock poisoned") = filter;
    }

    /// Copy of the current allow-list.
    #[must_use]
    pub fn snapshot(&self) -> PacketFilter {
        self.inner.read().expect("filter lock poisoned").clone()
    }

    /// Evaluate the current allow-list against `packet`.
    #[must_use]
    pub fn accepts(&self, packet: &PacketEnvelope) -> bool {
        self.inner.read().expect("filter lock poisoned").accepts(packet)
    }
}
