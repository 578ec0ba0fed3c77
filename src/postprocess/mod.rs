//! Per-type packet enrichment.
//!
//! A postprocessor reads fixed-offset values out of a packet's payload and
//! returns them as named fields. The registry maps a packet `type` to its
//! postprocessor with a hash lookup, so dispatch cost does not depend on how
//! many types are registered.
//!
//! Postprocessors only see an immutable envelope and return the fields to
//! merge; the registry does the merge. They cannot touch the opcode or the
//! classification, and running one twice yields the same fields.
//!
//! # Usage
//!
//! ```
//! use zanarkand::postprocess::{DerivedFields, PostprocessorRegistry};
//!
//! let mut registry = PostprocessorRegistry::new();
//! registry.register("actorMove", |packet| {
//!     let mut fields = DerivedFields::new();
//!     if let Some(rotation) = packet.read_u8(0) {
//!         fields.insert("rotation".into(), rotation.into());
//!     }
//!     fields
//! });
//! assert!(registry.contains("actorMove"));
//! ```

mod event_play;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::packet::PacketEnvelope;

pub use event_play::{event_play8, EVENT_PLAY8};

/// Fields a postprocessor derives from one packet.
pub type DerivedFields = Map<String, Value>;

/// Enrichment function for one packet type.
pub type Postprocessor = Arc<dyn Fn(&PacketEnvelope) -> DerivedFields + Send + Sync>;

/// Lookup from packet `type` to its postprocessor.
///
/// Populated before the session starts and read-only afterwards.
#[derive(Default, Clone)]
pub struct PostprocessorRegistry {
    processors: HashMap<String, Postprocessor>,
}

impl std::fmt::Debug for PostprocessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostprocessorRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl PostprocessorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in postprocessors.
    ///
    /// Keys match the wire `type` exactly, so the event play processor is
    /// registered as `EventPlay8`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EVENT_PLAY8, event_play8);
        registry
    }

    /// Register `processor` for `packet_type`, replacing any previous entry.
    pub fn register<F>(&mut self, packet_type: impl Into<String>, processor: F) -> &mut Self
    where
        F: Fn(&PacketEnvelope) -> DerivedFields + Send + Sync + 'static,
    {
        let packet_type = packet_type.into();
        log::debug!("[Postprocess] Registered postprocessor for '{}'", packet_type);
        self.processors.insert(packet_type, Arc::new(processor));
        self
    }

    /// Whether `packet_type` has a postprocessor.
    #[must_use]
    pub fn contains(&self, packet_type: &str) -> bool {
        self.processors.contains_key(packet_type)
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Fields the postprocessor for `packet`'s type derives, if one exists.
    #[must_use]
    pub fn derive(&self, packet: &PacketEnvelope) -> Option<DerivedFields> {
        self.processors
            .get(&packet.packet_type)
            .map(|processor| processor(packet))
    }

    /// Merge derived fields into `packet`. Returns whether a postprocessor ran.
    ///
    /// Derived fields overwrite same-named fields already on the envelope.
    pub fn apply(&self, packet: &mut PacketEnvelope) -> bool {
        match self.derive(packet) {
            Some(fields) => {
                packet.fields.extend(fields);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(json: &str) -> PacketEnvelope {
        PacketEnvelope::decode(json).unwrap()
    }

    #[test]
    fn test_defaults_include_event_play8() {
        let registry = PostprocessorRegistry::with_defaults();
        assert!(registry.contains(EVENT_PLAY8));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_defaults_enrich_event_play8_type() {
        let registry = PostprocessorRegistry::with_defaults();
        let mut p = packet(r#"{"opcode": 1, "type": "EventPlay8", "data": [0, 0, 0, 0, 5, 0, 0, 0, 7, 0, 0, 0]}"#);

        assert!(registry.apply(&mut p));
        assert_eq!(p.field_u64("param1"), Some(5));
        assert_eq!(p.field_u64("eventId"), Some(7));
    }

    #[test]
    fn test_apply_without_entry_leaves_packet_unchanged() {
        let registry = PostprocessorRegistry::with_defaults();
        let mut p = packet(r#"{"opcode": 1, "type": "unknown", "data": [1, 2, 3, 4]}"#);
        let before = p.clone();

        assert!(!registry.apply(&mut p));
        assert_eq!(p, before);
    }

    #[test]
    fn test_apply_merges_fields() {
        let mut registry = PostprocessorRegistry::new();
        registry.register("chat", |p| {
            let mut fields = DerivedFields::new();
            fields.insert("first".into(), p.read_u8(0).into());
            fields.insert("note".into(), "derived".into());
            fields
        });

        let mut p = packet(r#"{"opcode": 1, "type": "chat", "data": [9], "note": "wire"}"#);
        assert!(registry.apply(&mut p));
        assert_eq!(p.field_u64("first"), Some(9));
        assert_eq!(p.field("note"), Some(&Value::from("derived")));
        assert_eq!(p.packet_type, "chat");
        assert_eq!(p.opcode, 1);
    }

    #[test]
    fn test_register_replaces_existing_entry() {
        let mut registry = PostprocessorRegistry::new();
        registry
            .register("t", |_| DerivedFields::new())
            .register("t", |_| {
                let mut fields = DerivedFields::new();
                fields.insert("v".into(), 2.into());
                fields
            });

        assert_eq!(registry.len(), 1);
        let derived = registry
            .derive(&packet(r#"{"opcode": 1, "type": "t"}"#))
            .unwrap();
        assert_eq!(derived.get("v"), Some(&Value::from(2)));
    }

    #[test]
    fn test_many_types_dispatch_by_key() {
        let mut registry = PostprocessorRegistry::new();
        for i in 0..500 {
            registry.register(format!("type{i}"), move |_| {
                let mut fields = DerivedFields::new();
                fields.insert("index".into(), i.into());
                fields
            });
        }

        let mut p = packet(r#"{"opcode": 1, "type": "type321"}"#);
        registry.apply(&mut p);
        assert_eq!(p.field_u64("index"), Some(321));
    }

    #[test]
    fn test_types_sorted() {
        let mut registry = PostprocessorRegistry::new();
        registry
            .register("b", |_| DerivedFields::new())
            .register("a", |_| DerivedFields::new());
        assert_eq!(registry.types(), vec!["a", "b"]);
    }
}
