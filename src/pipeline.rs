//! Inbound message pipeline: decode, filter, enrich, publish.
//!
//! Runs synchronously for one message at a time on the transport task, so no
//! two messages are ever processed concurrently. Malformed messages are
//! logged with their raw content and dropped; nothing here returns an error.

use std::sync::Arc;

use crate::config::Logger;
use crate::filter::SharedFilter;
use crate::packet::{DecodeError, PacketEnvelope};
use crate::postprocess::PostprocessorRegistry;
use crate::router::SharedRouter;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Published to subscribers.
    Dispatched(Arc<PacketEnvelope>),
    /// Decoded, but rejected by the allow-list.
    Filtered,
    /// Not a packet; logged and dropped.
    Malformed,
}

/// Decode → filter → postprocess → publish.
#[derive(Debug, Clone)]
pub struct Pipeline {
    filter: SharedFilter,
    postprocessors: Arc<PostprocessorRegistry>,
    router: SharedRouter,
    logger: Logger,
}

impl Pipeline {
    /// Assemble a pipeline from its stages.
    #[must_use]
    pub fn new(
        filter: SharedFilter,
        postprocessors: Arc<PostprocessorRegistry>,
        router: SharedRouter,
        logger: Logger,
    ) -> Self {
        Self {
            filter,
            postprocessors,
            router,
            logger,
        }
    }

    /// Handle a text frame.
    pub fn handle_text(&self, text: &str) -> Outcome {
        match PacketEnvelope::decode(text) {
            Ok(packet) => self.dispatch(packet),
            Err(e) => self.reject(&e, text),
        }
    }

    /// Handle a binary frame, which must hold UTF-8 JSON.
    pub fn handle_binary(&self, raw: &[u8]) -> Outcome {
        match PacketEnvelope::decode_bytes(raw) {
            Ok(packet) => self.dispatch(packet),
            Err(e) => self.reject(&e, &String::from_utf8_lossy(raw)),
        }
    }

    fn reject(&self, error: &DecodeError, content: &str) -> Outcome {
        log::debug!("[Pipeline] Dropping malformed message: {}", error);
        self.logger.log(format!(
            "Message parsing threw an error: {error}\nMessage content:\n{content}"
        ));
        Outcome::Malformed
    }

    fn dispatch(&self, mut packet: PacketEnvelope) -> Outcome {
        if !self.filter.accepts(&packet) {
            log::trace!("[Pipeline] Filtered out '{}'", packet.packet_type);
            return Outcome::Filtered;
        }

        self.postprocessors.apply(&mut packet);

        let packet = Arc::new(packet);
        let invoked = self.router.publish(&packet);
        log::trace!(
            "[Pipeline] Dispatched '{}' to {} subscriber(s)",
            packet.packet_type,
            invoked
        );
        Outcome::Dispatched(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PacketFilter;
    use crate::postprocess::{event_play8, DerivedFields};
    use std::sync::Mutex;

    struct Harness {
        pipeline: Pipeline,
        filter: SharedFilter,
        router: SharedRouter,
        lines: Arc<Mutex<Vec<String>>>,
    }

    fn harness(registry: PostprocessorRegistry) -> Harness {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let filter = SharedFilter::new();
        let router = SharedRouter::new();
        let pipeline = Pipeline::new(
            filter.clone(),
            Arc::new(registry),
            router.clone(),
            Logger::new(move |line| sink.lock().unwrap().push(line.to_string())),
        );
        Harness {
            pipeline,
            filter,
            router,
            lines,
        }
    }

    fn collect(router: &SharedRouter, topic: &str) -> Arc<Mutex<Vec<Arc<PacketEnvelope>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        router.subscribe(topic, move |p| sink.lock().unwrap().push(Arc::clone(p)));
        seen
    }

    #[test]
    fn test_malformed_message_is_logged_and_dropped() {
        let h = harness(PostprocessorRegistry::new());
        let any = collect(&h.router, "any");

        let outcome = h.pipeline.handle_text("{\"opcode\": ");

        assert_eq!(outcome, Outcome::Malformed);
        assert!(any.lock().unwrap().is_empty());
        let lines = h.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Message parsing threw an error"));
        assert!(lines[0].ends_with("{\"opcode\": "));
    }

    #[test]
    fn test_non_utf8_binary_is_dropped() {
        let h = harness(PostprocessorRegistry::new());
        let any = collect(&h.router, "any");
        assert_eq!(h.pipeline.handle_binary(&[0xc3, 0x28]), Outcome::Malformed);
        assert!(any.lock().unwrap().is_empty());
    }

    #[test]
    fn test_binary_json_is_dispatched() {
        let h = harness(PostprocessorRegistry::new());
        let outcome = h.pipeline.handle_binary(br#"{"opcode": 2, "type": "t"}"#);
        assert!(matches!(outcome, Outcome::Dispatched(p) if p.opcode == 2));
    }

    #[test]
    fn test_filtered_packet_is_not_published() {
        let h = harness(PostprocessorRegistry::new());
        let any = collect(&h.router, "any");
        h.filter.replace(PacketFilter::from_identifiers(["EventPlay8"]));

        let outcome = h.pipeline.handle_text(r#"{"opcode": 1, "type": "Other"}"#);

        assert_eq!(outcome, Outcome::Filtered);
        assert!(any.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unregistered_type_is_published_unchanged() {
        let h = harness(PostprocessorRegistry::with_defaults());
        let text = r#"{"opcode": 5, "type": "plain", "data": [1, 2], "extra": true}"#;
        let expected = PacketEnvelope::decode(text).unwrap();

        let Outcome::Dispatched(packet) = h.pipeline.handle_text(text) else {
            panic!("expected dispatch");
        };
        assert_eq!(*packet, expected);
        assert_eq!(packet.packet_size, Some(34));
    }

    #[test]
    fn test_event_play8_scenario() {
        let mut registry = PostprocessorRegistry::new();
        registry.register("EventPlay8", event_play8);
        let h = harness(registry);
        let typed = collect(&h.router, "EventPlay8");

        let mut data = vec![0u8; 36];
        data[4] = 5;
        data[8] = 7;
        data[28..32].copy_from_slice(&123_456u32.to_le_bytes());
        let text = serde_json::json!({ "opcode": 1, "type": "EventPlay8", "data": data }).to_string();

        h.pipeline.handle_text(&text);

        let seen = typed.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].field_u64("param1"), Some(5));
        assert_eq!(seen[0].field_u64("eventId"), Some(7));
        assert_eq!(seen[0].field_u64("actionTimeline"), Some(123_456));
    }

    #[test]
    fn test_postprocessor_runs_only_for_passing_packets() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = PostprocessorRegistry::new();
        registry.register("t", move |_| {
            *counter.lock().unwrap() += 1;
            DerivedFields::new()
        });
        let h = harness(registry);
        h.filter.replace(PacketFilter::from_identifiers(["other"]));

        h.pipeline.handle_text(r#"{"opcode": 1, "type": "t"}"#);
        assert_eq!(*calls.lock().unwrap(), 0);

        h.filter.replace(PacketFilter::new());
        h.pipeline.handle_text(r#"{"opcode": 1, "type": "t"}"#);
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
