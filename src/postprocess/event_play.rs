//! `EventPlay8` field layout.

use super::DerivedFields;
use crate::packet::PacketEnvelope;

/// Packet type handled by [`event_play8`].
pub const EVENT_PLAY8: &str = "EventPlay8";

const PARAM1_OFFSET: usize = 0x04;
const EVENT_ID_OFFSET: usize = 0x08;
// Links to an ActionTimeline sheet row.
const ACTION_TIMELINE_OFFSET: usize = 0x1C;

/// Derive `param1`, `eventId` and `actionTimeline` from an event play packet.
///
/// Offsets past the end of the payload are skipped.
pub fn event_play8(packet: &PacketEnvelope) -> DerivedFields {
    let mut fields = DerivedFields::new();
    let layout = [
        ("eventId", EVENT_ID_OFFSET),
        ("param1", PARAM1_OFFSET),
        ("actionTimeline", ACTION_TIMELINE_OFFSET),
    ];
    for (name, offset) in layout {
        if let Some(value) = packet.read_u32(offset) {
            fields.insert(name.to_string(), value.into());
        }
    }
    fields
}
