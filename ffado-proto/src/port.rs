//! Port descriptors: the data model for endpoints a `StreamProcessor`
//! exposes to its client.

use crate::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Audio,
    Midi,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int24,
    Float,
    MidiEvent,
    ControlEvent,
}

/// Where a port's events land within one data block of the AMDTP wire
/// format: `quadlet` is the quadlet offset within the block, `slot` the
/// MIDI sub-slot for `PortKind::Midi` ports (IEC 61883-6 interleaves up to
/// 8 MIDI streams into one quadlet, one byte advancing per data block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPosition {
    pub quadlet: u16,
    pub slot: Option<u8>,
}

/// An endpoint exposed to the client: one channel of one stream. Created
/// in `Created`, becomes transfer-ready through `Initialized` ->
/// `Prepared`, destroyed with its owning `StreamProcessor`.
/// Port names are short and known at construction time; `ffado-proto` is `no_std` with no
/// allocator, so this is a `heapless::String` rather than `alloc::String`,
/// the fixed-capacity-buffer idiom any `no_std` protocol crate reaches
/// for whenever it needs owned, bounded text.
const NAME_CAP: usize = 32;
pub type PortName = heapless::String<NAME_CAP>;

#[derive(Debug, Clone)]
pub struct Port {
    name: PortName,
    direction: Direction,
    kind: PortKind,
    data_type: DataType,
    event_size_bytes: u16,
    buffer_size_events: u32,
    position: PortPosition,
    enabled: bool,
}

impl Port {
    pub fn new(
        name: &str,
        direction: Direction,
        kind: PortKind,
        data_type: DataType,
        event_size_bytes: u16,
        buffer_size_events: u32,
        position: PortPosition,
    ) -> Self {
        Port {
            name: truncated_name(name),
            direction,
            kind,
            data_type,
            event_size_bytes,
            buffer_size_events,
            position,
            enabled: false,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn event_size_bytes(&self) -> u16 {
        self.event_size_bytes
    }

    pub fn buffer_size_events(&self) -> u32 {
        self.buffer_size_events
    }

    pub fn position(&self) -> PortPosition {
        self.position
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Truncate `s` to fit `PortName`'s capacity at a `char` boundary. Longer
/// than `NAME_CAP` bytes only happens for a misbehaving caller, not in
/// normal device-descriptor-driven construction, so silent truncation
/// (rather than a fallible constructor) matches how little this should
/// ever matter in practice.
fn truncated_name(s: &str) -> PortName {
    let mut end = s.len().min(NAME_CAP);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut name = PortName::new();
    let _ = name.push_str(&s[..end]);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_name_truncates_within_fixed_capacity() {
        let long_name = "a".repeat(64);
        let port = Port::new(
            &long_name,
            Direction::Transmit,
            PortKind::Audio,
            DataType::Int24,
            4,
            1024,
            PortPosition { quadlet: 0, slot: None },
        );
        assert_eq!(port.name().len(), 32);
    }

    #[test]
    fn port_starts_disabled() {
        let port = Port::new(
            "analog-1",
            Direction::Receive,
            PortKind::Audio,
            DataType::Float,
            4,
            1024,
            PortPosition { quadlet: 1, slot: None },
        );
        assert!(!port.enabled());
    }
}
