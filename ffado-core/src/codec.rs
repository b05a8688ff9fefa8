//! AMDTP (IEC 61883-6) sample formats and the transmit packet-generation /
//! receive packet-reception policies, grounded in
//! libffado's `libstreaming/amdtp/AmdtpTransmitStreamProcessor.cpp`
//! (the late-but-presentable / early / no-data decision tree) and
//! `AmdtpReceiveStreamProcessor.cpp` (SYT reconstruction feeding the
//! buffer). Sample encode/decode dispatches on the two kinds a `Port`
//! already names (Int24 MBLA, MIDI) rather than a separate
//! format-selection enum — AMDTP doesn't negotiate a wire format per
//! stream, so there's nothing else to select on.

use ffado_proto::cip::{LABEL_MIDI, LABEL_MIDI_NO_DATA};
use ffado_proto::time::{syt_recv_to_full, CycleTimer, Tick};
use ffado_proto::TICKS_PER_CYCLE;

/// Scale applied when decoding a received Int24 MBLA sample to `f32`.
const FLOAT_RECEIVE_SCALE: f32 = 1.0 / 0x7F_FFFF as f32;

/// Scale applied when encoding an `f32` sample for transmit
///. The extra low byte of headroom
/// versus the receive scale absorbs rounding without the encoded value
/// ever reaching the sign bit.
const FLOAT_TRANSMIT_SCALE: f64 = 0x7FFF_FF00u32 as f64;

/// Build one MBLA audio quadlet from a 24-bit signed sample.
pub fn encode_mbla_sample(sample_int24: i32) -> u32 {
    (u32::from(ffado_proto::cip::LABEL_MBLA) << 24) | (sample_int24 as u32 & 0x00ff_ffff)
}

/// Recover the sign-extended 24-bit sample from an MBLA quadlet.
pub fn decode_mbla_sample(quadlet: u32) -> i32 {
    let raw = quadlet & 0x00ff_ffff;
    ((raw << 8) as i32) >> 8
}

pub fn int24_to_float(sample: i32) -> f32 {
    sample as f32 * FLOAT_RECEIVE_SCALE
}

pub fn float_to_int24(sample: f32) -> i32 {
    let clamped = sample.clamp(-1.0, 1.0) as f64;
    let scaled = (clamped * FLOAT_TRANSMIT_SCALE) as i64;
    (scaled >> 8) as i32
}

/// Build one MIDI quadlet. `byte` is `None` for a no-data slot.
pub fn encode_midi_sample(byte: Option<u8>) -> u32 {
    match byte {
        Some(b) => (u32::from(LABEL_MIDI) << 24) | (u32::from(b) << 16),
        None => u32::from(LABEL_MIDI_NO_DATA) << 24,
    }
}

pub fn decode_midi_sample(quadlet: u32) -> Option<u8> {
    let label = (quadlet >> 24) as u8;
    if label == LABEL_MIDI {
        Some(((quadlet >> 16) & 0xff) as u8)
    } else {
        None
    }
}

/// The data-block-relative slot a packet-scoped MIDI port's byte lands
/// in for a given DBC value.
pub fn midi_slot(dbc: u8, port_location: u8) -> u8 {
    (dbc.wrapping_add(port_location)) % 8
}

pub fn advance_dbc(dbc: u8, n: u8) -> u8 {
    dbc.wrapping_add(n)
}

/// Reconstruct the presentation tick for a received data packet's SYT
/// field.
pub fn reconstruct_receive_timestamp(syt: u16, cycle: u16, now: CycleTimer) -> Tick {
    syt_recv_to_full(syt, cycle, now)
}

/// Tunables for the transmit decision tree, all expressed in cycles except `transfer_delay`.
#[derive(Debug, Clone, Copy)]
pub struct TransmitParams {
    pub transfer_delay_ticks: i64,
    pub max_cycles_early: i32,
    pub min_before_pres_cycles: i32,
}

impl Default for TransmitParams {
    fn default() -> Self {
        TransmitParams {
            transfer_delay_ticks: 9 * TICKS_PER_CYCLE as i64,
            max_cycles_early: 2,
            min_before_pres_cycles: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitDecision {
    /// Not enough frames queued for a full SYT interval with presentation
    /// imminent: report as an xrun upstream.
    Underrun,
    /// Emit a data packet with payload, stamped `syt`.
    Data { syt: Tick, advance_dbc: bool },
    /// Emit a header-only no-data packet (`SYT = 0xFFFF`).
    NoData,
}

/// Packet generation policy (transmit), steps 1-3.
/// `head_ts` is the outgoing buffer's head timestamp (`T`); `fc` is
/// frames currently queued; `now` is the current CTR.
pub fn decide_transmit(
    params: &TransmitParams,
    head_ts: Tick,
    fc: u32,
    syt_interval: u16,
    now: CycleTimer,
) -> TransmitDecision {
    let now_tick = now.to_tick();
    let transmit_at = head_ts.add_ticks(-params.transfer_delay_ticks);

    let cycles_until_pres = (head_ts.diff(now_tick) / TICKS_PER_CYCLE as i64) as i32;
    let cycles_until_transmit = (transmit_at.diff(now_tick) / TICKS_PER_CYCLE as i64) as i32;

    if fc < syt_interval as u32 && cycles_until_pres <= params.min_before_pres_cycles {
        return TransmitDecision::Underrun;
    }

    if cycles_until_transmit < 0 && cycles_until_pres >= params.min_before_pres_cycles {
        return TransmitDecision::Data { syt: head_ts, advance_dbc: true };
    }

    if cycles_until_transmit >= 0 && cycles_until_transmit <= params.max_cycles_early {
        return TransmitDecision::Data { syt: head_ts, advance_dbc: true };
    }

    TransmitDecision::NoData
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbla_sample_round_trips_negative_value() {
        let encoded = encode_mbla_sample(-1000);
        assert_eq!(encoded >> 24, 0x40);
        assert_eq!(decode_mbla_sample(encoded), -1000);
    }

    #[test]
    fn mbla_sample_round_trips_positive_value() {
        let encoded = encode_mbla_sample(0x123456);
        assert_eq!(decode_mbla_sample(encoded), 0x123456);
    }

    #[test]
    fn float_round_trip_is_close_to_identity() {
        let original = 0.5f32;
        let int24 = float_to_int24(original);
        let recovered = int24_to_float(int24);
        assert!((recovered - original).abs() < 0.001, "recovered={recovered}");
    }

    #[test]
    fn midi_sample_round_trips_byte() {
        let encoded = encode_midi_sample(Some(0x90));
        assert_eq!(decode_midi_sample(encoded), Some(0x90));
    }

    #[test]
    fn midi_no_data_decodes_to_none() {
        let encoded = encode_midi_sample(None);
        assert_eq!(decode_midi_sample(encoded), None);
        assert_eq!(encoded >> 24, u32::from(LABEL_MIDI_NO_DATA));
    }

    #[test]
    fn midi_slot_wraps_at_eight() {
        assert_eq!(midi_slot(6, 3), 1);
        assert_eq!(midi_slot(255, 1), 0);
    }

    #[test]
    fn transmit_underrun_when_buffer_too_shallow_and_presentation_near() {
        let params = TransmitParams::default();
        let now = CycleTimer { seconds: 0, cycles: 100, offset: 0 };
        let head_ts = now.to_tick().add_ticks(TICKS_PER_CYCLE as i64 / 2);
        let decision = decide_transmit(&params, head_ts, 2, 8, now);
        assert_eq!(decision, TransmitDecision::Underrun);
    }

    #[test]
    fn transmit_sends_no_data_when_far_in_future() {
        let params = TransmitParams::default();
        let now = CycleTimer { seconds: 0, cycles: 100, offset: 0 };
        let head_ts = now.to_tick().add_ticks(50 * TICKS_PER_CYCLE as i64);
        let decision = decide_transmit(&params, head_ts, 64, 8, now);
        assert_eq!(decision, TransmitDecision::NoData);
    }

    #[test]
    fn transmit_sends_data_when_within_early_window() {
        let params = TransmitParams::default();
        let now = CycleTimer { seconds: 0, cycles: 100, offset: 0 };
        // transmit_at = head_ts - 9 cycles; put head_ts so transmit_at lands
        // one cycle in the future, inside max_cycles_early.
        let head_ts = now.to_tick().add_ticks(10 * TICKS_PER_CYCLE as i64);
        let decision = decide_transmit(&params, head_ts, 64, 8, now);
        match decision {
            TransmitDecision::Data { syt, advance_dbc } => {
                assert_eq!(syt, head_ts);
                assert!(advance_dbc);
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }
}
