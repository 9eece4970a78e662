//! Kingsmith WalkingPad wire codec.
//!
//! Frames are `0xF7 <opcode> <payload...> <checksum> 0xFD` where the
//! checksum is the modulo-256 sum of the opcode and payload bytes. The
//! codec is pure: it never allocates state, never errors, and never
//! panics; malformed input decodes to [`Frame::Unknown`].

use crate::telemetry::BeltState;

pub const FRAME_START: u8 = 0xF7;
pub const FRAME_END: u8 = 0xFD;

/// Request the current stats record.
pub const OP_ASK_STATS: u8 = 0xA2;
/// Stats record response.
pub const OP_STATS: u8 = 0xA8;
/// Set target belt speed (u16 LE, 0.01 km/h).
pub const OP_SET_SPEED: u8 = 0x02;
/// Start the belt.
pub const OP_START_BELT: u8 = 0x07;
/// Stop the belt.
pub const OP_STOP_BELT: u8 = 0x08;

/// Stats payload with a 1-byte speed field (A1) vs 2-byte little-endian
/// (R1/R2). Recorded per reply instead of guessed per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedEncoding {
    Narrow,
    Wide,
}

/// Decoded stats record.
///
/// Payload layout, little-endian:
/// `belt(1) speed(1|2) distance:u24(3) elapsed:u16(2)`, 7 or 8 bytes
/// total depending on the speed width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReply {
    pub belt_state: BeltState,
    /// Speed in 0.1 km/h units.
    pub speed_decikmh: u16,
    /// Cumulative distance in deca-meters (1 unit = 10 m).
    pub distance_dam: u32,
    pub elapsed_s: u16,
    pub speed_encoding: SpeedEncoding,
}

impl StatsReply {
    #[must_use]
    pub fn speed_kmh(&self) -> f64 {
        f64::from(self.speed_decikmh) / 10.0
    }

    #[must_use]
    pub const fn distance_m(&self) -> u32 {
        self.distance_dam * 10
    }
}

/// Any well-formed non-stats frame: command acknowledgements and echoed
/// requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stats(StatsReply),
    Control(ControlReply),
    Unknown,
}

fn checksum(opcode: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(opcode, |sum, byte| sum.wrapping_add(*byte))
}

fn encode(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(FRAME_START);
    frame.push(opcode);
    frame.extend_from_slice(payload);
    frame.push(checksum(opcode, payload));
    frame.push(FRAME_END);
    frame
}

/// Canonical "request status" frame: `F7 A2 00 00 A2 FD`.
#[must_use]
pub fn encode_ask_stats() -> Vec<u8> {
    encode(OP_ASK_STATS, &[0x00, 0x00])
}

#[must_use]
pub fn encode_start_belt() -> Vec<u8> {
    encode(OP_START_BELT, &[])
}

#[must_use]
pub fn encode_stop_belt() -> Vec<u8> {
    encode(OP_STOP_BELT, &[0x01])
}

/// Target speed command. The belt accepts 0.01 km/h units clamped to
/// [0, 600] (6 km/h, the hardware ceiling).
#[must_use]
pub fn encode_set_speed(speed_kmh: f64) -> Vec<u8> {
    let units = (speed_kmh * 100.0).round().clamp(0.0, 600.0) as u16;
    encode(OP_SET_SPEED, &units.to_le_bytes())
}

/// Validate the envelope and checksum, then decode by opcode. Violations
/// of any kind yield [`Frame::Unknown`].
#[must_use]
pub fn decode_frame(data: &[u8]) -> Frame {
    if data.len() < 4 {
        return Frame::Unknown;
    }
    if data[0] != FRAME_START || data[data.len() - 1] != FRAME_END {
        return Frame::Unknown;
    }
    let opcode = data[1];
    let payload = &data[2..data.len() - 2];
    if checksum(opcode, payload) != data[data.len() - 2] {
        return Frame::Unknown;
    }
    match opcode {
        OP_STATS => decode_stats(payload),
        _ => Frame::Control(ControlReply {
            opcode,
            payload: payload.to_vec(),
        }),
    }
}

fn decode_stats(payload: &[u8]) -> Frame {
    let (speed_decikmh, encoding, rest) = match payload.len() {
        7 => (
            u16::from(payload[1]),
            SpeedEncoding::Narrow,
            &payload[2..],
        ),
        8 => (
            u16::from_le_bytes([payload[1], payload[2]]),
            SpeedEncoding::Wide,
            &payload[3..],
        ),
        _ => return Frame::Unknown,
    };
    let distance_dam = u32::from_le_bytes([rest[0], rest[1], rest[2], 0]);
    let elapsed_s = u16::from_le_bytes([rest[3], rest[4]]);
    Frame::Stats(StatsReply {
        belt_state: BeltState::from_raw(payload[0]),
        speed_decikmh,
        distance_dam,
        elapsed_s,
        speed_encoding: encoding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_frame(payload: &[u8]) -> Vec<u8> {
        encode(OP_STATS, payload)
    }

    #[test]
    fn ask_stats_is_canonical() {
        assert_eq!(encode_ask_stats(), vec![0xF7, 0xA2, 0x00, 0x00, 0xA2, 0xFD]);
    }

    #[test]
    fn ask_stats_round_trips_with_its_opcode() {
        match decode_frame(&encode_ask_stats()) {
            Frame::Control(reply) => {
                assert_eq!(reply.opcode, OP_ASK_STATS);
                assert_eq!(reply.payload, vec![0x00, 0x00]);
            }
            other => panic!("expected control reply, got {other:?}"),
        }
    }

    #[test]
    fn known_checksum_vector_decodes() {
        // 0xA2 + 0x01 + 0x02 + 0x03 = 0xA8
        let frame = [0xF7, 0xA2, 0x01, 0x02, 0x03, 0xA8, 0xFD];
        match decode_frame(&frame) {
            Frame::Control(reply) => {
                assert_eq!(reply.opcode, 0xA2);
                assert_eq!(reply.payload, vec![0x01, 0x02, 0x03]);
            }
            other => panic!("expected control reply, got {other:?}"),
        }

        let mut corrupted = frame;
        corrupted[5] = 0xA9;
        assert_eq!(decode_frame(&corrupted), Frame::Unknown);
    }

    #[test]
    fn any_single_byte_flip_is_rejected() {
        let frame = stats_frame(&[1, 30, 0x10, 0x00, 0x00, 0x3C, 0x00]);
        assert!(matches!(decode_frame(&frame), Frame::Stats(_)));

        // Flip each non-sync byte in turn.
        for i in 1..frame.len() - 1 {
            let mut flipped = frame.clone();
            flipped[i] ^= 0x01;
            assert_eq!(
                decode_frame(&flipped),
                Frame::Unknown,
                "flip at offset {i} should invalidate the frame"
            );
        }
    }

    #[test]
    fn narrow_stats_payload() {
        // belt=1, speed=28 (2.8 km/h), distance=0x000210 dam, elapsed=0x012C s
        let frame = stats_frame(&[0x01, 28, 0x10, 0x02, 0x00, 0x2C, 0x01]);
        match decode_frame(&frame) {
            Frame::Stats(reply) => {
                assert_eq!(reply.belt_state, BeltState::Running);
                assert_eq!(reply.speed_encoding, SpeedEncoding::Narrow);
                assert!((reply.speed_kmh() - 2.8).abs() < f64::EPSILON);
                assert_eq!(reply.distance_dam, 0x210);
                assert_eq!(reply.distance_m(), 0x210 * 10);
                assert_eq!(reply.elapsed_s, 300);
            }
            other => panic!("expected stats, got {other:?}"),
        }
    }

    #[test]
    fn wide_stats_payload() {
        // belt=5, speed=0x0140 (32.0 km/h would be absurd but the codec
        // does not judge), distance=1 dam, elapsed=65535 s
        let frame = stats_frame(&[0x05, 0x40, 0x01, 0x01, 0x00, 0x00, 0xFF, 0xFF]);
        match decode_frame(&frame) {
            Frame::Stats(reply) => {
                assert_eq!(reply.belt_state, BeltState::Idle);
                assert_eq!(reply.speed_encoding, SpeedEncoding::Wide);
                assert_eq!(reply.speed_decikmh, 0x0140);
                assert_eq!(reply.distance_m(), 10);
                assert_eq!(reply.elapsed_s, 0xFFFF);
            }
            other => panic!("expected stats, got {other:?}"),
        }
    }

    #[test]
    fn stats_with_unexpected_payload_length_is_unknown() {
        assert_eq!(decode_frame(&stats_frame(&[0x01; 5])), Frame::Unknown);
        assert_eq!(decode_frame(&stats_frame(&[0x01; 9])), Frame::Unknown);
    }

    #[test]
    fn short_and_unframed_input_is_unknown() {
        assert_eq!(decode_frame(&[]), Frame::Unknown);
        assert_eq!(decode_frame(&[0xF7, 0xA2, 0xFD]), Frame::Unknown);
        assert_eq!(decode_frame(&[0x00, 0xA2, 0x00, 0x00, 0xA2, 0xFD]), Frame::Unknown);
        assert_eq!(decode_frame(&[0xF7, 0xA2, 0x00, 0x00, 0xA2, 0x00]), Frame::Unknown);
    }

    #[test]
    fn belt_commands_encode_with_valid_checksums() {
        assert_eq!(encode_start_belt(), vec![0xF7, 0x07, 0x07, 0xFD]);
        assert_eq!(encode_stop_belt(), vec![0xF7, 0x08, 0x01, 0x09, 0xFD]);

        // 3.5 km/h -> 350 units -> 0x015E LE
        let frame = encode_set_speed(3.5);
        assert_eq!(frame[1], OP_SET_SPEED);
        assert_eq!(&frame[2..4], &[0x5E, 0x01]);
        assert!(matches!(decode_frame(&frame), Frame::Control(_)));

        // Clamped at the hardware ceiling.
        let frame = encode_set_speed(25.0);
        assert_eq!(&frame[2..4], &600u16.to_le_bytes());
        let frame = encode_set_speed(-1.0);
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
    }

    #[test]
    fn malformed_frame_storm_never_panics() {
        // Deterministic pseudo-random buffers; none should decode as stats
        // by accident and none may panic.
        let mut seed: u32 = 0x2545_F491;
        for _ in 0..1000 {
            let mut buf = [0u8; 16];
            for byte in &mut buf {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                *byte = (seed >> 24) as u8;
            }
            let _ = decode_frame(&buf);
        }
    }
}
