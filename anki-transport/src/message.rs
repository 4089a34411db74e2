//! Frame codec for the vehicle wire protocol
//!
//! Every message is length-prefixed: `[size | msg_id | payload]` where
//! `size` counts the id byte plus the payload, so the on-wire length is
//! `size + 1`. Multi-byte fields are little-endian, lateral offsets are
//! IEEE-754 single floats in millimetres.
//!
//! The packed layouts are expressed as zerocopy structs so encode and
//! decode share one definition and stay bit-exact.

use zerocopy::byteorder::little_endian::{F32, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::protocol::{self, driving_direction, msg, parseflags, MAX_FRAME_SIZE};
use crate::types::{Firmware, LightChannel, LightEffect, TrackMaterial};

/// An owned outbound frame, at most 20 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleMsg {
    buf: [u8; MAX_FRAME_SIZE],
    len: usize,
}

impl VehicleMsg {
    fn from_struct<T: IntoBytes + Immutable>(value: &T) -> Self {
        let bytes = value.as_bytes();
        debug_assert!(bytes.len() <= MAX_FRAME_SIZE);
        let mut buf = [0u8; MAX_FRAME_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            buf,
            len: bytes.len(),
        }
    }

    /// A message consisting of the size and id bytes only.
    fn bare(msg_id: u8) -> Self {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        buf[0] = protocol::BASE_MSG_SIZE;
        buf[1] = msg_id;
        Self { buf, len: 2 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn msg_id(&self) -> u8 {
        self.buf[1]
    }

    pub fn size(&self) -> u8 {
        self.buf[0]
    }
}

// ============================================================================
// Outbound layouts
// ============================================================================

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SetSpeedMsg {
    size: u8,
    msg_id: u8,
    speed_mm_per_sec: U16,
    accel_mm_per_sec2: U16,
    respect_road_piece_speed_limit: u8,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct ChangeLaneMsg {
    size: u8,
    msg_id: u8,
    horizontal_speed_mm_per_sec: U16,
    horizontal_accel_mm_per_sec2: U16,
    offset_from_road_center_mm: F32,
    hop_intent: u8,
    tag: u8,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SetOffsetMsg {
    size: u8,
    msg_id: u8,
    offset_from_road_center_mm: F32,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct TurnMsg {
    size: u8,
    msg_id: u8,
    turn_type: u8,
    trigger: u8,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SetLightsMsg {
    size: u8,
    msg_id: u8,
    light_mask: u8,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct LightsPatternMsg {
    size: u8,
    msg_id: u8,
    channel: u8,
    effect: u8,
    start: u8,
    end: u8,
    cycles_per_10_sec: U16,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SetConfigParamsMsg {
    size: u8,
    msg_id: u8,
    super_code_parse_mask: u8,
    track_material: u8,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct SdkModeMsg {
    size: u8,
    msg_id: u8,
    on: u8,
    flags: u8,
}

/// 180-degree turn, Overdrive firmware.
const TURN_TYPE_UTURN: u8 = 3;
const TURN_TRIGGER_IMMEDIATE: u8 = 0;

fn size_field<T>() -> u8 {
    (std::mem::size_of::<T>() - 1) as u8
}

pub fn ping() -> VehicleMsg {
    VehicleMsg::bare(msg::C2V_PING_REQUEST)
}

pub fn version_request() -> VehicleMsg {
    VehicleMsg::bare(msg::C2V_VERSION_REQUEST)
}

pub fn battery_request() -> VehicleMsg {
    VehicleMsg::bare(msg::C2V_BATTERY_LEVEL_REQUEST)
}

/// Polite disconnect request; the vehicle drops the link itself.
pub fn disconnect() -> VehicleMsg {
    VehicleMsg::bare(msg::C2V_DISCONNECT)
}

pub fn hello() -> VehicleMsg {
    VehicleMsg::bare(msg::C2V_HELLO)
}

pub fn cancel_lane_change() -> VehicleMsg {
    VehicleMsg::bare(msg::C2V_CANCEL_LANE_CHANGE)
}

pub fn set_sdk_mode(on: u8, flags: u8) -> VehicleMsg {
    VehicleMsg::from_struct(&SdkModeMsg {
        size: size_field::<SdkModeMsg>(),
        msg_id: msg::C2V_SDK_MODE,
        on,
        flags,
    })
}

pub fn set_speed(speed_mm_per_sec: u16, accel_mm_per_sec2: u16) -> VehicleMsg {
    VehicleMsg::from_struct(&SetSpeedMsg {
        size: size_field::<SetSpeedMsg>(),
        msg_id: msg::C2V_SET_SPEED,
        speed_mm_per_sec: U16::new(speed_mm_per_sec),
        accel_mm_per_sec2: U16::new(accel_mm_per_sec2),
        respect_road_piece_speed_limit: 0,
    })
}

pub fn change_lane(
    horizontal_speed_mm_per_sec: u16,
    horizontal_accel_mm_per_sec2: u16,
    offset_from_road_center_mm: f32,
    tag: u8,
) -> VehicleMsg {
    VehicleMsg::from_struct(&ChangeLaneMsg {
        size: size_field::<ChangeLaneMsg>(),
        msg_id: msg::C2V_CHANGE_LANE,
        horizontal_speed_mm_per_sec: U16::new(horizontal_speed_mm_per_sec),
        horizontal_accel_mm_per_sec2: U16::new(horizontal_accel_mm_per_sec2),
        offset_from_road_center_mm: F32::new(offset_from_road_center_mm),
        hop_intent: 0,
        tag,
    })
}

pub fn set_offset_from_road_center(offset_mm: f32) -> VehicleMsg {
    VehicleMsg::from_struct(&SetOffsetMsg {
        size: size_field::<SetOffsetMsg>(),
        msg_id: msg::C2V_SET_OFFSET_FROM_ROAD_CENTER,
        offset_from_road_center_mm: F32::new(offset_mm),
    })
}

/// Correction added to the lateral anchor, message id 0x34.
pub fn correct_offset(delta_mm: f32) -> VehicleMsg {
    VehicleMsg::from_struct(&SetOffsetMsg {
        size: size_field::<SetOffsetMsg>(),
        msg_id: msg::C2V_CORRECT_OFFSET,
        offset_from_road_center_mm: F32::new(delta_mm),
    })
}

/// 180-degree turn for Overdrive firmware.
pub fn turn_180() -> VehicleMsg {
    VehicleMsg::from_struct(&TurnMsg {
        size: size_field::<TurnMsg>(),
        msg_id: msg::C2V_TURN,
        turn_type: TURN_TYPE_UTURN,
        trigger: TURN_TRIGGER_IMMEDIATE,
    })
}

/// 180-degree turn for Drive firmware, which only understands the bare id.
pub fn turn_180_drive() -> VehicleMsg {
    VehicleMsg::bare(msg::C2V_TURN)
}

pub fn set_lights(mask: u8) -> VehicleMsg {
    VehicleMsg::from_struct(&SetLightsMsg {
        size: size_field::<SetLightsMsg>(),
        msg_id: msg::C2V_SET_LIGHTS,
        light_mask: mask,
    })
}

pub fn lights_pattern(
    channel: LightChannel,
    effect: LightEffect,
    start: u8,
    end: u8,
    cycles_per_min: u16,
) -> VehicleMsg {
    VehicleMsg::from_struct(&LightsPatternMsg {
        size: size_field::<LightsPatternMsg>(),
        msg_id: msg::C2V_LIGHTS_PATTERN,
        channel: channel as u8,
        effect: effect as u8,
        start,
        end,
        cycles_per_10_sec: U16::new(cycles_per_min / 6),
    })
}

pub fn set_config_params(super_code_parse_mask: u8, track_material: TrackMaterial) -> VehicleMsg {
    VehicleMsg::from_struct(&SetConfigParamsMsg {
        size: size_field::<SetConfigParamsMsg>(),
        msg_id: msg::C2V_SET_CONFIG_PARAMS,
        super_code_parse_mask,
        track_material: track_material as u8,
    })
}

/// Track configuration, message id 0x49.
///
/// The payload was observed in a communication dump between the vendor
/// app and a vehicle; only the lane count at offset 1 is understood.
pub fn configure_track(number_of_lanes: u8) -> VehicleMsg {
    let mut buf = [0u8; MAX_FRAME_SIZE];
    buf[0] = 8;
    buf[1] = msg::C2V_CONFIGURE_TRACK;
    buf[2] = 0x00;
    buf[3] = number_of_lanes;
    buf[4] = 0x00;
    buf[5] = 0x01;
    buf[6] = 0x02;
    buf[7] = 0x00;
    buf[8] = 0x0d;
    VehicleMsg { buf, len: 9 }
}

// ============================================================================
// Inbound layouts
// ============================================================================

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct VersionResponseMsg {
    size: u8,
    msg_id: u8,
    version: U16,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct BatteryLevelResponseMsg {
    size: u8,
    msg_id: u8,
    battery_level: U16,
}

/// Position update, Drive firmware layout.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DrivePositionUpdateMsg {
    size: u8,
    msg_id: u8,
    location_id: u8,
    road_piece_id: u8,
    offset_from_road_center_mm: F32,
    speed_mm_per_sec: U16,
    is_clockwise: u8,
}

/// Position update, Overdrive firmware layout.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PositionUpdateMsg {
    size: u8,
    msg_id: u8,
    location_id: u8,
    road_piece_id: u8,
    offset_from_road_center_mm: F32,
    speed_mm_per_sec: U16,
    parsing_flags: u8,
    last_recv_lane_change_cmd_id: u8,
    last_exec_lane_change_cmd_id: u8,
    last_desired_horizontal_speed_mm_per_sec: U16,
    last_desired_speed_mm_per_sec: U16,
}

/// Transition update, Drive firmware layout.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DriveTransitionUpdateMsg {
    size: u8,
    msg_id: u8,
    _reserved: u8,
    offset_from_road_center_mm: F32,
    is_clockwise: u8,
}

/// Transition update, Overdrive firmware layout.
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct TransitionUpdateMsg {
    size: u8,
    msg_id: u8,
    road_piece_idx: u8,
    road_piece_idx_prev: u8,
    offset_from_road_center_mm: F32,
    driving_direction: u8,
    last_recv_lane_change_id: u8,
    last_exec_lane_change_id: u8,
    last_desired_horizontal_speed_mm_per_sec: U16,
    last_desired_speed_mm_per_sec: U16,
    uphill_counter: u8,
    downhill_counter: u8,
    left_wheel_dist_cm: u8,
    right_wheel_dist_cm: u8,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct OffsetUpdateMsg {
    size: u8,
    msg_id: u8,
    offset_from_road_center_mm: F32,
    lane_change_id: u8,
}

/// A decoded inbound notification.
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleEvent {
    PingResponse,
    VersionResponse {
        version: u16,
    },
    BatteryResponse {
        millivolts: u16,
    },
    /// Localization marker. `offset_mm` carries the sign convention
    /// already applied; `raw_offset_mm` is the unconverted wire value
    /// used for diagnostics.
    Position {
        block: u8,
        segment: u8,
        offset_mm: f32,
        raw_offset_mm: f32,
        speed_mm_per_sec: u16,
        clockwise: bool,
        reading_len: u8,
        raw_flags: u8,
    },
    Transition {
        road_piece_idx: u8,
        road_piece_idx_prev: u8,
        offset_mm: f32,
        raw_offset_mm: f32,
        forward: bool,
    },
    OffsetUpdate {
        offset_mm: f32,
        lane_change_id: u8,
    },
    Delocalized,
    WheelMovement {
        flag1: bool,
        flag2: bool,
    },
    StateChange {
        flags: [bool; 4],
    },
    HelloResponse {
        payload: [u8; 5],
    },
    Unknown {
        msg_id: u8,
        payload: Vec<u8>,
    },
}

/// Frame-level decode failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the 20-byte maximum")]
    Oversized(usize),
    #[error("frame too short for message 0x{msg_id:02x}: {len} bytes")]
    Truncated { msg_id: u8, len: usize },
}

fn read<T: FromBytes + KnownLayout + Immutable>(data: &[u8]) -> Result<T, FrameError> {
    T::read_from_prefix(data)
        .map(|(value, _)| value)
        .map_err(|_| FrameError::Truncated {
            msg_id: data.get(1).copied().unwrap_or(0),
            len: data.len(),
        })
}

/// Decode an inbound frame.
///
/// `firmware` selects the Drive or Overdrive layout for the messages
/// whose shape differs; `last_clockwise` supplies the sign for the
/// Overdrive transition update, which does not carry its own direction
/// (the driving-direction byte reads FORWARD in both loop directions).
pub fn decode(
    data: &[u8],
    firmware: Firmware,
    last_clockwise: bool,
) -> Result<VehicleEvent, FrameError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(data.len()));
    }
    if data.len() < 2 {
        return Err(FrameError::Truncated {
            msg_id: data.first().copied().unwrap_or(0),
            len: data.len(),
        });
    }

    let msg_id = data[1];
    let event = match msg_id {
        msg::V2C_PING_RESPONSE => VehicleEvent::PingResponse,
        msg::V2C_VERSION_RESPONSE => {
            let m: VersionResponseMsg = read(data)?;
            VehicleEvent::VersionResponse {
                version: m.version.get(),
            }
        }
        msg::V2C_BATTERY_LEVEL_RESPONSE => {
            let m: BatteryLevelResponseMsg = read(data)?;
            VehicleEvent::BatteryResponse {
                millivolts: m.battery_level.get(),
            }
        }
        msg::V2C_LOCALIZATION_POSITION_UPDATE => match firmware {
            Firmware::Drive => {
                let m: DrivePositionUpdateMsg = read(data)?;
                let offset = m.offset_from_road_center_mm.get();
                VehicleEvent::Position {
                    block: m.location_id,
                    segment: m.road_piece_id,
                    offset_mm: offset,
                    raw_offset_mm: offset,
                    speed_mm_per_sec: m.speed_mm_per_sec.get(),
                    clockwise: m.is_clockwise == 0x01,
                    reading_len: 8,
                    raw_flags: m.is_clockwise,
                }
            }
            Firmware::Overdrive => {
                let m: PositionUpdateMsg = read(data)?;
                let clockwise = m.parsing_flags & parseflags::MASK_REVERSE_PARSING != 0;
                let raw = m.offset_from_road_center_mm.get();
                VehicleEvent::Position {
                    block: m.location_id,
                    segment: m.road_piece_id,
                    offset_mm: if clockwise { -raw } else { raw },
                    raw_offset_mm: raw,
                    speed_mm_per_sec: m.speed_mm_per_sec.get(),
                    clockwise,
                    reading_len: m.parsing_flags & parseflags::MASK_NUM_BITS,
                    raw_flags: m.parsing_flags,
                }
            }
        },
        msg::V2C_LOCALIZATION_TRANSITION_UPDATE => match firmware {
            Firmware::Drive => {
                let m: DriveTransitionUpdateMsg = read(data)?;
                let offset = m.offset_from_road_center_mm.get();
                VehicleEvent::Transition {
                    road_piece_idx: 0,
                    road_piece_idx_prev: 0,
                    offset_mm: offset,
                    raw_offset_mm: offset,
                    forward: m.is_clockwise != 0x00,
                }
            }
            Firmware::Overdrive => {
                let m: TransitionUpdateMsg = read(data)?;
                let raw = m.offset_from_road_center_mm.get();
                VehicleEvent::Transition {
                    road_piece_idx: m.road_piece_idx,
                    road_piece_idx_prev: m.road_piece_idx_prev,
                    offset_mm: if last_clockwise { -raw } else { raw },
                    raw_offset_mm: raw,
                    forward: m.driving_direction == driving_direction::FORWARD,
                }
            }
        },
        msg::V2C_OFFSET_FROM_ROAD_CENTER_UPDATE => {
            let m: OffsetUpdateMsg = read(data)?;
            VehicleEvent::OffsetUpdate {
                offset_mm: m.offset_from_road_center_mm.get(),
                lane_change_id: m.lane_change_id,
            }
        }
        msg::V2C_VEHICLE_DELOCALIZED => VehicleEvent::Delocalized,
        msg::V2C_WHEEL_MOVEMENT => {
            let p = payload(data);
            VehicleEvent::WheelMovement {
                flag1: p.first().copied().unwrap_or(0) != 0,
                flag2: p.get(1).copied().unwrap_or(0) != 0,
            }
        }
        msg::V2C_STATE_CHANGE => {
            let p = payload(data);
            let mut flags = [false; 4];
            for (i, flag) in flags.iter_mut().enumerate() {
                *flag = p.get(i).copied().unwrap_or(0) != 0;
            }
            VehicleEvent::StateChange { flags }
        }
        msg::V2C_HELLO_RESPONSE => {
            let p = payload(data);
            let mut bytes = [0u8; 5];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = p.get(i).copied().unwrap_or(0);
            }
            VehicleEvent::HelloResponse { payload: bytes }
        }
        _ => VehicleEvent::Unknown {
            msg_id,
            payload: payload(data).to_vec(),
        },
    };

    Ok(event)
}

/// Payload slice as declared by the size field, clamped to the frame.
fn payload(data: &[u8]) -> &[u8] {
    let declared = data[0] as usize;
    let end = (1 + declared).min(data.len());
    &data[2..end.max(2)]
}
