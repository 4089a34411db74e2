//! Protocol constants for the Anki Drive/Overdrive GATT profile
//!
//! All values are fixed by the vendor firmware and must stay bit-exact.

/// Vendor GATT service and characteristic UUIDs.
pub mod uuid {
    /// Primary service exposed by every vehicle.
    pub const SERVICE: &str = "BE15BEEF-6186-407E-8381-0BD89C4D8DF4";
    /// Notify characteristic (vehicle to host).
    pub const CHR_READ: &str = "BE15BEE0-6186-407E-8381-0BD89C4D8DF4";
    /// Write characteristic (host to vehicle).
    pub const CHR_WRITE: &str = "BE15BEE1-6186-407E-8381-0BD89C4D8DF4";

    /// 128-bit little-endian form as it appears in ATT PDUs.
    pub fn to_bytes_le(uuid: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        let mut idx = 0;
        for c in uuid.chars().rev() {
            let Some(lo) = c.to_digit(16) else { continue };
            if idx % 2 == 0 {
                out[idx / 2] = lo as u8;
            } else {
                out[idx / 2] |= (lo as u8) << 4;
            }
            idx += 1;
        }
        out
    }
}

/// Message identifiers of the vehicle wire protocol.
pub mod msg {
    // Host to vehicle
    pub const C2V_DISCONNECT: u8 = 0x0d;
    pub const C2V_PING_REQUEST: u8 = 0x16;
    pub const C2V_VERSION_REQUEST: u8 = 0x18;
    pub const C2V_BATTERY_LEVEL_REQUEST: u8 = 0x1a;
    pub const C2V_SET_LIGHTS: u8 = 0x1d;
    pub const C2V_SET_SPEED: u8 = 0x24;
    pub const C2V_CHANGE_LANE: u8 = 0x25;
    pub const C2V_CANCEL_LANE_CHANGE: u8 = 0x26;
    pub const C2V_SET_OFFSET_FROM_ROAD_CENTER: u8 = 0x2c;
    pub const C2V_TURN: u8 = 0x32;
    pub const C2V_LIGHTS_PATTERN: u8 = 0x33;
    pub const C2V_CORRECT_OFFSET: u8 = 0x34;
    pub const C2V_SET_CONFIG_PARAMS: u8 = 0x45;
    pub const C2V_CONFIGURE_TRACK: u8 = 0x49;
    pub const C2V_SDK_MODE: u8 = 0x90;
    /// Vendor hello, answered with 0x0c.
    pub const C2V_HELLO: u8 = 0x0b;

    // Vehicle to host
    pub const V2C_HELLO_RESPONSE: u8 = 0x0c;
    pub const V2C_PING_RESPONSE: u8 = 0x17;
    pub const V2C_VERSION_RESPONSE: u8 = 0x19;
    pub const V2C_BATTERY_LEVEL_RESPONSE: u8 = 0x1b;
    pub const V2C_LOCALIZATION_POSITION_UPDATE: u8 = 0x27;
    pub const V2C_LOCALIZATION_TRANSITION_UPDATE: u8 = 0x29;
    pub const V2C_LOCALIZATION_INTERSECTION_UPDATE: u8 = 0x2a;
    pub const V2C_VEHICLE_DELOCALIZED: u8 = 0x2b;
    pub const V2C_OFFSET_FROM_ROAD_CENTER_UPDATE: u8 = 0x2d;
    pub const V2C_STATE_CHANGE: u8 = 0x3f;
    pub const V2C_WHEEL_MOVEMENT: u8 = 0x4d;

    /// Human-readable name for a message id.
    pub fn name(id: u8) -> &'static str {
        match id {
            C2V_DISCONNECT => "C2V_DISCONNECT",
            C2V_PING_REQUEST => "C2V_PING_REQUEST",
            C2V_VERSION_REQUEST => "C2V_VERSION_REQUEST",
            C2V_BATTERY_LEVEL_REQUEST => "C2V_BATTERY_LEVEL_REQUEST",
            C2V_SET_LIGHTS => "C2V_SET_LIGHTS",
            C2V_SET_SPEED => "C2V_SET_SPEED",
            C2V_CHANGE_LANE => "C2V_CHANGE_LANE",
            C2V_CANCEL_LANE_CHANGE => "C2V_CANCEL_LANE_CHANGE",
            C2V_SET_OFFSET_FROM_ROAD_CENTER => "C2V_SET_OFFSET_FROM_ROAD_CENTER",
            C2V_TURN => "C2V_TURN",
            C2V_LIGHTS_PATTERN => "C2V_LIGHTS_PATTERN",
            C2V_CORRECT_OFFSET => "C2V_CORRECT_OFFSET",
            C2V_SET_CONFIG_PARAMS => "C2V_SET_CONFIG_PARAMS",
            C2V_CONFIGURE_TRACK => "C2V_CONFIGURE_TRACK",
            C2V_SDK_MODE => "C2V_SDK_MODE",
            C2V_HELLO => "C2V_HELLO",
            V2C_HELLO_RESPONSE => "V2C_HELLO_RESPONSE",
            V2C_PING_RESPONSE => "V2C_PING_RESPONSE",
            V2C_VERSION_RESPONSE => "V2C_VERSION_RESPONSE",
            V2C_BATTERY_LEVEL_RESPONSE => "V2C_BATTERY_LEVEL_RESPONSE",
            V2C_LOCALIZATION_POSITION_UPDATE => "V2C_LOCALIZATION_POSITION_UPDATE",
            V2C_LOCALIZATION_TRANSITION_UPDATE => "V2C_LOCALIZATION_TRANSITION_UPDATE",
            V2C_LOCALIZATION_INTERSECTION_UPDATE => "V2C_LOCALIZATION_INTERSECTION_UPDATE",
            V2C_VEHICLE_DELOCALIZED => "V2C_VEHICLE_DELOCALIZED",
            V2C_OFFSET_FROM_ROAD_CENTER_UPDATE => "V2C_OFFSET_FROM_ROAD_CENTER_UPDATE",
            V2C_STATE_CHANGE => "V2C_STATE_CHANGE",
            V2C_WHEEL_MOVEMENT => "V2C_WHEEL_MOVEMENT",
            _ => "UNKNOWN",
        }
    }
}

/// Parsing-flag masks of the Overdrive position update.
pub mod parseflags {
    /// Low nibble: number of track-code bits read.
    pub const MASK_NUM_BITS: u8 = 0x0f;
    /// Codes were parsed in reverse, i.e. the vehicle drives clockwise.
    pub const MASK_REVERSE_PARSING: u8 = 0x40;
    /// Vehicle drives against its own forward direction.
    pub const MASK_REVERSE_DRIVING: u8 = 0x20;
}

/// SDK-mode option flags.
pub mod sdk {
    /// Let SDK speed/lane commands override the firmware's own plan.
    pub const OPTION_OVERRIDE_LOCALIZATION: u8 = 0x01;
}

/// Supercode parse mask values for the config-params message.
pub mod supercode {
    pub const NONE: u8 = 0x00;
    pub const BOOST_JUMP: u8 = 0x01;
    pub const ALL: u8 = BOOST_JUMP;
}

/// Driving direction byte of the Overdrive transition update.
pub mod driving_direction {
    pub const FORWARD: u8 = 0x00;
    pub const REVERSE: u8 = 0x01;
}

/// Light mask values for the plain set-lights message.
///
/// High nibble enables, low nibble disables; e.g. 0x22 switches the
/// brake light on and 0x02 switches it off.
pub mod lights {
    pub const FRONT_ON: u8 = 0x44;
    pub const FRONT_OFF: u8 = 0x04;
    pub const BRAKE_ON: u8 = 0x22;
    pub const BRAKE_OFF: u8 = 0x02;
    pub const BRAKE_FLASH: u8 = 0x88;
    pub const BRAKE_FLASH_OFF: u8 = 0x08;
    pub const ALL_ON: u8 = 0xff;
    pub const ALL_OFF: u8 = 0x0f;
}

/// Largest on-wire frame: 1 size byte + 1 id byte + 18 payload bytes.
pub const MAX_FRAME_SIZE: usize = 20;
/// Largest value of the size field.
pub const MAX_MSG_SIZE: u8 = (MAX_FRAME_SIZE - 1) as u8;
/// Size field of a frame with no payload.
pub const BASE_MSG_SIZE: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_le_bytes() {
        // Last UUID byte ends up first on the wire.
        let bytes = uuid::to_bytes_le(uuid::SERVICE);
        assert_eq!(bytes[0], 0xf4);
        assert_eq!(bytes[1], 0x8d);
        assert_eq!(bytes[15], 0xbe);
        assert_eq!(bytes[14], 0x15);
    }

    #[test]
    fn test_read_write_uuids_differ_in_one_nibble() {
        let read = uuid::to_bytes_le(uuid::CHR_READ);
        let write = uuid::to_bytes_le(uuid::CHR_WRITE);
        assert_ne!(read, write);
        assert_eq!(read[..12], write[..12]);
    }

    #[test]
    fn test_msg_names() {
        assert_eq!(msg::name(0x24), "C2V_SET_SPEED");
        assert_eq!(msg::name(0x27), "V2C_LOCALIZATION_POSITION_UPDATE");
        assert_eq!(msg::name(0xee), "UNKNOWN");
    }
}
