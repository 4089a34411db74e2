//! Vehicle records
//!
//! One record per known vehicle: identity, connection state, transport
//! handles while connected, the outbound coalescing buffer, the pending
//! ping FIFO, and the last-observed localization. The command
//! primitives all gate on `Connected` and return false when the send is
//! rejected, so callers may drop messages freely.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anki_transport::message::{self, VehicleEvent};
use anki_transport::protocol::{lights, sdk, supercode};
use anki_transport::types::{Address, Firmware, TrackMaterial, VehicleModel};
use anki_transport::{LightChannel, LightEffect, LinkProfile, MessageBuffer, VehicleLink};
use tokio::task::JoinHandle;

use crate::observer::{FleetObserver, Localization};
use crate::output::{tagged, Output};

/// Radio latency compensation applied to message timestamps.
const RADIO_LATENCY: Duration = Duration::from_millis(40);

/// Default longitudinal acceleration in mm/s².
pub const DEFAULT_ACCELERATION: u16 = 25000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    ShouldConnect,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

/// A commanded maneuver, kept since the last localization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Maneuver {
    pub at: Instant,
    pub direction: Option<Direction>,
    pub v_lon: u16,
    pub a_lon: u16,
    pub v_lat: u16,
    pub a_lat: u16,
    pub p_lat: f32,
}

impl Default for Maneuver {
    fn default() -> Self {
        Self {
            at: Instant::now(),
            direction: None,
            v_lon: 0,
            a_lon: DEFAULT_ACCELERATION,
            v_lat: 0,
            a_lat: 1000,
            p_lat: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PingRecord {
    at: Instant,
    id: u32,
    tagged: bool,
}

/// Background tasks serving one connection attempt or live link.
#[derive(Default)]
pub struct LinkTasks {
    pub connect: Option<JoinHandle<()>>,
    pub forwarder: Option<JoinHandle<()>>,
    pub latency: Option<JoinHandle<()>>,
}

impl LinkTasks {
    pub fn abort_all(&mut self) {
        for task in [
            self.connect.take(),
            self.forwarder.take(),
            self.latency.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }

    fn any_active(&self) -> bool {
        self.connect.is_some() || self.forwarder.is_some() || self.latency.is_some()
    }
}

pub struct Vehicle {
    // Identity
    pub address: Address,
    pub name: String,
    pub model: VehicleModel,
    pub version: u16,

    // Connection state
    pub state: ConnectionState,
    pub connection_id: Option<u8>,
    pub adapter: Option<usize>,
    pub blocking_adapter: bool,
    pub link: Option<Box<dyn VehicleLink>>,
    pub profile: Option<LinkProfile>,

    // Attempt bookkeeping
    pub tries: usize,
    pub max_tries: usize,
    pub on_wait_list: bool,
    /// Bumped on every teardown; stale events carry an older value.
    pub epoch: u64,
    pub tasks: LinkTasks,

    // Send path
    buffer: MessageBuffer,
    pings: VecDeque<PingRecord>,
    braking_lights: bool,
    lane_change_id: u8,

    // Telemetry
    pub voltage_mv: u16,
    pub voltage_at: Option<Instant>,
    pub marker: Option<Localization>,
    pub marker_at: Option<Instant>,
    maneuver_before_localization: Maneuver,
    maneuvers_since_localization: Vec<Maneuver>,
}

impl Vehicle {
    pub fn new(address: Address, name: String, model: VehicleModel) -> Self {
        Self {
            address,
            name,
            model,
            version: 0,
            state: ConnectionState::Disconnected,
            connection_id: None,
            adapter: None,
            blocking_adapter: false,
            link: None,
            profile: None,
            tries: 0,
            max_tries: 0,
            on_wait_list: false,
            epoch: 0,
            tasks: LinkTasks::default(),
            buffer: MessageBuffer::new(),
            pings: VecDeque::new(),
            braking_lights: false,
            lane_change_id: 0,
            voltage_mv: 0,
            voltage_at: None,
            marker: None,
            marker_at: None,
            maneuver_before_localization: Maneuver::default(),
            maneuvers_since_localization: Vec::new(),
        }
    }

    pub fn firmware(&self) -> Firmware {
        Firmware::from_version(self.version)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn should_connect(&self) -> bool {
        self.state == ConnectionState::ShouldConnect
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::ShouldConnect
        )
    }

    pub fn clockwise(&self) -> bool {
        self.marker.map(|m| m.clockwise).unwrap_or(false)
    }

    // ========================================================================
    // Send path
    // ========================================================================

    fn write_link(&self, bytes: &[u8]) -> bool {
        match &self.link {
            Some(link) => link.write(bytes),
            None => false,
        }
    }

    /// Flush the coalescing buffer as one GATT write.
    pub fn flush_buffer(&mut self) -> bool {
        match self.buffer.take() {
            Some((bytes, len)) => self.write_link(&bytes[..len]),
            None => true,
        }
    }

    /// Send one frame, optionally staging it in the coalescing buffer.
    ///
    /// Drive firmware (and vehicles whose version is still unknown)
    /// always writes through; Overdrive batches enqueueable sends.
    pub fn send_to_vehicle(&mut self, msg: &message::VehicleMsg, enqueue: bool) -> bool {
        if self.link.is_none() {
            return false;
        }

        if self.firmware().is_drive() {
            return self.write_link(msg.bytes());
        }

        if !enqueue && self.buffer.is_empty() {
            return self.write_link(msg.bytes());
        }

        let mut ret = true;
        if !self.buffer.fits(msg.len()) {
            ret = self.flush_buffer();
        }
        self.buffer.append(msg.bytes());

        // Also flush if not even the smallest message would fit anymore.
        if !enqueue || !self.buffer.has_room_for_min_frame() {
            ret = self.flush_buffer();
        }
        ret
    }

    /// Buffered byte count; only tests and diagnostics look at this.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    fn converted_offset(&self, offset: f32) -> f32 {
        if self.clockwise() && self.firmware().is_overdrive() {
            -offset
        } else {
            offset
        }
    }

    // ========================================================================
    // Command primitives
    // ========================================================================

    pub fn ping(&mut self, enqueue: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.pings.push_back(PingRecord {
            at: Instant::now(),
            id: 0,
            tagged: false,
        });
        self.send_to_vehicle(&message::ping(), enqueue)
    }

    pub fn ping_with_id(&mut self, id: u32, enqueue: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.pings.push_back(PingRecord {
            at: Instant::now(),
            id,
            tagged: true,
        });
        self.send_to_vehicle(&message::ping(), enqueue)
    }

    pub fn pending_pings(&self) -> usize {
        self.pings.len()
    }

    pub fn request_version(&mut self, enqueue: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_to_vehicle(&message::version_request(), enqueue)
    }

    pub fn request_voltage(&mut self, enqueue: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_to_vehicle(&message::battery_request(), enqueue)
    }

    pub fn set_sdk_mode(&mut self, on: u8) -> bool {
        if !self.is_connected() {
            return false;
        }
        let msg = message::set_sdk_mode(on, sdk::OPTION_OVERRIDE_LOCALIZATION);
        self.send_to_vehicle(&msg, true)
    }

    /// Issue an ATT read of the notify characteristic.
    pub fn read(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match &self.link {
            Some(link) => {
                link.read_value();
                true
            }
            None => false,
        }
    }

    /// Ask the vehicle to drop the link itself.
    pub fn disconnect_politely(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_to_vehicle(&message::disconnect(), false)
    }

    /// Set speed, toggling the brake-light pattern on zero crossings.
    pub fn set_speed(&mut self, speed: u16, acceleration: u16, enqueue: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        let msg = message::set_speed(speed, acceleration);
        let at = Instant::now() + RADIO_LATENCY;

        if speed == 0 && !self.braking_lights {
            self.send_to_vehicle(&msg, true);
            self.set_lights(lights::BRAKE_ON, enqueue);
            self.braking_lights = true;
        } else if speed != 0 && self.braking_lights {
            self.send_to_vehicle(&msg, true);
            self.set_lights(lights::BRAKE_OFF, enqueue);
            self.braking_lights = false;
        } else if !self.send_to_vehicle(&msg, enqueue) {
            return false;
        }

        let mut maneuver = self.last_maneuver();
        maneuver.at = at;
        maneuver.v_lon = speed;
        maneuver.a_lon = acceleration;
        self.report_maneuver(maneuver);
        true
    }

    /// Lane change relative to the current position: the anchor is
    /// reset first, so the commanded offset counts from here.
    pub fn change_lane(&mut self, speed: u16, acceleration: u16, offset: f32) -> bool {
        if !self.is_connected() {
            return false;
        }

        if !self.send_to_vehicle(&message::set_offset_from_road_center(0.0), true) {
            return false;
        }
        self.lane_change_id = 0;

        let converted = self.converted_offset(offset);
        let tag = self.lane_change_id;
        self.lane_change_id = self.lane_change_id.wrapping_add(1);
        self.send_to_vehicle(&message::change_lane(speed, acceleration, converted, tag), false)
    }

    /// Lane change to an absolute lateral position relative to the
    /// anchor defined with [`Vehicle::set_offset`].
    pub fn change_lane_abs(&mut self, speed: u16, acceleration: u16, offset: f32) -> bool {
        if !self.is_connected() {
            return false;
        }

        let converted = self.converted_offset(offset);
        let tag = self.lane_change_id;
        self.lane_change_id = self.lane_change_id.wrapping_add(1);
        let at = Instant::now() + RADIO_LATENCY;
        if !self.send_to_vehicle(&message::change_lane(speed, acceleration, converted, tag), false)
        {
            return false;
        }

        let mut maneuver = self.last_maneuver();
        maneuver.at = at;
        maneuver.v_lat = speed;
        maneuver.a_lat = acceleration;
        maneuver.p_lat = offset;
        self.report_maneuver(maneuver);
        true
    }

    pub fn cancel_lane_change(&mut self, enqueue: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        let at = Instant::now() + RADIO_LATENCY;
        if !self.send_to_vehicle(&message::cancel_lane_change(), enqueue) {
            return false;
        }

        let mut maneuver = self.last_maneuver();
        maneuver.at = at;
        maneuver.v_lat = 0;
        self.report_maneuver(maneuver);
        true
    }

    /// Define the lateral anchor: `offset` is where the last
    /// localization sits relative to the anchor position.
    pub fn set_offset(&mut self, offset: f32) -> bool {
        if !self.is_connected() {
            return false;
        }
        let converted = self.converted_offset(offset);
        if !self.send_to_vehicle(&message::set_offset_from_road_center(converted), false) {
            return false;
        }
        self.lane_change_id = 0;
        true
    }

    /// Add `delta` to the lateral anchor position.
    pub fn correct_offset(&mut self, delta: f32) -> bool {
        if !self.is_connected() {
            return false;
        }
        if delta == 0.0 {
            return true;
        }
        let converted = self.converted_offset(delta);
        self.send_to_vehicle(&message::correct_offset(converted), false)
    }

    pub fn uturn(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let msg = if self.firmware().is_drive() {
            message::turn_180_drive()
        } else {
            message::turn_180()
        };
        let at = Instant::now() + RADIO_LATENCY;
        if !self.send_to_vehicle(&msg, false) {
            return false;
        }

        let mut maneuver = self.last_maneuver();
        if let Some(direction) = maneuver.direction {
            maneuver.at = at;
            maneuver.v_lat = 0;
            maneuver.direction = Some(match direction {
                Direction::Clockwise => Direction::CounterClockwise,
                Direction::CounterClockwise => Direction::Clockwise,
            });
            self.report_maneuver(maneuver);
        }
        true
    }

    /// Fresh connections are stationary; switch the brake lights on.
    pub fn set_braking_lights_on(&mut self) {
        self.braking_lights = true;
        self.set_lights(lights::BRAKE_ON, false);
    }

    pub fn set_lights(&mut self, mask: u8, enqueue: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_to_vehicle(&message::set_lights(mask), enqueue)
    }

    pub fn set_lights_pattern(
        &mut self,
        channel: LightChannel,
        effect: LightEffect,
        start: u8,
        end: u8,
        cycles_per_min: u16,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        let msg = message::lights_pattern(channel, effect, start, end, cycles_per_min);
        self.send_to_vehicle(&msg, false)
    }

    /// Push track material and supercode config; Overdrive only.
    pub fn set_config_parameters(&mut self, super_code_mask: u8, material: TrackMaterial) -> bool {
        if !self.is_connected() || self.firmware().is_drive() {
            return false;
        }
        self.send_to_vehicle(&message::set_config_params(super_code_mask, material), false)
    }

    pub fn set_default_config(&mut self) -> bool {
        self.set_config_parameters(supercode::ALL, TrackMaterial::Vinyl)
    }

    /// Tell the vehicle how many lanes the track has; Overdrive only.
    pub fn configure_track(&mut self, number_of_lanes: u8) -> bool {
        if !self.is_connected() || self.firmware().is_drive() {
            return false;
        }
        self.send_to_vehicle(&message::configure_track(number_of_lanes), false)
    }

    // ========================================================================
    // Maneuver log
    // ========================================================================

    pub fn last_maneuver(&self) -> Maneuver {
        self.maneuvers_since_localization
            .last()
            .copied()
            .unwrap_or(self.maneuver_before_localization)
    }

    fn report_maneuver(&mut self, maneuver: Maneuver) {
        self.maneuvers_since_localization.push(maneuver);
    }

    pub fn maneuvers_since_localization(&self) -> &[Maneuver] {
        &self.maneuvers_since_localization
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Decode and act on one notification from the vehicle.
    pub fn on_message(&mut self, data: &[u8], out: &Output, observer: &mut dyn FleetObserver) {
        let event = match message::decode(data, self.firmware(), self.clockwise()) {
            Ok(event) => event,
            Err(e) => {
                out.line(format!("Invalid vehicle response from {}: {e}", self.address));
                return;
            }
        };
        let timestamp = Instant::now()
            .checked_sub(RADIO_LATENCY)
            .unwrap_or_else(Instant::now);
        let verbose = out.verbosity();

        match event {
            VehicleEvent::PingResponse => self.on_ping_response(out),
            VehicleEvent::VersionResponse { version } => {
                self.version = version;
                out.line(tagged(&self.name, format!("Version: 0x{version:04x}")));
            }
            VehicleEvent::BatteryResponse { millivolts } => {
                self.voltage_mv = millivolts;
                self.voltage_at = Some(timestamp);
                if verbose > 0 {
                    out.line(tagged(
                        &self.name,
                        format!(
                            "Battery: {:.3}V (0x{millivolts:04x})",
                            f32::from(millivolts) / 1000.0
                        ),
                    ));
                }
            }
            VehicleEvent::Position {
                block,
                segment,
                offset_mm,
                raw_offset_mm,
                speed_mm_per_sec,
                clockwise,
                reading_len,
                raw_flags,
            } => {
                let marker = Localization {
                    block,
                    segment,
                    offset_mm,
                    speed_mm_per_sec,
                    clockwise,
                    reading_len,
                };
                self.marker = Some(marker);
                self.marker_at = Some(timestamp);
                self.maneuver_before_localization = self.last_maneuver();
                self.maneuvers_since_localization.clear();
                observer.on_localization(self.address, &marker);

                if verbose > 0 {
                    if self.firmware().is_drive() {
                        out.line(tagged(
                            &self.name,
                            format!(
                                "Position: road_piece_id: 0x{segment:02x}, location_id: 0x{block:02x}, offset: {raw_offset_mm}, speed: {speed_mm_per_sec}, clockwise: 0x{raw_flags:02x}"
                            ),
                        ));
                    } else {
                        out.line(tagged(
                            &self.name,
                            format!(
                                "Position: road_piece_id: 0x{segment:02x}, location_id: 0x{block:02x}, offset: {raw_offset_mm}, speed: {speed_mm_per_sec}, flags: 0x{raw_flags:02x}"
                            ),
                        ));
                    }
                }
            }
            VehicleEvent::Transition {
                road_piece_idx,
                road_piece_idx_prev,
                offset_mm,
                raw_offset_mm,
                forward,
            } => {
                observer.on_transition(self.address, offset_mm, forward);
                if verbose > 0 {
                    out.line(tagged(
                        &self.name,
                        format!(
                            "Transition: road_piece_idx: 0x{road_piece_idx:02x}, road_piece_idx_prev: 0x{road_piece_idx_prev:02x}, offset: {raw_offset_mm}"
                        ),
                    ));
                }
            }
            VehicleEvent::OffsetUpdate {
                offset_mm,
                lane_change_id,
            } => {
                if verbose > 0 {
                    out.line(tagged(
                        &self.name,
                        format!(
                            "Offset Update: offset: {offset_mm}, lane_change_id: 0x{lane_change_id:02x}"
                        ),
                    ));
                }
            }
            VehicleEvent::Delocalized => {
                observer.on_delocalization(self.address);
                if verbose > 0 {
                    out.line(tagged(&self.name, "Delocalized!"));
                }
            }
            VehicleEvent::WheelMovement { flag1, flag2 } => {
                observer.on_wheel_movement(self.address, flag1, flag2);
                if verbose > 0 {
                    out.line(tagged(
                        &self.name,
                        format!(
                            "Wheel movement event with payload 0x{:02x}{:02x}",
                            flag1 as u8, flag2 as u8
                        ),
                    ));
                }
            }
            VehicleEvent::StateChange { flags } => {
                observer.on_state_flags(self.address, flags);
                if verbose > 0 {
                    out.line(tagged(
                        &self.name,
                        format!(
                            "State change event with payload 0x{:02x}{:02x}{:02x}{:02x}",
                            flags[0] as u8, flags[1] as u8, flags[2] as u8, flags[3] as u8
                        ),
                    ));
                }
            }
            VehicleEvent::HelloResponse { payload } => {
                if verbose > 0 {
                    let hex: String = payload.iter().map(|b| format!("{b:02x}")).collect();
                    out.line(tagged(&self.name, format!("EHLO with payload 0x{hex}")));
                }
            }
            VehicleEvent::Unknown { msg_id, payload } => {
                if verbose >= 2 {
                    let hex: String = payload.iter().map(|b| format!("0x{b:02x} ")).collect();
                    out.line(tagged(&self.name, format!("0x{msg_id:02x}: {hex}")));
                }
            }
        }
    }

    fn on_ping_response(&mut self, out: &Output) {
        let Some(record) = self.pings.pop_front() else {
            out.warning("Received ping response without request.");
            return;
        };

        let rtt_ms = record.at.elapsed().as_secs_f64() * 1000.0;
        if !record.tagged {
            out.line(format!(
                "{:>12}: Ping response: {rtt_ms:.0} ms RTT",
                self.address.to_string()
            ));
        } else if out.verbosity() >= 1 {
            out.line(format!(
                "{:>12}: Ping response: {rtt_ms:.0} ms RTT to request with identifier {}",
                self.address.to_string(),
                record.id
            ));
        }
    }

    // ========================================================================
    // Teardown support
    // ========================================================================

    /// Drop link state and telemetry after the transport is gone.
    /// Engine teardown calls this once the adapter is released.
    pub fn reset_link_state(&mut self) {
        self.link = None;
        self.profile = None;
        self.connection_id = None;
        self.buffer.clear();
        self.pings.clear();
        self.braking_lights = false;
        self.lane_change_id = 0;
        self.marker = None;
        self.marker_at = None;
        self.maneuver_before_localization = Maneuver::default();
        self.maneuvers_since_localization.clear();
    }

    /// Invariant check for the quiescent states: everything transient
    /// must be cleared in `Disconnected` and `ShouldConnect`.
    pub fn validate_idle_state(&self) -> Result<(), Vec<String>> {
        if !self.is_disconnected() {
            return Ok(());
        }

        let mut problems = Vec::new();
        if self.connection_id.is_some() {
            problems.push(format!(
                "connection id not reset: {}",
                self.connection_id.unwrap()
            ));
        }
        if self.link.is_some() {
            problems.push("transport link not reset".into());
        }
        if self.profile.is_some() {
            problems.push("characteristic handles not reset".into());
        }
        if self.adapter.is_some() {
            problems.push("adapter binding not reset".into());
        }
        if self.blocking_adapter {
            problems.push("adapter still blocked".into());
        }
        if self.tasks.any_active() {
            problems.push("link tasks still armed".into());
        }
        if !self.buffer.is_empty() {
            problems.push("coalescing buffer not empty".into());
        }
        if !self.pings.is_empty() {
            problems.push("pending ping queue not empty".into());
        }
        if self.marker.is_some() {
            problems.push("localization marker not cleared".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Label used by `list-vehicles`: unknown, Drive or Overdrive.
    ///
    /// The display split at 0x2159 predates the protocol split at
    /// 0x2666; scripts match on these tags.
    pub fn firmware_tag(&self) -> &'static str {
        if self.version == 0 {
            "(U) "
        } else if self.version <= 0x2159 {
            "(D) "
        } else {
            "(OD)"
        }
    }
}

impl std::fmt::Debug for Vehicle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vehicle")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anki_transport::error::LinkError;
    use anki_transport::LinkEvent;
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc as std_mpsc;
    use tokio::sync::mpsc;

    struct RecordingLink {
        writes: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    #[async_trait(?Send)]
    impl VehicleLink for RecordingLink {
        async fn configure(&mut self) -> Result<LinkProfile, LinkError> {
            Ok(LinkProfile {
                read_value_handle: 0x10,
                write_value_handle: 0x12,
                write_properties: 0x0c,
            })
        }

        fn write(&self, frame: &[u8]) -> bool {
            self.writes.borrow_mut().push(frame.to_vec());
            true
        }

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
            None
        }

        fn read_value(&self) {}

        fn request_conn_interval(&self, _slots: u16) -> std_mpsc::Receiver<i32> {
            let (tx, rx) = std_mpsc::channel();
            let _ = tx.send(0);
            rx
        }
    }

    fn connected_vehicle(version: u16) -> (Vehicle, Rc<RefCell<Vec<Vec<u8>>>>) {
        let mut vehicle = Vehicle::new(
            "C9:02:3A:7D:1A:00".parse().unwrap(),
            "KOURAI0".into(),
            VehicleModel::Kourai,
        );
        let writes = Rc::new(RefCell::new(Vec::new()));
        vehicle.link = Some(Box::new(RecordingLink {
            writes: Rc::clone(&writes),
        }));
        vehicle.state = ConnectionState::Connected;
        vehicle.version = version;
        (vehicle, writes)
    }

    const OVERDRIVE: u16 = 0x3863;
    const DRIVE: u16 = 0x2159;

    fn set_clockwise(vehicle: &mut Vehicle, clockwise: bool) {
        vehicle.marker = Some(Localization {
            block: 0,
            segment: 0,
            offset_mm: 0.0,
            speed_mm_per_sec: 0,
            clockwise,
            reading_len: 8,
        });
    }

    #[test]
    fn test_commands_rejected_when_not_connected() {
        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);
        vehicle.state = ConnectionState::Disconnected;
        assert!(!vehicle.ping(false));
        assert!(!vehicle.set_speed(100, 25000, false));
        assert!(!vehicle.uturn());
        assert!(!vehicle.set_lights(0x22, false));
        assert!(writes.borrow().is_empty());
    }

    #[test]
    fn test_drive_firmware_writes_through() {
        let (mut vehicle, writes) = connected_vehicle(DRIVE);
        assert!(vehicle.ping(true));
        // Enqueue requested, but Drive firmware never coalesces.
        assert_eq!(writes.borrow().len(), 1);
        assert_eq!(vehicle.buffered_len(), 0);
    }

    #[test]
    fn test_overdrive_coalesces_and_partitions_whole_messages() {
        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);

        // 7-byte set-speed frames: two fit staged, the third forces a
        // flush of the first two at 14 buffered bytes (14 + 7 > 20).
        let mut sent = Vec::new();
        for i in 0..5u16 {
            let msg = message::set_speed(100 + i, 25000);
            sent.extend_from_slice(msg.bytes());
            assert!(vehicle.send_to_vehicle(&msg, true));
        }
        vehicle.flush_buffer();

        let writes = writes.borrow();
        assert!(writes.len() > 1);
        let mut concatenated = Vec::new();
        for chunk in writes.iter() {
            assert!(chunk.len() <= 20);
            // Chunks contain only whole frames.
            let mut pos = 0;
            while pos < chunk.len() {
                let size = chunk[pos] as usize;
                assert!(pos + size + 1 <= chunk.len(), "split frame in chunk");
                pos += size + 1;
            }
            concatenated.extend_from_slice(chunk);
        }
        assert_eq!(concatenated, sent);
    }

    #[test]
    fn test_immediate_send_flushes_staged_bytes_first() {
        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);
        assert!(vehicle.send_to_vehicle(&message::ping(), true));
        assert_eq!(writes.borrow().len(), 0);

        assert!(vehicle.send_to_vehicle(&message::battery_request(), false));
        let writes = writes.borrow();
        // One write carrying ping then battery, in order.
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], vec![1, 0x16, 1, 0x1a]);
    }

    #[test]
    fn test_ping_fifo_matches_in_request_order() {
        let (mut vehicle, _writes) = connected_vehicle(OVERDRIVE);
        let out = Output::new();
        let mut observer = crate::observer::NullObserver;

        for id in 1..=3 {
            assert!(vehicle.ping_with_id(id, false));
        }
        assert_eq!(vehicle.pending_pings(), 3);

        for remaining in (0..3).rev() {
            vehicle.on_message(&[1, 0x17], &out, &mut observer);
            assert_eq!(vehicle.pending_pings(), remaining);
        }

        // A fourth response has no matching request.
        vehicle.on_message(&[1, 0x17], &out, &mut observer);
        assert_eq!(vehicle.pending_pings(), 0);
    }

    #[test]
    fn test_change_lane_negates_offset_for_clockwise_overdrive() {
        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);
        set_clockwise(&mut vehicle, true);
        assert!(vehicle.change_lane(1000, 25000, 10.0));

        let writes = writes.borrow();
        // Anchor reset is coalesced into the tagged change-lane write.
        assert_eq!(writes.len(), 1);
        let combined = &writes[0];
        let anchor_len = 6;
        assert_eq!(combined[1], 0x2c);
        let lane = &combined[anchor_len..];
        assert_eq!(lane[1], 0x25);
        let offset = f32::from_le_bytes([lane[6], lane[7], lane[8], lane[9]]);
        assert_eq!(offset, -10.0);
        assert_eq!(lane[11], 0, "first change after reset carries tag 0");

        drop(writes);
        // Counter-clockwise keeps the sign.
        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);
        set_clockwise(&mut vehicle, false);
        assert!(vehicle.change_lane(1000, 25000, 10.0));
        let writes = writes.borrow();
        let lane = &writes[0][6..];
        let offset = f32::from_le_bytes([lane[6], lane[7], lane[8], lane[9]]);
        assert_eq!(offset, 10.0);
    }

    #[test]
    fn test_clockwise_equivalence_property() {
        // encode(+o, clockwise) == encode(-o, counter-clockwise)
        let (mut cw, cw_writes) = connected_vehicle(OVERDRIVE);
        set_clockwise(&mut cw, true);
        cw.change_lane_abs(1000, 25000, 10.0);

        let (mut ccw, ccw_writes) = connected_vehicle(OVERDRIVE);
        set_clockwise(&mut ccw, false);
        ccw.change_lane_abs(1000, 25000, -10.0);

        assert_eq!(*cw_writes.borrow(), *ccw_writes.borrow());
    }

    #[test]
    fn test_drive_firmware_ignores_sign_convention() {
        let (mut vehicle, writes) = connected_vehicle(DRIVE);
        set_clockwise(&mut vehicle, true);
        assert!(vehicle.change_lane_abs(1000, 25000, 10.0));
        let writes = writes.borrow();
        let lane = &writes[0];
        let offset = f32::from_le_bytes([lane[6], lane[7], lane[8], lane[9]]);
        assert_eq!(offset, 10.0);
    }

    #[test]
    fn test_set_speed_toggles_brake_lights_on_zero_crossings() {
        let (mut vehicle, writes) = connected_vehicle(DRIVE);

        assert!(vehicle.set_speed(500, 25000, false));
        assert_eq!(writes.borrow().len(), 1, "no light change while rolling");

        assert!(vehicle.set_speed(0, 25000, false));
        {
            let writes = writes.borrow();
            assert_eq!(writes.len(), 3);
            assert_eq!(writes[2], vec![2, 0x1d, lights::BRAKE_ON]);
        }

        assert!(vehicle.set_speed(0, 25000, false));
        assert_eq!(writes.borrow().len(), 4, "no repeated brake-on");

        assert!(vehicle.set_speed(300, 25000, false));
        let writes = writes.borrow();
        assert_eq!(writes.len(), 6);
        assert_eq!(writes[5], vec![2, 0x1d, lights::BRAKE_OFF]);
    }

    #[test]
    fn test_correct_offset_zero_is_a_noop() {
        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);
        assert!(vehicle.correct_offset(0.0));
        assert!(writes.borrow().is_empty());

        assert!(vehicle.correct_offset(-3.0));
        assert_eq!(writes.borrow().len(), 1);
    }

    #[test]
    fn test_uturn_frame_depends_on_firmware() {
        let (mut vehicle, writes) = connected_vehicle(DRIVE);
        assert!(vehicle.uturn());
        assert_eq!(writes.borrow()[0], vec![1, 0x32]);

        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);
        assert!(vehicle.uturn());
        assert_eq!(writes.borrow()[0], vec![3, 0x32, 3, 0]);
    }

    #[test]
    fn test_config_commands_are_overdrive_only() {
        let (mut vehicle, writes) = connected_vehicle(DRIVE);
        assert!(!vehicle.set_default_config());
        assert!(!vehicle.configure_track(8));
        assert!(writes.borrow().is_empty());

        let (mut vehicle, writes) = connected_vehicle(OVERDRIVE);
        assert!(vehicle.set_default_config());
        assert!(vehicle.configure_track(8));
        assert_eq!(writes.borrow().len(), 2);
    }

    #[test]
    fn test_version_response_switches_firmware_handling() {
        let (mut vehicle, _writes) = connected_vehicle(0);
        assert!(vehicle.firmware().is_drive());

        let out = Output::new();
        let mut observer = crate::observer::NullObserver;
        vehicle.on_message(&[3, 0x19, 0x63, 0x38], &out, &mut observer);
        assert_eq!(vehicle.version, 0x3863);
        assert!(vehicle.firmware().is_overdrive());
    }

    #[test]
    fn test_localization_updates_marker_and_clears_maneuvers() {
        let (mut vehicle, _writes) = connected_vehicle(OVERDRIVE);
        let out = Output::new();
        let mut observer = crate::observer::NullObserver;

        assert!(vehicle.set_speed(400, 25000, false));
        assert_eq!(vehicle.maneuvers_since_localization().len(), 1);

        let mut frame = vec![16, 0x27, 0x21, 0x11];
        frame.extend_from_slice(&5.0f32.to_le_bytes());
        frame.extend_from_slice(&400u16.to_le_bytes());
        frame.push(0x48); // reverse parsing + 8 bits
        frame.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        vehicle.on_message(&frame, &out, &mut observer);

        let marker = vehicle.marker.unwrap();
        assert!(marker.clockwise);
        assert_eq!(marker.offset_mm, -5.0);
        assert!(vehicle.maneuvers_since_localization().is_empty());
        assert_eq!(vehicle.last_maneuver().v_lon, 400);
    }

    #[test]
    fn test_validator_flags_leftover_state() {
        let (mut vehicle, _writes) = connected_vehicle(OVERDRIVE);
        vehicle.state = ConnectionState::Disconnected;
        let problems = vehicle.validate_idle_state().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("link")));

        vehicle.reset_link_state();
        assert!(vehicle.validate_idle_state().is_ok());
    }

    #[test]
    fn test_firmware_tag_thresholds() {
        let (mut vehicle, _) = connected_vehicle(0);
        assert_eq!(vehicle.firmware_tag(), "(U) ");
        vehicle.version = 0x2159;
        assert_eq!(vehicle.firmware_tag(), "(D) ");
        vehicle.version = 0x215a;
        assert_eq!(vehicle.firmware_tag(), "(OD)");
    }
}
