//! Observer hooks for fleet events
//!
//! Downstream consumers (a traffic controller, a telemetry sink) get
//! called on localization and lifecycle events. Every hook defaults to
//! a no-op; the stock tool installs [`NullObserver`].

use anki_transport::Address;

/// A localization marker as reported by a vehicle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Localization {
    pub block: u8,
    pub segment: u8,
    pub offset_mm: f32,
    pub speed_mm_per_sec: u16,
    pub clockwise: bool,
    pub reading_len: u8,
}

pub trait FleetObserver {
    fn on_localization(&mut self, _address: Address, _marker: &Localization) {}

    fn on_transition(&mut self, _address: Address, _offset_mm: f32, _forward: bool) {}

    fn on_delocalization(&mut self, _address: Address) {}

    fn on_wheel_movement(&mut self, _address: Address, _flag1: bool, _flag2: bool) {}

    fn on_state_flags(&mut self, _address: Address, _flags: [bool; 4]) {}

    fn on_disconnect(&mut self, _address: Address) {}
}

/// The default observer: ignores everything.
#[derive(Default)]
pub struct NullObserver;

impl FleetObserver for NullObserver {}
