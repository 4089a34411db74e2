//! Transport abstraction layer for Anki Drive/Overdrive vehicles
//!
//! This crate owns everything between the connection engine and the
//! radio:
//!
//! - the vendor wire protocol (frame codec, typed builders and parsers)
//! - the 20-byte write-coalescing buffer
//! - raw L2CAP sockets carrying ATT on CID 4
//! - a minimal ATT client and GATT service discovery
//! - raw HCI plumbing (adapter enumeration, alien-connection
//!   preemption, LE connection updates, LE scanning)
//! - advertisement parsing for the scanner
//!
//! The [`BleHost`] / [`VehicleLink`] traits are the seam the engine
//! connects through; production uses [`BluezHost`], tests use a
//! scripted mock.

pub mod adv;
pub mod att;
pub mod coalesce;
pub mod error;
pub mod gatt;
pub mod hci;
pub mod host;
pub mod l2cap;
pub mod message;
pub mod protocol;
pub mod types;

pub use adv::VehicleAdvertisement;
pub use att::LinkEvent;
pub use coalesce::MessageBuffer;
pub use error::LinkError;
pub use host::{BleHost, BluezHost, LinkProfile, VehicleLink};
pub use message::{FrameError, VehicleEvent, VehicleMsg};
pub use types::{
    Address, Firmware, LightChannel, LightEffect, TrackMaterial, VehicleModel,
};
