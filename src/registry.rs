//! Vehicle registry
//!
//! Ordered collection of the known vehicles, deduplicated by address,
//! plus the wait-set of pending connection attempts the shell is
//! blocked on and the allocator for the small per-connection ids.

use std::collections::BTreeSet;

use anki_transport::Address;

use crate::vehicle::{ConnectionState, Vehicle};

#[derive(Default)]
pub struct VehicleRegistry {
    vehicles: Vec<Vehicle>,
    wait_list: BTreeSet<Address>,
    waiting_for_pending: bool,
    /// Round-robin cursor over connection candidates.
    next_candidate: usize,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vehicle; duplicates by address are rejected.
    pub fn add(&mut self, vehicle: Vehicle) -> bool {
        if self.index_by_address(vehicle.address).is_some() {
            return false;
        }
        self.vehicles.push(vehicle);
        true
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Vehicle> {
        self.vehicles.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Vehicle> {
        self.vehicles.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vehicle> {
        self.vehicles.iter_mut()
    }

    pub fn index_by_address(&self, address: Address) -> Option<usize> {
        self.vehicles.iter().position(|v| v.address == address)
    }

    /// Case-insensitive exact name lookup.
    pub fn index_by_name(&self, name: &str) -> Option<usize> {
        self.vehicles
            .iter()
            .position(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// N-th vehicle whose name starts with the prefix; used by the
    /// shell to disambiguate partial names.
    pub fn index_by_name_prefix(&self, prefix: &str, nth: usize) -> Option<usize> {
        self.vehicles
            .iter()
            .enumerate()
            .filter(|(_, v)| v.name.starts_with(prefix))
            .nth(nth)
            .map(|(index, _)| index)
    }

    pub fn connected_count(&self) -> usize {
        self.vehicles.iter().filter(|v| v.is_connected()).count()
    }

    /// Next vehicle in `ShouldConnect`, scanning round-robin from one
    /// past the previous pick so no vehicle starves.
    pub fn next_should_connect(&mut self) -> Option<usize> {
        if self.vehicles.is_empty() {
            return None;
        }
        let len = self.vehicles.len();
        for step in 0..len {
            let index = (self.next_candidate + step) % len;
            if self.vehicles[index].should_connect() {
                self.next_candidate = index + 1;
                return Some(index);
            }
        }
        None
    }

    /// Smallest connection id in 0..=255 not held by any vehicle.
    pub fn free_connection_id(&self) -> Option<u8> {
        let used: BTreeSet<u8> = self
            .vehicles
            .iter()
            .filter_map(|v| v.connection_id)
            .collect();
        (0..=u8::MAX).find(|id| !used.contains(id))
    }

    /// Drop records that are fully disconnected; the scanner refreshes
    /// the registry afterwards.
    pub fn remove_disconnected(&mut self) {
        self.vehicles
            .retain(|v| v.state != ConnectionState::Disconnected);
        self.next_candidate = 0;
    }

    // ========================================================================
    // Wait list
    // ========================================================================

    pub fn add_to_wait_list(&mut self, address: Address) {
        self.wait_list.insert(address);
        self.waiting_for_pending = true;
    }

    pub fn remove_from_wait_list(&mut self, address: Address) {
        self.wait_list.remove(&address);
    }

    pub fn wait_list_is_empty(&self) -> bool {
        self.wait_list.is_empty()
    }

    pub fn is_waiting_for_pending(&self) -> bool {
        self.waiting_for_pending
    }

    pub fn set_waiting_for_pending(&mut self, waiting: bool) {
        self.waiting_for_pending = waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anki_transport::VehicleModel;

    fn vehicle(last_byte: u8, name: &str) -> Vehicle {
        Vehicle::new(
            Address::new([0xc9, 0x02, 0x3a, 0x7d, 0x1a, last_byte]),
            name.into(),
            VehicleModel::Unknown,
        )
    }

    #[test]
    fn test_duplicate_addresses_rejected() {
        let mut registry = VehicleRegistry::new();
        assert!(registry.add(vehicle(1, "KOURAI0")));
        assert!(!registry.add(vehicle(1, "KOURAI1")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_name_lookup_is_case_insensitive() {
        let mut registry = VehicleRegistry::new();
        registry.add(vehicle(1, "Katal0"));
        assert_eq!(registry.index_by_name("KATAL0"), Some(0));
        assert_eq!(registry.index_by_name("katal0"), Some(0));
        assert_eq!(registry.index_by_name("KATAL"), None);
        assert_eq!(registry.index_by_name_prefix("Katal", 0), Some(0));
    }

    #[test]
    fn test_round_robin_candidate_selection() {
        let mut registry = VehicleRegistry::new();
        for i in 0..3 {
            registry.add(vehicle(i, &format!("V{i}")));
        }
        for v in registry.iter_mut() {
            v.state = ConnectionState::ShouldConnect;
        }

        assert_eq!(registry.next_should_connect(), Some(0));
        assert_eq!(registry.next_should_connect(), Some(1));
        assert_eq!(registry.next_should_connect(), Some(2));
        // Wraps around.
        assert_eq!(registry.next_should_connect(), Some(0));

        registry.get_mut(1).unwrap().state = ConnectionState::Connected;
        assert_eq!(registry.next_should_connect(), Some(2));
        assert_eq!(registry.next_should_connect(), Some(0));
    }

    #[test]
    fn test_free_connection_id_fills_gaps() {
        let mut registry = VehicleRegistry::new();
        for i in 0..3 {
            registry.add(vehicle(i, &format!("V{i}")));
        }
        assert_eq!(registry.free_connection_id(), Some(0));

        registry.get_mut(0).unwrap().connection_id = Some(0);
        registry.get_mut(1).unwrap().connection_id = Some(2);
        assert_eq!(registry.free_connection_id(), Some(1));

        registry.get_mut(2).unwrap().connection_id = Some(1);
        assert_eq!(registry.free_connection_id(), Some(3));
    }

    #[test]
    fn test_wait_list_flags() {
        let mut registry = VehicleRegistry::new();
        let addr = Address::new([1, 2, 3, 4, 5, 6]);
        assert!(registry.wait_list_is_empty());

        registry.add_to_wait_list(addr);
        assert!(!registry.wait_list_is_empty());
        assert!(registry.is_waiting_for_pending());

        registry.remove_from_wait_list(addr);
        assert!(registry.wait_list_is_empty());
        // The waiting flag is released by the engine, not here.
        assert!(registry.is_waiting_for_pending());
    }

    #[test]
    fn test_remove_disconnected() {
        let mut registry = VehicleRegistry::new();
        for i in 0..3 {
            registry.add(vehicle(i, &format!("V{i}")));
        }
        registry.get_mut(1).unwrap().state = ConnectionState::Connected;
        registry.remove_disconnected();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(0).unwrap().name, "V1");
    }
}
