//! Vehicle scanner
//!
//! Operator-triggered LE scan: three seconds of blocking advertisement
//! reads on one adapter, merged into the registry afterwards. The event
//! loop is paused for the scan budget, which is acceptable for an
//! interactive command.

use std::collections::BTreeMap;
use std::time::Duration;

use anki_transport::{hci, Address, VehicleAdvertisement};

use crate::engine::Engine;
use crate::vehicle::Vehicle;

const SCAN_BUDGET: Duration = Duration::from_secs(3);

/// Scan and merge discoveries into the registry.
pub fn scan(engine: &mut Engine, dev_id: Option<u16>) {
    match engine.pool_mut().discover() {
        Ok(true) => {}
        Ok(false) => {
            engine.output().error("No bluetooth devices available.");
            return;
        }
        Err(e) => {
            engine
                .output()
                .error(format!("Failed to enumerate bluetooth devices: {e}."));
            return;
        }
    }

    let dev_id = match dev_id {
        Some(id) => {
            if !engine.pool().has_capacity_for(id) {
                engine
                    .output()
                    .error("Selected bluetooth device not available.");
                return;
            }
            id
        }
        None => match engine.pool_mut().pick_free_including_blocked() {
            Some(index) => engine.pool().get(index).dev_id,
            None => {
                engine.output().error("No bluetooth device available.");
                return;
            }
        },
    };

    engine.output().line(format!(
        "Scanning for bluetooth low-energy devices using hci{dev_id}"
    ));

    let mut sightings: BTreeMap<Address, VehicleAdvertisement> = BTreeMap::new();
    let mut complete: Vec<Address> = Vec::new();
    let out = engine.output().clone();

    let result = hci::le_scan(dev_id, SCAN_BUDGET, |report| {
        let adv = sightings.entry(report.address).or_default();
        let was_complete = adv.is_complete();
        adv.merge_record(&report.data);
        if adv.is_complete() && !was_complete {
            out.line(format!(
                "Discovered {} {} [v{:04x}] ({} {:04x})",
                report.address,
                adv.name,
                adv.version,
                adv.model.name(),
                adv.identifier & 0xffff
            ));
            complete.push(report.address);
        }
    });
    if let Err(e) = result {
        engine.output().error(format!("Scan failed: {e}."));
        return;
    }

    // Fold the sightings into the registry, dropping stale records for
    // vehicles that are gone.
    engine.registry_mut().remove_disconnected();
    for address in complete {
        let adv = &sightings[&address];
        let mut vehicle = Vehicle::new(address, adv.name.clone(), adv.model);
        vehicle.version = adv.version;
        engine.registry_mut().add(vehicle);
    }
}
