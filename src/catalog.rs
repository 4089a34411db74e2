//! Persisted vehicle catalog
//!
//! `vehiclePoolDefaults.json` maps colon-separated MAC addresses to a
//! required `name` and an optional `ankiVehicleType` model id. Unknown
//! keys inside an entry are ignored; a parse error aborts loading with
//! a warning but never startup.

use std::collections::BTreeMap;
use std::path::Path;

use anki_transport::{Address, VehicleModel};
use serde::Deserialize;
use tracing::warn;

use crate::registry::VehicleRegistry;
use crate::vehicle::Vehicle;

pub const CATALOG_FILE: &str = "vehiclePoolDefaults.json";

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: Option<String>,
    #[serde(rename = "ankiVehicleType")]
    vehicle_type: Option<u8>,
}

/// Load the catalog into the registry. Returns how many vehicles were
/// added.
pub fn load_into(registry: &mut VehicleRegistry, path: &Path) -> usize {
    let Ok(raw) = std::fs::read_to_string(path) else {
        println!("vehicle configuration not found");
        return 0;
    };

    let entries: BTreeMap<String, CatalogEntry> = match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error opening vehicle catalog");
            println!("error opening {}", path.display());
            return 0;
        }
    };

    let mut added = 0;
    for (key, entry) in entries {
        let Ok(address) = key.parse::<Address>() else {
            continue;
        };
        let Some(name) = entry.name else {
            continue;
        };
        let model = entry
            .vehicle_type
            .map(VehicleModel::from_id)
            .unwrap_or(VehicleModel::Unknown);
        if registry.add(Vehicle::new(address, name, model)) {
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "drive_fleet_catalog_test_{}_{}.json",
            std::process::id(),
            content.len()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_catalog() {
        let path = write_temp(
            r#"{
                "C9:02:3A:7D:1A:00": {"name": "KOURAI0", "ankiVehicleType": 1},
                "D2:15:A1:0B:96:5C": {"name": "KATAL1", "ankiVehicleType": 4, "comment": "spare"},
                "E4:81:DD:61:B0:42": {"name": "MYSTERY"},
                "not-a-mac": {"name": "IGNORED"},
                "AA:BB:CC:DD:EE:FF": {"ankiVehicleType": 2}
            }"#,
        );
        let mut registry = VehicleRegistry::new();
        let added = load_into(&mut registry, &path);
        std::fs::remove_file(&path).ok();

        assert_eq!(added, 3);
        let index = registry.index_by_name("KATAL1").unwrap();
        assert_eq!(registry.get(index).unwrap().model, VehicleModel::Katal);
        let index = registry.index_by_name("MYSTERY").unwrap();
        assert_eq!(registry.get(index).unwrap().model, VehicleModel::Unknown);
        assert!(registry.index_by_name("IGNORED").is_none());
    }

    #[test]
    fn test_malformed_catalog_loads_nothing() {
        let path = write_temp("{ not json");
        let mut registry = VehicleRegistry::new();
        assert_eq!(load_into(&mut registry, &path), 0);
        std::fs::remove_file(&path).ok();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_catalog_is_fine() {
        let mut registry = VehicleRegistry::new();
        let missing = std::env::temp_dir().join("drive_fleet_no_such_catalog.json");
        assert_eq!(load_into(&mut registry, &missing), 0);
    }
}
