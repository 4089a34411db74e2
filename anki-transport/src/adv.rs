//! Vehicle advertisement parsing
//!
//! Vehicles pack their state into two AD structures: the manufacturer
//! data carries identifier, model and product id; the complete local
//! name carries a status byte, the firmware version and the UTF-8 name.
//! A sighting is complete once both the identifier and the version are
//! nonzero.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::types::VehicleModel;

const AD_TYPE_MANUFACTURER_DATA: u8 = 0xff;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct MfgData {
    identifier: U32,
    model_id: u8,
    _reserved: u8,
    product_id: U16,
}

#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct LocalNameHeader {
    state: u8,
    version: U16,
    _reserved: [u8; 5],
}

/// Everything a vehicle advertises about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleAdvertisement {
    pub identifier: u32,
    pub model: VehicleModel,
    pub product_id: u16,
    pub state: u8,
    pub version: u16,
    pub name: String,
}

impl VehicleAdvertisement {
    /// Merge the AD structures of one advertising report into `self`.
    ///
    /// Vehicles split their data across the advertising PDU and the
    /// scan response, so sightings accumulate.
    pub fn merge_record(&mut self, data: &[u8]) {
        let mut rest = data;
        while rest.len() >= 2 {
            let len = rest[0] as usize;
            if len == 0 || rest.len() < len + 1 {
                break;
            }
            let ad_type = rest[1];
            let payload = &rest[2..len + 1];
            match ad_type {
                AD_TYPE_MANUFACTURER_DATA => {
                    if let Ok((mfg, _)) = MfgData::read_from_prefix(payload) {
                        self.identifier = mfg.identifier.get();
                        self.model = VehicleModel::from_id(mfg.model_id);
                        self.product_id = mfg.product_id.get();
                    }
                }
                AD_TYPE_COMPLETE_LOCAL_NAME => {
                    if let Ok((header, name)) = LocalNameHeader::read_from_prefix(payload) {
                        self.state = header.state;
                        self.version = header.version.get();
                        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                        self.name = String::from_utf8_lossy(&name[..end]).into_owned();
                    }
                }
                _ => {}
            }
            rest = &rest[len + 1..];
        }
    }

    /// Both halves of the advertisement have been seen.
    pub fn is_complete(&self) -> bool {
        self.identifier > 0 && self.version > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mfg_record(identifier: u32, model_id: u8, product_id: u16) -> Vec<u8> {
        let mut ad = vec![9, AD_TYPE_MANUFACTURER_DATA];
        ad.extend_from_slice(&identifier.to_le_bytes());
        ad.push(model_id);
        ad.push(0);
        ad.extend_from_slice(&product_id.to_le_bytes());
        ad
    }

    fn name_record(state: u8, version: u16, name: &str) -> Vec<u8> {
        let mut payload = vec![state];
        payload.extend_from_slice(&version.to_le_bytes());
        payload.extend_from_slice(&[0u8; 5]);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        let mut ad = vec![(payload.len() + 1) as u8, AD_TYPE_COMPLETE_LOCAL_NAME];
        ad.extend_from_slice(&payload);
        ad
    }

    #[test]
    fn test_merge_across_two_reports() {
        let mut adv = VehicleAdvertisement::default();

        adv.merge_record(&mfg_record(0xbeef0001, 4, 0xbeef));
        assert!(!adv.is_complete());
        assert_eq!(adv.model, VehicleModel::Katal);

        adv.merge_record(&name_record(0x41, 0x2959, "KATAL0"));
        assert!(adv.is_complete());
        assert_eq!(adv.version, 0x2959);
        assert_eq!(adv.name, "KATAL0");
        assert_eq!(adv.state, 0x41);
    }

    #[test]
    fn test_unknown_ad_structures_skipped() {
        let mut adv = VehicleAdvertisement::default();
        let mut data = vec![2, 0x01, 0x06]; // flags
        data.extend_from_slice(&mfg_record(7, 2, 1));
        adv.merge_record(&data);
        assert_eq!(adv.identifier, 7);
        assert_eq!(adv.model, VehicleModel::Boson);
    }

    #[test]
    fn test_truncated_record_ignored() {
        let mut adv = VehicleAdvertisement::default();
        adv.merge_record(&[5, AD_TYPE_MANUFACTURER_DATA, 0x01]); // short
        assert_eq!(adv.identifier, 0);
    }
}
