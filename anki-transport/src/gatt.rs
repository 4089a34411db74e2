//! GATT service discovery over the ATT client
//!
//! Performs a full primary-service walk at construction time (that walk
//! completing is what "GATT ready" means for the connection engine) and
//! offers the characteristic and descriptor lookups the vendor profile
//! needs.

use crate::att::{self, AttClient};
use crate::error::LinkError;

/// GATT declaration attribute types.
const TYPE_PRIMARY_SERVICE: u16 = 0x2800;
const TYPE_CHARACTERISTIC: u16 = 0x2803;
const TYPE_CCCD: u16 = 0x2902;

/// Bluetooth base UUID with a 16-bit value spliced in, little-endian.
pub fn uuid16_to_le128(value: u16) -> [u8; 16] {
    let mut out = [
        0xfb, 0x34, 0x9b, 0x5f, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];
    out[12] = (value & 0xff) as u8;
    out[13] = (value >> 8) as u8;
    out
}

fn normalize_uuid(raw: &[u8]) -> Option<[u8; 16]> {
    match raw.len() {
        2 => Some(uuid16_to_le128(u16::from_le_bytes([raw[0], raw[1]]))),
        16 => {
            let mut out = [0u8; 16];
            out.copy_from_slice(raw);
            Some(out)
        }
        _ => None,
    }
}

/// A discovered primary service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    pub start_handle: u16,
    pub end_handle: u16,
    pub uuid: [u8; 16],
}

/// A discovered characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    pub decl_handle: u16,
    pub value_handle: u16,
    pub properties: u8,
    pub uuid: [u8; 16],
}

pub struct GattClient {
    att: AttClient,
    services: Vec<Service>,
}

impl GattClient {
    /// Discover all primary services; success is the ready signal.
    pub async fn new(att: AttClient) -> Result<Self, LinkError> {
        let mut services = Vec::new();
        let mut start: u16 = 0x0001;

        loop {
            let rsp = att
                .read_by_group_type(start, 0xffff, TYPE_PRIMARY_SERVICE)
                .await?;
            if att::is_not_found(&rsp) {
                break;
            }
            if rsp.first() != Some(&att::opcode::READ_BY_GROUP_TYPE_RSP) || rsp.len() < 2 {
                return Err(LinkError::Att(format!(
                    "unexpected service discovery response 0x{:02x}",
                    rsp.first().copied().unwrap_or(0)
                )));
            }

            let entry_len = rsp[1] as usize;
            if entry_len < 6 {
                return Err(LinkError::Att("malformed service entry".into()));
            }
            let mut last_end = start;
            for entry in rsp[2..].chunks_exact(entry_len) {
                let start_handle = u16::from_le_bytes([entry[0], entry[1]]);
                let end_handle = u16::from_le_bytes([entry[2], entry[3]]);
                let Some(uuid) = normalize_uuid(&entry[4..]) else {
                    continue;
                };
                services.push(Service {
                    start_handle,
                    end_handle,
                    uuid,
                });
                last_end = end_handle;
            }

            if last_end == 0xffff {
                break;
            }
            start = last_end.wrapping_add(1);
            if start <= last_end {
                break;
            }
        }

        Ok(Self { att, services })
    }

    pub fn att(&self) -> &AttClient {
        &self.att
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn find_service(&self, uuid: &[u8; 16]) -> Option<Service> {
        self.services.iter().copied().find(|s| &s.uuid == uuid)
    }

    /// Walk the characteristic declarations of one service.
    pub async fn characteristics(
        &self,
        service: Service,
    ) -> Result<Vec<Characteristic>, LinkError> {
        let mut chars = Vec::new();
        let mut start = service.start_handle;

        while start <= service.end_handle {
            let rsp = self
                .att
                .read_by_type(start, service.end_handle, TYPE_CHARACTERISTIC)
                .await?;
            if att::is_not_found(&rsp) {
                break;
            }
            if rsp.first() != Some(&att::opcode::READ_BY_TYPE_RSP) || rsp.len() < 2 {
                return Err(LinkError::Att(format!(
                    "unexpected characteristic discovery response 0x{:02x}",
                    rsp.first().copied().unwrap_or(0)
                )));
            }

            // Entry: decl handle, properties, value handle, uuid.
            let entry_len = rsp[1] as usize;
            if entry_len < 7 {
                return Err(LinkError::Att("malformed characteristic entry".into()));
            }
            let mut last_decl = start;
            for entry in rsp[2..].chunks_exact(entry_len) {
                let decl_handle = u16::from_le_bytes([entry[0], entry[1]]);
                let properties = entry[2];
                let value_handle = u16::from_le_bytes([entry[3], entry[4]]);
                let Some(uuid) = normalize_uuid(&entry[5..]) else {
                    continue;
                };
                chars.push(Characteristic {
                    decl_handle,
                    value_handle,
                    properties,
                    uuid,
                });
                last_decl = decl_handle;
            }

            if last_decl == service.end_handle {
                break;
            }
            start = last_decl.wrapping_add(1);
            if start <= last_decl {
                break;
            }
        }

        Ok(chars)
    }

    /// Locate the client characteristic configuration descriptor that
    /// follows a characteristic's value handle.
    pub async fn find_cccd(
        &self,
        value_handle: u16,
        service_end: u16,
    ) -> Result<Option<u16>, LinkError> {
        if value_handle >= service_end {
            return Ok(None);
        }
        let rsp = self
            .att
            .find_information(value_handle + 1, service_end)
            .await?;
        if att::is_not_found(&rsp) {
            return Ok(None);
        }
        if rsp.first() != Some(&att::opcode::FIND_INFORMATION_RSP) || rsp.len() < 2 {
            return Ok(None);
        }

        // Format 0x01: 16-bit UUIDs.
        if rsp[1] != 0x01 {
            return Ok(None);
        }
        for entry in rsp[2..].chunks_exact(4) {
            let handle = u16::from_le_bytes([entry[0], entry[1]]);
            let uuid = u16::from_le_bytes([entry[2], entry[3]]);
            if uuid == TYPE_CCCD {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    /// Enable notifications: write 0x0001 to the CCCD and route
    /// notifications for the value handle to the event channel.
    pub async fn subscribe(&self, value_handle: u16, cccd_handle: u16) -> Result<(), LinkError> {
        let rsp = self
            .att
            .write_request(cccd_handle, &[0x01, 0x00])
            .await
            .map_err(|e| LinkError::NotifySubscribe(e.to_string()))?;
        if rsp.first() != Some(&att::opcode::WRITE_RSP) {
            return Err(LinkError::NotifySubscribe(format!(
                "CCCD write rejected with 0x{:02x}",
                rsp.first().copied().unwrap_or(0)
            )));
        }
        self.att.set_notify_handle(value_handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid16_expansion() {
        let cccd = uuid16_to_le128(0x2902);
        assert_eq!(cccd[12], 0x02);
        assert_eq!(cccd[13], 0x29);
        assert_eq!(&cccd[..4], &[0xfb, 0x34, 0x9b, 0x5f]);
    }

    #[test]
    fn test_normalize_uuid_lengths() {
        assert!(normalize_uuid(&[0x00, 0x28]).is_some());
        assert!(normalize_uuid(&[0u8; 16]).is_some());
        assert!(normalize_uuid(&[0u8; 4]).is_none());
    }
}
