//! The host-stack seam
//!
//! The connection engine drives vehicles through the `BleHost` and
//! `VehicleLink` traits; `BluezHost` is the production implementation
//! over raw L2CAP/ATT/HCI. Tests substitute a scripted mock.
//!
//! `establish` spans socket open through GATT ready — the window in
//! which the adapter is held exclusively. `configure` does the
//! vendor-specific characteristic walk and notification enablement and
//! runs after the engine has already released the adapter to the next
//! attempt.

use std::rc::Rc;
use std::sync::mpsc as std_mpsc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::att::{AttClient, LinkEvent};
use crate::error::LinkError;
use crate::gatt::GattClient;
use crate::hci;
use crate::l2cap::L2capSocket;
use crate::protocol::uuid;
use crate::types::Address;

/// Handles captured from the vendor service during `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkProfile {
    pub read_value_handle: u16,
    pub write_value_handle: u16,
    pub write_properties: u8,
}

/// One established vehicle link.
#[async_trait(?Send)]
pub trait VehicleLink {
    /// Walk the vendor service, enable notifications, return the
    /// captured handles. Fatal errors here end the attempt for good.
    async fn configure(&mut self) -> Result<LinkProfile, LinkError>;

    /// GATT write-without-response of one coalesced buffer or frame.
    /// Returns false when the link cannot take the write.
    fn write(&self, frame: &[u8]) -> bool;

    /// Event stream of notifications and the disconnect signal. Yields
    /// the receiver once; the engine owns it afterwards.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;

    /// Issue an ATT read of the read characteristic; the value arrives
    /// on the event stream like a notification.
    fn read_value(&self);

    /// Renegotiate the connection interval on a detached worker. The
    /// receiver reports 0 or a raw OS error and is polled from the
    /// loop.
    fn request_conn_interval(&self, slots: u16) -> std_mpsc::Receiver<i32>;
}

/// Entry points the engine needs from the host's BLE stack.
#[async_trait(?Send)]
pub trait BleHost {
    /// Socket open → ATT bring-up → GATT ready. The caller enforces
    /// the per-attempt timeout around this future; dropping it closes
    /// the socket.
    async fn establish(
        &self,
        adapter_dev_id: u16,
        adapter_address: Address,
        target: Address,
    ) -> Result<Box<dyn VehicleLink>, LinkError>;

    /// Find and terminate a foreign LE connection to `target`.
    fn preempt_alien(&self, target: Address) -> Result<(), LinkError>;
}

// ============================================================================
// BlueZ implementation
// ============================================================================

/// Production host stack over the kernel's Bluetooth sockets.
#[derive(Default)]
pub struct BluezHost;

impl BluezHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl BleHost for BluezHost {
    async fn establish(
        &self,
        adapter_dev_id: u16,
        adapter_address: Address,
        target: Address,
    ) -> Result<Box<dyn VehicleLink>, LinkError> {
        let socket = Rc::new(L2capSocket::connect_att(adapter_address, target)?);
        socket.connected().await?;
        debug!(%target, dev_id = adapter_dev_id, "L2CAP channel up");

        let (att, events) = AttClient::new(Rc::clone(&socket));
        let gatt = GattClient::new(att.clone()).await?;
        debug!(%target, services = gatt.services().len(), "GATT ready");

        Ok(Box::new(BluezLink {
            socket,
            att,
            gatt,
            events: Some(events),
            dev_id: adapter_dev_id,
            write_value_handle: 0,
        }))
    }

    fn preempt_alien(&self, target: Address) -> Result<(), LinkError> {
        let found = hci::find_alien_connection(target)
            .map_err(|e| LinkError::PreemptFailed(e.to_string()))?;
        let Some((dev_id, handle)) = found else {
            return Err(LinkError::PreemptFailed("no matching connection".into()));
        };
        hci::disconnect(dev_id, handle, hci::REASON_REMOTE_USER_TERMINATED)
            .map_err(|e| LinkError::PreemptFailed(e.to_string()))
    }
}

struct BluezLink {
    socket: Rc<L2capSocket>,
    att: AttClient,
    gatt: GattClient,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    dev_id: u16,
    write_value_handle: u16,
}

#[async_trait(?Send)]
impl VehicleLink for BluezLink {
    async fn configure(&mut self) -> Result<LinkProfile, LinkError> {
        let service_uuid = uuid::to_bytes_le(uuid::SERVICE);
        let read_uuid = uuid::to_bytes_le(uuid::CHR_READ);
        let write_uuid = uuid::to_bytes_le(uuid::CHR_WRITE);

        let service = self
            .gatt
            .find_service(&service_uuid)
            .ok_or(LinkError::MissingCharacteristics)?;

        let mut profile = LinkProfile {
            read_value_handle: 0,
            write_value_handle: 0,
            write_properties: 0,
        };
        for characteristic in self.gatt.characteristics(service).await? {
            if characteristic.uuid == read_uuid {
                profile.read_value_handle = characteristic.value_handle;
            } else if characteristic.uuid == write_uuid {
                profile.write_value_handle = characteristic.value_handle;
                profile.write_properties = characteristic.properties;
            }
        }
        if profile.read_value_handle == 0 || profile.write_value_handle == 0 {
            return Err(LinkError::MissingCharacteristics);
        }

        // The firmware wants 0x0001 poked at the handle equal to the
        // write characteristic's properties value before notifications
        // start; the value doubles as a handle on these vehicles.
        self.att
            .write_cmd(profile.write_properties as u16, &[0x01, 0x00])
            .map_err(|e| LinkError::CccdWrite(e.to_string()))?;

        let cccd = self
            .gatt
            .find_cccd(profile.read_value_handle, service.end_handle)
            .await?
            .ok_or_else(|| LinkError::NotifySubscribe("no CCCD descriptor".into()))?;
        self.gatt.subscribe(profile.read_value_handle, cccd).await?;

        self.write_value_handle = profile.write_value_handle;
        Ok(profile)
    }

    fn write(&self, frame: &[u8]) -> bool {
        if self.write_value_handle == 0 {
            return false;
        }
        self.att.write_cmd(self.write_value_handle, frame).is_ok()
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    fn read_value(&self) {
        let att = self.att.clone();
        let handle = att.notify_handle();
        if handle == 0 {
            return;
        }
        tokio::task::spawn_local(async move {
            match att.read(handle).await {
                Ok(rsp) if rsp.first() == Some(&crate::att::opcode::READ_RSP) => {
                    att.inject_notification(rsp[1..].to_vec());
                }
                Ok(rsp) => debug!(
                    opcode = rsp.first().copied().unwrap_or(0),
                    "unexpected read response"
                ),
                Err(e) => debug!(error = %e, "characteristic read failed"),
            }
        });
    }

    fn request_conn_interval(&self, slots: u16) -> std_mpsc::Receiver<i32> {
        let (tx, rx) = std_mpsc::channel();
        let dev_id = self.dev_id;
        match self.socket.conn_info() {
            Ok(info) => {
                let handle = info.hci_handle;
                std::thread::spawn(move || {
                    let _ = tx.send(hci::le_conn_update(dev_id, handle, slots));
                });
            }
            Err(e) => {
                let _ = tx.send(e.raw_os_error().unwrap_or(libc::EIO));
            }
        }
        rx
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        self.att.shutdown();
    }
}
