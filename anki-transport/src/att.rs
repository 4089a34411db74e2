//! Minimal ATT client
//!
//! Just enough of the Attribute Protocol to drive a vehicle: sequential
//! request/response transactions for discovery, Write Commands for the
//! data path, and Handle Value Notifications routed to the link's event
//! channel. ATT allows a single outstanding request per bearer, which
//! matches the one-slot pending transaction here.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::LinkError;
use crate::l2cap::L2capSocket;

/// ATT opcodes used by this client.
pub mod opcode {
    pub const ERROR_RSP: u8 = 0x01;
    pub const FIND_INFORMATION_REQ: u8 = 0x04;
    pub const FIND_INFORMATION_RSP: u8 = 0x05;
    pub const READ_BY_TYPE_REQ: u8 = 0x08;
    pub const READ_BY_TYPE_RSP: u8 = 0x09;
    pub const READ_REQ: u8 = 0x0a;
    pub const READ_RSP: u8 = 0x0b;
    pub const READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
    pub const READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
    pub const WRITE_REQ: u8 = 0x12;
    pub const WRITE_RSP: u8 = 0x13;
    pub const HANDLE_VALUE_NOTIFY: u8 = 0x1b;
    pub const WRITE_CMD: u8 = 0x52;
}

/// ATT error code: no attribute in the requested range.
pub const ECODE_ATTRIBUTE_NOT_FOUND: u8 = 0x0a;

/// How long a single discovery transaction may take.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Events surfaced by a live link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A notification (or solicited read result) from the vehicle.
    Notification(Vec<u8>),
    /// The ATT bearer went away; the reason is purely diagnostic.
    Disconnected(String),
}

struct AttInner {
    socket: Rc<L2capSocket>,
    pending: RefCell<Option<oneshot::Sender<Result<Vec<u8>, LinkError>>>>,
    /// Value handle whose notifications are forwarded; 0 before
    /// subscription forwards nothing.
    notify_handle: Cell<u16>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    reader: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

/// Cheaply cloneable handle to one ATT bearer.
#[derive(Clone)]
pub struct AttClient {
    inner: Rc<AttInner>,
}

impl AttClient {
    /// Wrap a connected socket and start the PDU reader.
    ///
    /// Must run inside a `LocalSet`; the reader is a local task.
    pub fn new(socket: Rc<L2capSocket>) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Rc::new(AttInner {
            socket: Rc::clone(&socket),
            pending: RefCell::new(None),
            notify_handle: Cell::new(0),
            events_tx,
            reader: RefCell::new(None),
        });

        let reader_inner = Rc::clone(&inner);
        let handle = tokio::task::spawn_local(async move {
            reader_loop(reader_inner).await;
        });
        *inner.reader.borrow_mut() = Some(handle);

        (Self { inner }, events_rx)
    }

    pub fn socket(&self) -> &Rc<L2capSocket> {
        &self.inner.socket
    }

    /// Forward notifications for this value handle from now on.
    pub fn set_notify_handle(&self, handle: u16) {
        self.inner.notify_handle.set(handle);
    }

    /// Currently subscribed value handle, 0 when unsubscribed.
    pub fn notify_handle(&self) -> u16 {
        self.inner.notify_handle.get()
    }

    /// Deliver a solicited read result through the notification path,
    /// so read responses reach the same inbound dispatch.
    pub fn inject_notification(&self, value: Vec<u8>) {
        let _ = self.inner.events_tx.send(LinkEvent::Notification(value));
    }

    /// Fire a Write Command (write-without-response).
    pub fn write_cmd(&self, handle: u16, value: &[u8]) -> Result<(), LinkError> {
        let mut pdu = Vec::with_capacity(3 + value.len());
        pdu.push(opcode::WRITE_CMD);
        pdu.extend_from_slice(&handle.to_le_bytes());
        pdu.extend_from_slice(value);
        self.inner.socket.send(&pdu).map_err(LinkError::Socket)
    }

    /// One request/response transaction.
    ///
    /// An ATT Error Response is returned as a normal payload so callers
    /// can distinguish end-of-discovery from transport failure.
    pub async fn request(&self, pdu: &[u8]) -> Result<Vec<u8>, LinkError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.borrow_mut();
            if pending.is_some() {
                // ATT allows one outstanding request per bearer.
                return Err(LinkError::Att("transaction already in flight".into()));
            }
            *pending = Some(tx);
        }
        if let Err(e) = self.inner.socket.send(pdu) {
            self.inner.pending.borrow_mut().take();
            return Err(LinkError::Socket(e));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                self.inner.pending.borrow_mut().take();
                Err(LinkError::Att("transaction timed out".into()))
            }
        }
    }

    pub async fn read_by_group_type(
        &self,
        start: u16,
        end: u16,
        group_type: u16,
    ) -> Result<Vec<u8>, LinkError> {
        let mut pdu = vec![opcode::READ_BY_GROUP_TYPE_REQ];
        pdu.extend_from_slice(&start.to_le_bytes());
        pdu.extend_from_slice(&end.to_le_bytes());
        pdu.extend_from_slice(&group_type.to_le_bytes());
        self.request(&pdu).await
    }

    pub async fn read_by_type(
        &self,
        start: u16,
        end: u16,
        attr_type: u16,
    ) -> Result<Vec<u8>, LinkError> {
        let mut pdu = vec![opcode::READ_BY_TYPE_REQ];
        pdu.extend_from_slice(&start.to_le_bytes());
        pdu.extend_from_slice(&end.to_le_bytes());
        pdu.extend_from_slice(&attr_type.to_le_bytes());
        self.request(&pdu).await
    }

    pub async fn find_information(&self, start: u16, end: u16) -> Result<Vec<u8>, LinkError> {
        let mut pdu = vec![opcode::FIND_INFORMATION_REQ];
        pdu.extend_from_slice(&start.to_le_bytes());
        pdu.extend_from_slice(&end.to_le_bytes());
        self.request(&pdu).await
    }

    pub async fn write_request(&self, handle: u16, value: &[u8]) -> Result<Vec<u8>, LinkError> {
        let mut pdu = vec![opcode::WRITE_REQ];
        pdu.extend_from_slice(&handle.to_le_bytes());
        pdu.extend_from_slice(value);
        self.request(&pdu).await
    }

    pub async fn read(&self, handle: u16) -> Result<Vec<u8>, LinkError> {
        let mut pdu = vec![opcode::READ_REQ];
        pdu.extend_from_slice(&handle.to_le_bytes());
        self.request(&pdu).await
    }

    /// Stop the reader; called from the link's teardown.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.reader.borrow_mut().take() {
            handle.abort();
        }
    }
}

async fn reader_loop(inner: Rc<AttInner>) {
    let mut buf = [0u8; 512];
    loop {
        match inner.socket.recv(&mut buf).await {
            Ok(0) => {
                fail_pending(&inner);
                let _ = inner
                    .events_tx
                    .send(LinkEvent::Disconnected("connection reset by peer".into()));
                return;
            }
            Ok(n) => dispatch(&inner, &buf[..n]),
            Err(e) => {
                fail_pending(&inner);
                let _ = inner.events_tx.send(LinkEvent::Disconnected(e.to_string()));
                return;
            }
        }
    }
}

fn fail_pending(inner: &AttInner) {
    if let Some(tx) = inner.pending.borrow_mut().take() {
        let _ = tx.send(Err(LinkError::Disconnected));
    }
}

fn dispatch(inner: &AttInner, pdu: &[u8]) {
    let Some(&op) = pdu.first() else { return };
    match op {
        opcode::HANDLE_VALUE_NOTIFY => {
            if pdu.len() < 3 {
                return;
            }
            let handle = u16::from_le_bytes([pdu[1], pdu[2]]);
            let registered = inner.notify_handle.get();
            if registered != 0 && handle == registered {
                let _ = inner
                    .events_tx
                    .send(LinkEvent::Notification(pdu[3..].to_vec()));
            } else {
                trace!(handle, "dropping notification for unsubscribed handle");
            }
        }
        opcode::ERROR_RSP
        | opcode::FIND_INFORMATION_RSP
        | opcode::READ_BY_TYPE_RSP
        | opcode::READ_RSP
        | opcode::READ_BY_GROUP_TYPE_RSP
        | opcode::WRITE_RSP => {
            if let Some(tx) = inner.pending.borrow_mut().take() {
                let _ = tx.send(Ok(pdu.to_vec()));
            } else {
                debug!(opcode = op, "unsolicited ATT response");
            }
        }
        _ => trace!(opcode = op, "ignoring ATT PDU"),
    }
}

/// Whether a response PDU is an Error Response ending a discovery scan.
pub fn is_not_found(rsp: &[u8]) -> bool {
    rsp.first() == Some(&opcode::ERROR_RSP)
        && rsp.len() >= 5
        && rsp[4] == ECODE_ATTRIBUTE_NOT_FOUND
}
