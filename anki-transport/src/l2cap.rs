//! Raw L2CAP sockets for the ATT channel
//!
//! The vehicles speak ATT over an LE connection-oriented channel on
//! CID 4. Connects are issued non-blocking; `EINPROGRESS` is the normal
//! outcome and completion is observed through write readiness. A
//! synchronous `EBUSY` means another process already holds a connection
//! to the target address (an "alien" connection) and is surfaced as its
//! own error so the engine can preempt it.
//!
//! The socket stays non-blocking for its entire life; the async reactor
//! requires it.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::LinkError;
use crate::types::Address;

/// ATT fixed channel id.
pub const ATT_CID: u16 = 4;

const BTPROTO_L2CAP: libc::c_int = 0;
const SOL_L2CAP: libc::c_int = 6;
const L2CAP_CONNINFO: libc::c_int = 0x02;
const BDADDR_LE_RANDOM: u8 = 0x02;

/// Kernel `struct sockaddr_l2`.
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

/// Kernel `struct l2cap_conninfo`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ConnInfo {
    pub hci_handle: u16,
    pub dev_class: [u8; 3],
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

/// A non-blocking SEQPACKET L2CAP socket registered with the reactor.
pub struct L2capSocket {
    inner: AsyncFd<OwnedFd>,
}

impl L2capSocket {
    /// Open a socket bound to `adapter` and start an LE-random connect
    /// to `target` on the ATT channel.
    ///
    /// Returns with the connect still in progress; await
    /// [`L2capSocket::connected`] for the outcome. A synchronous
    /// `EBUSY` maps to [`LinkError::Busy`].
    pub fn connect_att(adapter: Address, target: Address) -> Result<Self, LinkError> {
        let raw = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                BTPROTO_L2CAP,
            )
        };
        if raw < 0 {
            return Err(LinkError::Socket(last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut src: SockaddrL2 = unsafe { mem::zeroed() };
        src.l2_family = libc::AF_BLUETOOTH as libc::sa_family_t;
        src.l2_cid = ATT_CID.to_le();
        src.l2_bdaddr = adapter.to_bdaddr();
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &src as *const SockaddrL2 as *const libc::sockaddr,
                mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(LinkError::Socket(last_os_error()));
        }

        let mut dst: SockaddrL2 = unsafe { mem::zeroed() };
        dst.l2_family = libc::AF_BLUETOOTH as libc::sa_family_t;
        dst.l2_cid = ATT_CID.to_le();
        dst.l2_bdaddr = target.to_bdaddr();
        dst.l2_bdaddr_type = BDADDR_LE_RANDOM;
        let ret = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &dst as *const SockaddrL2 as *const libc::sockaddr,
                mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = last_os_error();
            match err.raw_os_error() {
                Some(libc::EINPROGRESS) => {}
                Some(libc::EBUSY) => return Err(LinkError::Busy),
                _ => return Err(LinkError::Socket(err)),
            }
        }

        let inner = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)
            .map_err(LinkError::Socket)?;
        Ok(Self { inner })
    }

    /// Wait until the in-progress connect resolves, then check
    /// `SO_ERROR` for the verdict.
    pub async fn connected(&self) -> Result<(), LinkError> {
        let mut guard = self
            .inner
            .writable()
            .await
            .map_err(LinkError::Socket)?;
        guard.retain_ready();

        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(LinkError::Socket(last_os_error()));
        }
        match err {
            0 => Ok(()),
            libc::EBUSY => Err(LinkError::Busy),
            e => Err(LinkError::Socket(io::Error::from_raw_os_error(e))),
        }
    }

    /// HCI connection handle of the established link.
    pub fn conn_info(&self) -> io::Result<ConnInfo> {
        let mut info = ConnInfo::default();
        let mut len = mem::size_of::<ConnInfo>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                SOL_L2CAP,
                L2CAP_CONNINFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(info)
    }

    /// Receive one PDU without blocking.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(last_os_error());
        }
        Ok(n as usize)
    }

    /// Wait for read readiness, then receive one PDU.
    ///
    /// Returns `Ok(0)` once the peer hung up.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match self.try_recv(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send one PDU. SEQPACKET either takes the whole buffer or fails.
    pub fn send(&self, buf: &[u8]) -> io::Result<()> {
        let n = unsafe {
            libc::send(
                self.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(last_os_error());
        }
        if n as usize != buf.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short L2CAP send"));
        }
        Ok(())
    }
}

impl AsRawFd for L2capSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}
