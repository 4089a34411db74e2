//! Raw HCI plumbing
//!
//! Adapter enumeration, the alien-connection lookup and disconnect used
//! for preemption, the LE connection-interval update behind the latency
//! tuning, and the LE advertisement scan. Everything here is blocking
//! with short bounded timeouts; callers decide whether to run it on the
//! loop (scan, an operator command) or on a worker thread (latency).

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::Address;

const BTPROTO_HCI: libc::c_int = 1;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;

const HCIGETDEVLIST: libc::c_ulong = 0x800448d2;
const HCIGETDEVINFO: libc::c_ulong = 0x800448d3;
const HCIGETCONNLIST: libc::c_ulong = 0x800448d4;

const HCI_UP: u32 = 1 << 0;
const HCI_MAX_DEV: usize = 16;
const MAX_CONN: usize = 32;

/// LE links show up in the connection list with this unofficial type.
const LINK_TYPE_LE: u8 = 0x80;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

const EVT_DISCONN_COMPLETE: u8 = 0x05;
const EVT_CMD_COMPLETE: u8 = 0x0e;
const EVT_CMD_STATUS: u8 = 0x0f;
const EVT_LE_META_EVENT: u8 = 0x3e;

const LE_META_CONN_UPDATE_COMPLETE: u8 = 0x03;
const LE_META_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LINK_CTL: u16 = 0x01;
const OCF_DISCONNECT: u16 = 0x0006;
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000b;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000c;
const OCF_LE_CONN_UPDATE: u16 = 0x0013;

/// HCI disconnect reason: remote user terminated connection.
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

/// Supervision timeout for the latency renegotiation, in 10 ms units.
const CONN_UPDATE_SUPERVISION_TIMEOUT: u16 = 0x02bc;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

#[repr(C)]
struct HciDevListReq {
    dev_num: u16,
    dev_req: [HciDevReq; HCI_MAX_DEV],
}

#[repr(C)]
struct HciDevStats {
    err_rx: u32,
    err_tx: u32,
    cmd_tx: u32,
    evt_rx: u32,
    acl_tx: u32,
    acl_rx: u32,
    sco_tx: u32,
    sco_rx: u32,
    byte_rx: u32,
    byte_tx: u32,
}

#[repr(C)]
struct HciDevInfo {
    dev_id: u16,
    name: [u8; 8],
    bdaddr: [u8; 6],
    flags: u32,
    dev_type: u8,
    features: [u8; 8],
    pkt_type: u32,
    link_policy: u32,
    link_mode: u32,
    acl_mtu: u16,
    acl_pkts: u16,
    sco_mtu: u16,
    sco_pkts: u16,
    stat: HciDevStats,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct HciConnInfo {
    handle: u16,
    bdaddr: [u8; 6],
    link_type: u8,
    out: u8,
    state: u16,
    link_mode: u32,
}

#[repr(C)]
struct HciConnListReq {
    dev_id: u16,
    conn_num: u16,
    conn_info: [HciConnInfo; MAX_CONN],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn events(events: &[u8]) -> Self {
        let mut filter = HciFilter {
            type_mask: 1 << HCI_EVENT_PKT,
            ..Default::default()
        };
        for &ev in events {
            if ev < 32 {
                filter.event_mask[0] |= 1 << ev;
            } else {
                filter.event_mask[1] |= 1 << (ev - 32);
            }
        }
        filter
    }
}

/// A local controller as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HciDevice {
    pub dev_id: u16,
    pub address: Address,
}

fn open_raw() -> io::Result<OwnedFd> {
    let raw = unsafe {
        libc::socket(
            libc::AF_BLUETOOTH,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            BTPROTO_HCI,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn open_dev(dev_id: u16) -> io::Result<OwnedFd> {
    let fd = open_raw()?;
    let addr = SockaddrHci {
        hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        hci_dev: dev_id,
        hci_channel: 0,
    };
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const libc::sockaddr,
            mem::size_of::<SockaddrHci>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn set_filter(fd: &OwnedFd, filter: &HciFilter) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            filter as *const HciFilter as *const libc::c_void,
            mem::size_of::<HciFilter>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_command(fd: &OwnedFd, ogf: u16, ocf: u16, params: &[u8]) -> io::Result<()> {
    let opcode = (ogf << 10) | ocf;
    let mut pkt = Vec::with_capacity(4 + params.len());
    pkt.push(HCI_COMMAND_PKT);
    pkt.extend_from_slice(&opcode.to_le_bytes());
    pkt.push(params.len() as u8);
    pkt.extend_from_slice(params);

    let n = unsafe {
        libc::write(
            fd.as_raw_fd(),
            pkt.as_ptr() as *const libc::c_void,
            pkt.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read events until `visit` yields a result or the deadline passes.
fn wait_event<R>(
    fd: &OwnedFd,
    timeout: Duration,
    mut visit: impl FnMut(u8, &[u8]) -> Option<R>,
) -> io::Result<R> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 260];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "HCI event timeout"));
        }

        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "HCI event timeout"));
        }

        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let n = n as usize;
        if n < 3 || buf[0] != HCI_EVENT_PKT {
            continue;
        }
        let event = buf[1];
        let plen = buf[2] as usize;
        let end = (3 + plen).min(n);
        if let Some(result) = visit(event, &buf[3..end]) {
            return Ok(result);
        }
    }
}

/// Enumerate all controllers that are up.
pub fn enumerate() -> io::Result<Vec<HciDevice>> {
    let fd = open_raw()?;
    let mut list = HciDevListReq {
        dev_num: HCI_MAX_DEV as u16,
        dev_req: [HciDevReq::default(); HCI_MAX_DEV],
    };
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), HCIGETDEVLIST, &mut list as *mut _) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut devices = Vec::new();
    for req in &list.dev_req[..(list.dev_num as usize).min(HCI_MAX_DEV)] {
        let mut info: HciDevInfo = unsafe { mem::zeroed() };
        info.dev_id = req.dev_id;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), HCIGETDEVINFO, &mut info as *mut _) };
        if ret < 0 {
            debug!(dev_id = req.dev_id, "skipping unreadable HCI device");
            continue;
        }
        if info.flags & HCI_UP == 0 {
            continue;
        }
        devices.push(HciDevice {
            dev_id: info.dev_id,
            address: Address::from_bdaddr(info.bdaddr),
        });
    }
    devices.sort_by_key(|d| d.dev_id);
    Ok(devices)
}

/// Search every controller's connection table for an LE link to
/// `target` held outside this process.
pub fn find_alien_connection(target: Address) -> io::Result<Option<(u16, u16)>> {
    let fd = open_raw()?;
    let bdaddr = target.to_bdaddr();

    for device in enumerate()? {
        let mut list: HciConnListReq = unsafe { mem::zeroed() };
        list.dev_id = device.dev_id;
        list.conn_num = MAX_CONN as u16;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), HCIGETCONNLIST, &mut list as *mut _) };
        if ret < 0 {
            debug!(dev_id = device.dev_id, "connection list unavailable");
            continue;
        }
        for conn in &list.conn_info[..(list.conn_num as usize).min(MAX_CONN)] {
            if conn.bdaddr == bdaddr && conn.link_type == LINK_TYPE_LE {
                return Ok(Some((device.dev_id, conn.handle)));
            }
        }
    }
    Ok(None)
}

/// Issue an HCI Disconnect and wait for its completion event.
pub fn disconnect(dev_id: u16, handle: u16, reason: u8) -> io::Result<()> {
    let fd = open_dev(dev_id)?;
    set_filter(
        &fd,
        &HciFilter::events(&[EVT_CMD_STATUS, EVT_DISCONN_COMPLETE]),
    )?;

    let mut params = [0u8; 3];
    params[..2].copy_from_slice(&handle.to_le_bytes());
    params[2] = reason;
    send_command(&fd, OGF_LINK_CTL, OCF_DISCONNECT, &params)?;

    let opcode = (OGF_LINK_CTL << 10) | OCF_DISCONNECT;
    wait_event(&fd, Duration::from_secs(10), |event, p| match event {
        EVT_CMD_STATUS
            if p.len() >= 4
                && u16::from_le_bytes([p[2], p[3]]) == opcode
                && p[0] != 0 =>
        {
            Some(Err(io::Error::other(format!(
                "disconnect rejected with status 0x{:02x}",
                p[0]
            ))))
        }
        EVT_DISCONN_COMPLETE if p.len() >= 4 => {
            let ev_handle = u16::from_le_bytes([p[1], p[2]]);
            if ev_handle != handle {
                return None;
            }
            if p[0] == 0 {
                Some(Ok(()))
            } else {
                Some(Err(io::Error::other(format!(
                    "disconnect failed with status 0x{:02x}",
                    p[0]
                ))))
            }
        }
        _ => None,
    })?
}

/// Renegotiate the connection interval to `slots` × 1.25 ms.
///
/// Blocking, bounded by a 5-second event wait; runs on the latency
/// worker thread. Returns 0 on success or a raw OS error code.
pub fn le_conn_update(dev_id: u16, handle: u16, slots: u16) -> i32 {
    fn inner(dev_id: u16, handle: u16, slots: u16) -> io::Result<()> {
        let fd = open_dev(dev_id)?;
        set_filter(&fd, &HciFilter::events(&[EVT_CMD_STATUS, EVT_LE_META_EVENT]))?;

        let mut params = [0u8; 14];
        params[..2].copy_from_slice(&handle.to_le_bytes());
        params[2..4].copy_from_slice(&slots.to_le_bytes()); // min interval
        params[4..6].copy_from_slice(&slots.to_le_bytes()); // max interval
        params[6..8].copy_from_slice(&0u16.to_le_bytes()); // latency
        params[8..10].copy_from_slice(&CONN_UPDATE_SUPERVISION_TIMEOUT.to_le_bytes());
        // min/max CE length stay zero
        send_command(&fd, OGF_LE_CTL, OCF_LE_CONN_UPDATE, &params)?;

        let opcode = (OGF_LE_CTL << 10) | OCF_LE_CONN_UPDATE;
        wait_event(&fd, Duration::from_secs(5), |event, p| match event {
            EVT_CMD_STATUS
                if p.len() >= 4
                    && u16::from_le_bytes([p[2], p[3]]) == opcode
                    && p[0] != 0 =>
            {
                Some(Err(io::Error::other(format!(
                    "connection update rejected with status 0x{:02x}",
                    p[0]
                ))))
            }
            EVT_LE_META_EVENT
                if p.first() == Some(&LE_META_CONN_UPDATE_COMPLETE) && p.len() >= 4 =>
            {
                let ev_handle = u16::from_le_bytes([p[2], p[3]]);
                if ev_handle != handle {
                    return None;
                }
                if p[1] == 0 {
                    Some(Ok(()))
                } else {
                    Some(Err(io::Error::other(format!(
                        "connection update failed with status 0x{:02x}",
                        p[1]
                    ))))
                }
            }
            _ => None,
        })?
    }

    match inner(dev_id, handle, slots) {
        Ok(()) => 0,
        Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// One advertising sighting during a scan.
#[derive(Debug, Clone)]
pub struct AdvertisingReport {
    pub address: Address,
    pub data: Vec<u8>,
}

/// Run a blocking LE scan on one controller for `duration`.
///
/// The calling loop is paused for the whole budget; scanning is an
/// operator command, not part of the engine's steady state.
pub fn le_scan(
    dev_id: u16,
    duration: Duration,
    mut on_report: impl FnMut(AdvertisingReport),
) -> io::Result<()> {
    let fd = open_dev(dev_id)?;
    set_filter(&fd, &HciFilter::events(&[EVT_CMD_COMPLETE, EVT_CMD_STATUS]))?;

    // Active scan, interval = window = 0x0010, public own address,
    // no whitelist filtering.
    let mut params = [0u8; 7];
    params[0] = 0x01;
    params[1..3].copy_from_slice(&0x0010u16.to_le_bytes());
    params[3..5].copy_from_slice(&0x0010u16.to_le_bytes());
    send_command(&fd, OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &params)?;
    wait_command_complete(&fd, OCF_LE_SET_SCAN_PARAMETERS)?;

    send_command(&fd, OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x01])?;
    wait_command_complete(&fd, OCF_LE_SET_SCAN_ENABLE)?;

    set_filter(&fd, &HciFilter::events(&[EVT_LE_META_EVENT]))?;

    let until = Instant::now() + duration;
    while Instant::now() < until {
        let remaining = until.saturating_duration_since(Instant::now());
        let report = wait_event(&fd, remaining, |event, p| {
            if event != EVT_LE_META_EVENT || p.first() != Some(&LE_META_ADVERTISING_REPORT) {
                return None;
            }
            // Subevent, report count, then the first report; further
            // reports in the same event are ignored.
            if p.len() < 11 {
                return None;
            }
            let mut bdaddr = [0u8; 6];
            bdaddr.copy_from_slice(&p[4..10]);
            let data_len = p[10] as usize;
            let end = (11 + data_len).min(p.len());
            Some(AdvertisingReport {
                address: Address::from_bdaddr(bdaddr),
                data: p[11..end].to_vec(),
            })
        });
        match report {
            Ok(report) => on_report(report),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => {
                let _ = stop_scan(&fd);
                return Err(e);
            }
        }
    }

    stop_scan(&fd)
}

fn stop_scan(fd: &OwnedFd) -> io::Result<()> {
    set_filter(fd, &HciFilter::events(&[EVT_CMD_COMPLETE, EVT_CMD_STATUS]))?;
    send_command(fd, OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x00, 0x01])?;
    wait_command_complete(fd, OCF_LE_SET_SCAN_ENABLE)
}

fn wait_command_complete(fd: &OwnedFd, ocf: u16) -> io::Result<()> {
    let opcode = (OGF_LE_CTL << 10) | ocf;
    wait_event(fd, Duration::from_secs(2), |event, p| match event {
        EVT_CMD_COMPLETE if p.len() >= 4 => {
            let ev_opcode = u16::from_le_bytes([p[1], p[2]]);
            if ev_opcode != opcode {
                return None;
            }
            if p[3] == 0 {
                Some(Ok(()))
            } else {
                Some(Err(io::Error::other(format!(
                    "command 0x{ev_opcode:04x} failed with status 0x{:02x}",
                    p[3]
                ))))
            }
        }
        EVT_CMD_STATUS if p.len() >= 4 && p[0] != 0 => {
            let ev_opcode = u16::from_le_bytes([p[2], p[3]]);
            if ev_opcode != opcode {
                return None;
            }
            Some(Err(io::Error::other(format!(
                "command 0x{ev_opcode:04x} rejected with status 0x{:02x}",
                p[0]
            ))))
        }
        _ => None,
    })?
}
