//! TX and RX endpoints bound to one CAN interface.
//!
//! The TX endpoint is write-only in spirit: its acceptance filter drops
//! every data frame, so the only traffic surfacing on it are link-error
//! frames. RX endpoints carry the caller's acceptance filter and the
//! per-endpoint overflow bookkeeping.

use std::io;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::raw::c_void;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, MsgFlags, SockaddrStorage};

use can_core::{CanError, CanFrame, Filter};

use crate::ancillary::{self, AncillaryData};
use crate::config::CanConfig;
use crate::frame::{RawFrame, FD_FRAME_SIZE};
use crate::socket::{self, CanAddr};

/// One decoded receive, as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct CanEvent {
    pub frame: CanFrame,
    /// Receive timestamp in microseconds, 0 when header processing is off.
    pub timestamp_us: u64,
    /// Descriptor of the endpoint the frame arrived on.
    pub endpoint: RawFd,
    pub is_rx: bool,
    pub is_error: bool,
    /// Frames the kernel dropped since the previous receive on this endpoint.
    pub dropped_frames: u32,
}

/// Advance the per-endpoint overflow bookkeeping and yield the delta.
fn overflow_delta(last: &mut u32, current: u32) -> u32 {
    let delta = current.wrapping_sub(*last);
    *last = current;
    delta
}

/// One non-blocking plain read. `Ok(None)` means nothing is pending.
fn recv_raw_frame(fd: RawFd) -> Result<Option<RawFrame>, CanError> {
    let mut buf = [0u8; FD_FRAME_SIZE];
    let nbytes = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, FD_FRAME_SIZE) };
    if nbytes < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENETDOWN) => {
                log::error!("MUXCAN - CAN network is down");
                Err(CanError::NetworkDown)
            }
            // EAGAIN and other transient conditions: the next pump retries
            _ => Ok(None),
        };
    }
    if nbytes == 0 {
        return Ok(None);
    }
    Ok(RawFrame::from_buffer(&buf, nbytes as usize))
}

pub(crate) struct TxEndpoint {
    fd: OwnedFd,
}

impl TxEndpoint {
    /// Open, configure and bind the shared transmit endpoint.
    pub(crate) fn open(ifname: &str, addr: &CanAddr, cfg: &CanConfig) -> Result<(Self, u32), CanError> {
        let fd = socket::raw_can_socket().map_err(|e| CanError::TxSocketCreate(e.to_string()))?;
        let raw = fd.as_raw_fd();
        socket::set_nonblocking(raw).map_err(|e| CanError::TxSocketCreate(e.to_string()))?;

        if cfg.canfd_enabled {
            let mtu = socket::interface_mtu(raw, ifname)
                .map_err(|e| CanError::sockopt("SIOCGIFMTU", e))?;
            if mtu != libc::CANFD_MTU as usize {
                log::error!("MUXCAN - CAN FD mtu not supported on {}", ifname);
                return Err(CanError::NotCanFd);
            }
            socket::set_fd_frames(raw, true)?;
        }

        // Accept no data frames; error frames bypass the acceptance filter,
        // so asynchronous link errors still surface here.
        socket::set_filters(raw, &[])?;

        let mut granted = 0;
        if cfg.tx_buf_len != 0 {
            granted = socket::set_buffer_len(raw, true, cfg.tx_buf_len)?;
        }

        if !cfg.error_mask.is_empty() {
            socket::set_error_filter(raw, cfg.error_mask)?;
        }

        socket::bind_socket(raw, addr).map_err(|e| {
            log::error!("MUXCAN - socket bind error on {}", ifname);
            CanError::TxSocketBind(e.to_string())
        })?;

        Ok((Self { fd }, granted))
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Write one frame at the MTU implied by the interface framing.
    pub(crate) fn write(&self, frame: &CanFrame, fd_mode: bool) -> Result<(), CanError> {
        let raw = RawFrame::encode(frame, fd_mode)?;
        let size = raw.size();
        match &raw {
            RawFrame::Classic(f) => socket::write_frame(self.fd(), f, size),
            RawFrame::Fd(f) => socket::write_frame(self.fd(), f, size),
        }
    }

    /// Drain one pending receive; only error frames can appear here.
    pub(crate) fn recv_event(&self) -> Result<Option<CanEvent>, CanError> {
        let raw = match recv_raw_frame(self.fd())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let frame = match raw.decode() {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let is_error = frame.is_error_frame();
        Ok(Some(CanEvent {
            frame,
            timestamp_us: 0,
            endpoint: self.fd(),
            is_rx: false,
            is_error,
            dropped_frames: 0,
        }))
    }
}

pub(crate) struct RxEndpoint {
    fd: OwnedFd,
    process_header: bool,
    last_overflow: u32,
}

impl RxEndpoint {
    /// Open, configure and bind a receive endpoint with the caller's
    /// acceptance filter. An empty filter vector accepts every frame.
    pub(crate) fn open(addr: &CanAddr, cfg: &CanConfig, filters: &[Filter]) -> Result<(Self, u32), CanError> {
        let fd = socket::raw_can_socket().map_err(|e| CanError::RxSocketCreate(e.to_string()))?;
        let raw = fd.as_raw_fd();
        socket::set_nonblocking(raw).map_err(|e| CanError::RxSocketCreate(e.to_string()))?;

        if cfg.process_header {
            socket::set_timestamping(raw, cfg.hw_timestamp)?;
            socket::set_rxq_overflow(raw)?;
        }

        if cfg.canfd_enabled {
            socket::set_fd_frames(raw, true)?;
        }

        let mut granted = 0;
        if cfg.rx_buf_len != 0 {
            granted = socket::set_buffer_len(raw, false, cfg.rx_buf_len)?;
        }

        if !cfg.error_mask.is_empty() {
            socket::set_error_filter(raw, cfg.error_mask)?;
        }

        if !filters.is_empty() {
            socket::set_filters(raw, filters)?;
        }

        socket::bind_socket(raw, addr).map_err(|e| CanError::RxSocketBind(e.to_string()))?;

        Ok((
            Self {
                fd,
                process_header: cfg.process_header,
                last_overflow: 0,
            },
            granted,
        ))
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Kernel drop counter as of the last receive.
    #[inline]
    pub(crate) fn overflow_total(&self) -> u32 {
        self.last_overflow
    }

    /// One non-blocking receive with ancillary decoding.
    pub(crate) fn recv_event(&mut self) -> Result<Option<CanEvent>, CanError> {
        if !self.process_header {
            let raw = match recv_raw_frame(self.fd())? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let frame = match raw.decode() {
                Some(frame) => frame,
                None => return Ok(None),
            };
            let is_error = frame.is_error_frame();
            return Ok(Some(CanEvent {
                frame,
                timestamp_us: 0,
                endpoint: self.fd(),
                is_rx: true,
                is_error,
                dropped_frames: 0,
            }));
        }

        let mut frame_buf = [0u8; FD_FRAME_SIZE];
        let mut cmsg_buf = nix::cmsg_space!([libc::timespec; 3], libc::timeval, u32);
        let (nbytes, anc) = {
            let mut iov = [IoSliceMut::new(&mut frame_buf)];
            let msg = match recvmsg::<SockaddrStorage>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(Errno::EAGAIN) => return Ok(None),
                Err(Errno::ENETDOWN) => {
                    log::error!("MUXCAN - CAN network is down");
                    return Err(CanError::NetworkDown);
                }
                Err(_) => return Ok(None),
            };
            let anc = match msg.cmsgs() {
                Ok(cmsgs) => ancillary::decode(cmsgs),
                Err(e) => {
                    log::warn!("MUXCAN - control message parse failed: {}", e);
                    AncillaryData::default()
                }
            };
            (msg.bytes, anc)
        };
        if nbytes == 0 {
            return Ok(None);
        }

        let raw = match RawFrame::from_buffer(&frame_buf, nbytes) {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let frame = match raw.decode() {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let dropped = match anc.rx_overflow {
            Some(current) => overflow_delta(&mut self.last_overflow, current),
            None => 0,
        };
        if dropped != 0 {
            log::error!("MUXCAN - CAN frames dropped by the kernel");
        }

        let is_error = frame.is_error_frame();
        Ok(Some(CanEvent {
            frame,
            timestamp_us: anc.timestamp_us,
            endpoint: self.fd.as_raw_fd(),
            is_rx: true,
            is_error,
            dropped_frames: dropped,
        }))
    }
}
