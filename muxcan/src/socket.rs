//! Raw SocketCAN plumbing shared by the TX and RX endpoints.

use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::raw::{c_int, c_void};
use std::{fmt, io, mem, ptr};

use can_core::{CanError, CanErrorMask, Filter, IdentifierFlags};

/// CAN socket address. Wraps `sockaddr_can` for one interface index.
#[derive(Clone, Copy)]
pub struct CanAddr(libc::sockaddr_can);

impl CanAddr {
    /// Address for the given interface index.
    pub fn new(ifindex: u32) -> Self {
        let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
        addr.can_family = libc::AF_CAN as libc::sa_family_t;
        addr.can_ifindex = ifindex as c_int;
        Self(addr)
    }

    /// Resolve an interface name to its index and build the address.
    pub fn from_iface(ifname: &str) -> Result<Self, CanError> {
        let name = CString::new(ifname)
            .map_err(|_| CanError::InterfaceIndex(ifname.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            log::error!("MUXCAN - unable to get interface index on {}", ifname);
            return Err(CanError::InterfaceIndex(ifname.to_string()));
        }
        Ok(Self::new(ifindex))
    }

    #[inline]
    pub fn ifindex(&self) -> u32 {
        self.0.can_ifindex as u32
    }

    fn as_sockaddr_ptr(&self) -> *const libc::sockaddr {
        &self.0 as *const libc::sockaddr_can as *const libc::sockaddr
    }

    fn len() -> libc::socklen_t {
        mem::size_of::<libc::sockaddr_can>() as libc::socklen_t
    }
}

impl fmt::Debug for CanAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CanAddr {{ can_ifindex: {} }}", self.0.can_ifindex)
    }
}

/// Create an unbound raw CAN socket.
pub(crate) fn raw_can_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind the socket to its interface. Done last, after every option is set.
pub(crate) fn bind_socket(fd: RawFd, addr: &CanAddr) -> io::Result<()> {
    let ret = unsafe { libc::bind(fd, addr.as_sockaddr_ptr(), CanAddr::len()) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Switch the descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let oldfl = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if oldfl == -1 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, oldfl | libc::O_NONBLOCK) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `setsockopt` wrapper that does not require messing around with
/// `*const c_void`s.
pub(crate) fn set_socket_option<T>(fd: RawFd, level: c_int, name: c_int, val: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            val as *const _ as *const c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Sets a slice-valued socket option with one call.
pub(crate) fn set_socket_option_mult<T>(
    fd: RawFd,
    level: c_int,
    name: c_int,
    values: &[T],
) -> io::Result<()> {
    let ret = if values.is_empty() {
        // can't pass in a ptr to a 0-len slice, pass a null ptr instead
        unsafe { libc::setsockopt(fd, level, name, ptr::null(), 0) }
    } else {
        unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                values.as_ptr().cast(),
                mem::size_of_val(values) as libc::socklen_t,
            )
        }
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// `getsockopt` companion for scalar options.
pub(crate) fn get_socket_option<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut val: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(fd, level, name, &mut val as *mut _ as *mut c_void, &mut len)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(val)
}

/// Enable or disable CAN FD frames on the socket.
pub(crate) fn set_fd_frames(fd: RawFd, enable: bool) -> Result<(), CanError> {
    let enable = enable as c_int;
    set_socket_option(fd, libc::SOL_CAN_RAW, libc::CAN_RAW_FD_FRAMES, &enable)
        .map_err(|e| CanError::sockopt("CAN_RAW_FD_FRAMES", e))
}

/// Install the acceptance filter vector. An empty slice accepts nothing.
pub(crate) fn set_filters(fd: RawFd, filters: &[Filter]) -> Result<(), CanError> {
    let filters: Vec<libc::can_filter> = filters
        .iter()
        .map(|f| {
            let flag = if f.extended { IdentifierFlags::EXTENDED.bits() } else { 0 };
            libc::can_filter {
                can_id: f.can_id | flag,
                can_mask: f.can_mask | flag,
            }
        })
        .collect();
    set_socket_option_mult(fd, libc::SOL_CAN_RAW, libc::CAN_RAW_FILTER, &filters)
        .map_err(|e| CanError::sockopt("CAN_RAW_FILTER", e))
}

/// Select which error classes are delivered as error frames.
pub(crate) fn set_error_filter(fd: RawFd, mask: CanErrorMask) -> Result<(), CanError> {
    set_socket_option(fd, libc::SOL_CAN_RAW, libc::CAN_RAW_ERR_FILTER, &mask.bits())
        .map_err(|e| CanError::sockopt("CAN_RAW_ERR_FILTER", e))
}

/// Request receive timestamps, hardware-capable or software-only.
pub(crate) fn set_timestamping(fd: RawFd, hw: bool) -> Result<(), CanError> {
    if hw {
        let flags = (libc::SOF_TIMESTAMPING_SOFTWARE
            | libc::SOF_TIMESTAMPING_RX_SOFTWARE
            | libc::SOF_TIMESTAMPING_RAW_HARDWARE) as c_int;
        set_socket_option(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, &flags).map_err(|e| {
            log::info!("MUXCAN - setsockopt SO_TIMESTAMPING not supported");
            CanError::sockopt("SO_TIMESTAMPING", e)
        })
    } else {
        let enable: c_int = 1;
        set_socket_option(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP, &enable).map_err(|e| {
            log::info!("MUXCAN - setsockopt SO_TIMESTAMP not supported");
            CanError::sockopt("SO_TIMESTAMP", e)
        })
    }
}

/// Have the kernel report receive-queue overflow in the ancillary data.
pub(crate) fn set_rxq_overflow(fd: RawFd) -> Result<(), CanError> {
    let enable: c_int = 1;
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_RXQ_OVFL, &enable)
        .map_err(|e| CanError::sockopt("SO_RXQ_OVFL", e))
}

/// Resize a socket buffer and report the size the kernel actually granted.
///
/// The privileged FORCE variant is tried first since it may exceed the
/// `rmem_max`/`wmem_max` limits for CAP_NET_ADMIN processes; on failure the
/// ordinary variant applies within the limits.
pub(crate) fn set_buffer_len(fd: RawFd, send: bool, len: u32) -> Result<u32, CanError> {
    let (force, plain, opt) = if send {
        (libc::SO_SNDBUFFORCE, libc::SO_SNDBUF, "SO_SNDBUF")
    } else {
        (libc::SO_RCVBUFFORCE, libc::SO_RCVBUF, "SO_RCVBUF")
    };
    let len = len as c_int;

    if let Err(e) = set_socket_option(fd, libc::SOL_SOCKET, force, &len) {
        log::warn!("MUXCAN - setsockopt {}FORCE error: {}", opt, e);
        set_socket_option(fd, libc::SOL_SOCKET, plain, &len)
            .map_err(|e| CanError::sockopt(opt, e))?;
    }

    let granted: c_int = get_socket_option(fd, libc::SOL_SOCKET, plain)
        .map_err(|e| CanError::sockopt_read(opt, e))?;
    Ok(granted as u32)
}

/// Read the interface MTU, which distinguishes classic from FD capable links.
pub(crate) fn interface_mtu(fd: RawFd, ifname: &str) -> io::Result<usize> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    let max = ifr.ifr_name.len() - 1;
    for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.as_bytes().iter().take(max)) {
        *dst = *src as libc::c_char;
    }
    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFMTU, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_mtu } as usize)
}

/// Map a failed frame write to the transmit-flow taxonomy.
pub(crate) fn map_write_error(err: io::Error) -> CanError {
    match err.raw_os_error() {
        // the txqueue is full and there are no additional buffers; nothing
        // to log, the caller is asked to retry
        Some(libc::ENOBUFS) | Some(libc::EAGAIN) => CanError::TxRetryLater,
        _ => CanError::TxSocketWrite(err.to_string()),
    }
}

/// Write one frame worth of bytes; anything shorter than the MTU fails.
pub(crate) fn write_frame<T>(fd: RawFd, frame: &T, mtu: usize) -> Result<(), CanError> {
    let ret = unsafe { libc::write(fd, frame as *const _ as *const c_void, mtu) };
    if ret < 0 {
        return Err(map_write_error(io::Error::last_os_error()));
    }
    if (ret as usize) < mtu {
        return Err(CanError::IncompleteFrame);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_mapping() {
        assert_eq!(
            map_write_error(io::Error::from_raw_os_error(libc::ENOBUFS)),
            CanError::TxRetryLater
        );
        assert_eq!(
            map_write_error(io::Error::from_raw_os_error(libc::EAGAIN)),
            CanError::TxRetryLater
        );
        assert!(matches!(
            map_write_error(io::Error::from_raw_os_error(libc::EIO)),
            CanError::TxSocketWrite(_)
        ));
    }
}
