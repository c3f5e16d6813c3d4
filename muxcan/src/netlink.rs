//! Interface configuration over rtnetlink.
//!
//! Bitrates, controller modes and the up/down state of a CAN controller
//! live behind the kernel's netlink interface, not behind the raw socket.
//! [`LinkOps`] is the call surface the rest of the crate depends on;
//! [`CanLink`] talks to the kernel, [`UnmanagedLink`] is for interfaces
//! someone else configures (vcan, externally managed hardware).

use std::ffi::CString;
use std::mem;
use std::os::raw::c_int;
use std::sync::Mutex;

use neli::{
    consts::{
        nl::{NlmF, NlmFFlags},
        rtnl::{Arphrd, IffFlags, Ifla, IflaInfo, RtAddrFamily, Rtm},
        socket::NlFamily,
    },
    nl::{NlPayload, Nlmsghdr},
    rtnl::{Ifinfomsg, Rtattr},
    socket::NlSocketHandle,
    types::RtBuffer,
};

use can_core::CanError;

use crate::config::{BitTiming, CanConfig, CtrlMode, CtrlModeFlags};

/// CAN-specific link attributes carried inside `IFLA_INFO_DATA`.
#[neli::neli_enum(serialized_type = "libc::c_ushort")]
pub enum IflaCan {
    Unspec = 0,
    BitTiming = 1,
    BitTimingConst = 2,
    Clock = 3,
    State = 4,
    CtrlMode = 5,
    RestartMs = 6,
    Restart = 7,
    BerrCounter = 8,
    DataBitTiming = 9,
}
impl neli::consts::rtnl::RtaType for IflaCan {}

/// Controller state as reported by the kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanState {
    ErrorActive,
    ErrorWarning,
    ErrorPassive,
    BusOff,
    Stopped,
    Sleeping,
    Unknown(u32),
}

impl From<u32> for CanState {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::ErrorActive,
            1 => Self::ErrorWarning,
            2 => Self::ErrorPassive,
            3 => Self::BusOff,
            4 => Self::Stopped,
            5 => Self::Sleeping,
            other => Self::Unknown(other),
        }
    }
}

/// Leading fields of the kernel `rtnl_link_stats` record.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct DeviceStats {
    pub rx_packets: u32,
    pub tx_packets: u32,
    pub rx_bytes: u32,
    pub tx_bytes: u32,
    pub rx_errors: u32,
    pub tx_errors: u32,
    pub rx_dropped: u32,
    pub tx_dropped: u32,
}

/// TX/RX error counters of the controller.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct BerrCounter {
    pub txerr: u16,
    pub rxerr: u16,
}

/// Wire layout of the kernel `can_ctrlmode` attribute.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct RawCtrlMode {
    mask: u32,
    flags: u32,
}

/// Call surface of the interface-configuration collaborator.
pub trait LinkOps: Send {
    /// Bring the interface up.
    fn start(&self) -> Result<(), CanError>;
    /// Bring the interface down.
    fn stop(&self) -> Result<(), CanError>;
    /// Trigger a manual bus-off recovery.
    fn restart(&self) -> Result<(), CanError>;
    fn state(&self) -> Result<CanState, CanError>;
    fn set_bitrate(&self, bitrate: u32) -> Result<(), CanError>;
    fn bitrate(&self) -> Result<u32, CanError>;
    fn set_data_bitrate(&self, dbitrate: u32) -> Result<(), CanError>;
    fn data_bitrate(&self) -> Result<u32, CanError>;
    fn set_restart_ms(&self, restart_ms: u32) -> Result<(), CanError>;
    fn restart_ms(&self) -> Result<u32, CanError>;
    fn set_ctrl_mode(&self, mode: CtrlMode) -> Result<(), CanError>;
    /// Currently active controller mode flags.
    fn ctrl_mode(&self) -> Result<CtrlModeFlags, CanError>;
    fn set_bit_timing(&self, timing: &BitTiming) -> Result<(), CanError>;
    fn bit_timing(&self) -> Result<BitTiming, CanError>;
    fn device_stats(&self) -> Result<DeviceStats, CanError>;
    fn berr_counter(&self) -> Result<BerrCounter, CanError>;
}

/// Write the non-sentinel link settings of `cfg`, verifying each one by
/// readback when `nl_cmd_verify` is set.
pub(crate) fn apply_link_config(link: &dyn LinkOps, cfg: &CanConfig) -> Result<(), CanError> {
    if let Some(bitrate) = cfg.bitrate {
        link.set_bitrate(bitrate)?;
        if cfg.nl_cmd_verify && link.bitrate()? != bitrate {
            return Err(CanError::ReadbackMismatch { attr: "bitrate" });
        }
    }

    if let Some(dbitrate) = cfg.dbitrate {
        link.set_data_bitrate(dbitrate)?;
        if cfg.nl_cmd_verify && link.data_bitrate()? != dbitrate {
            return Err(CanError::ReadbackMismatch { attr: "dbitrate" });
        }
    }

    if let Some(restart_ms) = cfg.restart_ms {
        link.set_restart_ms(restart_ms)?;
        if cfg.nl_cmd_verify && link.restart_ms()? != restart_ms {
            return Err(CanError::ReadbackMismatch { attr: "restart_ms" });
        }
    }

    if let Some(ref timing) = cfg.bit_timing {
        link.set_bit_timing(timing)?;
        if cfg.nl_cmd_verify && link.bit_timing()?.bitrate != timing.bitrate {
            return Err(CanError::ReadbackMismatch { attr: "bit_timing" });
        }
    }

    if let Some(mode) = cfg.ctrl_mode {
        link.set_ctrl_mode(mode)?;
        if cfg.nl_cmd_verify {
            let read = link.ctrl_mode()?;
            if read & mode.mask != mode.flags & mode.mask {
                return Err(CanError::ReadbackMismatch { attr: "ctrl_mode" });
            }
        }
    }

    Ok(())
}

/// Netlink-backed [`LinkOps`] for real CAN controllers.
pub struct CanLink {
    ifname: String,
}

impl CanLink {
    pub fn new(ifname: impl Into<String>) -> Self {
        Self { ifname: ifname.into() }
    }

    fn index(&self, op: &'static str) -> Result<u32, CanError> {
        let name = CString::new(self.ifname.as_str())
            .map_err(|_| CanError::netlink(op, "invalid interface name"))?;
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(CanError::netlink(op, std::io::Error::last_os_error()));
        }
        Ok(index)
    }

    fn open_route_socket(op: &'static str) -> Result<NlSocketHandle, CanError> {
        // groups is empty, no notifications wanted
        NlSocketHandle::connect(NlFamily::Route, None, &[])
            .map_err(|e| CanError::netlink(op, e))
    }

    fn send_info_msg(op: &'static str, info: Ifinfomsg) -> Result<(), CanError> {
        let mut sock = Self::open_route_socket(op)?;
        let hdr = Nlmsghdr::new(
            None,
            Rtm::Newlink,
            NlmFFlags::new(&[NlmF::Request, NlmF::Ack]),
            None,
            None,
            NlPayload::Payload(info),
        );
        sock.send(hdr).map_err(|e| CanError::netlink(op, e))
    }

    /// Send one `IFLA_LINKINFO / IFLA_INFO_DATA / <which>` attribute.
    fn set_can_attr<T>(&self, op: &'static str, which: IflaCan, val: &T) -> Result<(), CanError> {
        let mut linkinfo = Rtattr::new(None, Ifla::Linkinfo, Vec::<u8>::new())
            .map_err(|e| CanError::netlink(op, e))?;
        let kind = Rtattr::new(None, IflaInfo::Kind, &b"can"[..])
            .map_err(|e| CanError::netlink(op, e))?;
        linkinfo.add_nested_attribute(&kind).map_err(|e| CanError::netlink(op, e))?;

        let mut data = Rtattr::new(None, IflaInfo::Data, Vec::<u8>::new())
            .map_err(|e| CanError::netlink(op, e))?;
        let attr = Rtattr::new(None, which, as_bytes(val))
            .map_err(|e| CanError::netlink(op, e))?;
        data.add_nested_attribute(&attr).map_err(|e| CanError::netlink(op, e))?;
        linkinfo.add_nested_attribute(&data).map_err(|e| CanError::netlink(op, e))?;

        let mut buffer = RtBuffer::new();
        buffer.push(linkinfo);
        let info = Ifinfomsg::new(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.index(op)? as c_int,
            IffFlags::empty(),
            IffFlags::empty(),
            buffer,
        );
        Self::send_info_msg(op, info)
    }

    /// Query the link and pull one value out of its payload.
    fn link_payload<R>(
        &self,
        op: &'static str,
        extract: impl Fn(&Ifinfomsg) -> Option<R>,
    ) -> Result<R, CanError> {
        let mut sock = Self::open_route_socket(op)?;
        let info = Ifinfomsg::new(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.index(op)? as c_int,
            IffFlags::empty(),
            IffFlags::empty(),
            RtBuffer::new(),
        );
        let hdr = Nlmsghdr::new(
            None,
            Rtm::Getlink,
            NlmFFlags::new(&[NlmF::Request]),
            None,
            None,
            NlPayload::Payload(info),
        );
        sock.send(hdr).map_err(|e| CanError::netlink(op, e))?;

        for msg in sock.iter::<Rtm, Ifinfomsg>(false) {
            let msg = msg.map_err(|e| CanError::netlink(op, e))?;
            if let NlPayload::Payload(payload) = msg.nl_payload {
                return extract(&payload)
                    .ok_or_else(|| CanError::netlink(op, "attribute not present"));
            }
        }
        Err(CanError::netlink(op, "no response"))
    }
}

/// Pull one `IFLA_CAN_*` attribute out of a link payload.
fn can_attr<T: Copy>(payload: &Ifinfomsg, which: IflaCan) -> Option<T> {
    let mut attrs = payload.rtattrs.get_attr_handle();
    let mut linkinfo = attrs.get_nested_attributes::<IflaInfo>(Ifla::Linkinfo).ok()?;
    let mut data = linkinfo.get_nested_attributes::<IflaCan>(IflaInfo::Data).ok()?;
    let attr = data.get_attribute(which)?;
    read_struct(attr.rta_payload.as_ref())
}

fn read_struct<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

fn as_bytes<T>(val: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(val as *const T as *const u8, mem::size_of::<T>()) }
}

impl LinkOps for CanLink {
    fn start(&self) -> Result<(), CanError> {
        let info = Ifinfomsg::up(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.index("start")? as c_int,
            RtBuffer::new(),
        );
        Self::send_info_msg("start", info)
    }

    fn stop(&self) -> Result<(), CanError> {
        let info = Ifinfomsg::down(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.index("stop")? as c_int,
            RtBuffer::new(),
        );
        Self::send_info_msg("stop", info)
    }

    fn restart(&self) -> Result<(), CanError> {
        let trigger: u32 = 1;
        self.set_can_attr("restart", IflaCan::Restart, &trigger)
    }

    fn state(&self) -> Result<CanState, CanError> {
        self.link_payload("get state", |p| can_attr::<u32>(p, IflaCan::State))
            .map(CanState::from)
    }

    fn set_bitrate(&self, bitrate: u32) -> Result<(), CanError> {
        let timing = BitTiming { bitrate, ..Default::default() };
        self.set_can_attr("set bitrate", IflaCan::BitTiming, &timing)
    }

    fn bitrate(&self) -> Result<u32, CanError> {
        self.link_payload("get bitrate", |p| {
            can_attr::<BitTiming>(p, IflaCan::BitTiming).map(|t| t.bitrate)
        })
    }

    fn set_data_bitrate(&self, dbitrate: u32) -> Result<(), CanError> {
        let timing = BitTiming { bitrate: dbitrate, ..Default::default() };
        self.set_can_attr("set dbitrate", IflaCan::DataBitTiming, &timing)
    }

    fn data_bitrate(&self) -> Result<u32, CanError> {
        self.link_payload("get dbitrate", |p| {
            can_attr::<BitTiming>(p, IflaCan::DataBitTiming).map(|t| t.bitrate)
        })
    }

    fn set_restart_ms(&self, restart_ms: u32) -> Result<(), CanError> {
        self.set_can_attr("set restart_ms", IflaCan::RestartMs, &restart_ms)
    }

    fn restart_ms(&self) -> Result<u32, CanError> {
        self.link_payload("get restart_ms", |p| can_attr::<u32>(p, IflaCan::RestartMs))
    }

    fn set_ctrl_mode(&self, mode: CtrlMode) -> Result<(), CanError> {
        let raw = RawCtrlMode { mask: mode.mask.bits(), flags: mode.flags.bits() };
        self.set_can_attr("set ctrl_mode", IflaCan::CtrlMode, &raw)
    }

    fn ctrl_mode(&self) -> Result<CtrlModeFlags, CanError> {
        self.link_payload("get ctrl_mode", |p| can_attr::<RawCtrlMode>(p, IflaCan::CtrlMode))
            .map(|raw| CtrlModeFlags::from_bits_truncate(raw.flags))
    }

    fn set_bit_timing(&self, timing: &BitTiming) -> Result<(), CanError> {
        self.set_can_attr("set bit_timing", IflaCan::BitTiming, timing)
    }

    fn bit_timing(&self) -> Result<BitTiming, CanError> {
        self.link_payload("get bit_timing", |p| can_attr::<BitTiming>(p, IflaCan::BitTiming))
    }

    fn device_stats(&self) -> Result<DeviceStats, CanError> {
        self.link_payload("get stats", |p| {
            let mut attrs = p.rtattrs.get_attr_handle();
            let attr = attrs.get_attribute(Ifla::Stats)?;
            read_struct(attr.rta_payload.as_ref())
        })
    }

    fn berr_counter(&self) -> Result<BerrCounter, CanError> {
        self.link_payload("get berr_counter", |p| can_attr::<BerrCounter>(p, IflaCan::BerrCounter))
    }
}

/// No-op [`LinkOps`] for virtual or externally managed interfaces.
///
/// Setters record the written value and getters answer with it, so a
/// verified configuration round-trips cleanly without touching netlink.
/// Useful for vcan interfaces, which reject controller attributes.
#[derive(Default)]
pub struct UnmanagedLink {
    written: Mutex<WrittenValues>,
}

#[derive(Default)]
struct WrittenValues {
    bitrate: u32,
    dbitrate: u32,
    restart_ms: u32,
    ctrl_mode: CtrlModeFlags,
    bit_timing: BitTiming,
}

impl UnmanagedLink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkOps for UnmanagedLink {
    fn start(&self) -> Result<(), CanError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), CanError> {
        Ok(())
    }

    fn restart(&self) -> Result<(), CanError> {
        Ok(())
    }

    fn state(&self) -> Result<CanState, CanError> {
        Ok(CanState::ErrorActive)
    }

    fn set_bitrate(&self, bitrate: u32) -> Result<(), CanError> {
        self.written.lock()?.bitrate = bitrate;
        Ok(())
    }

    fn bitrate(&self) -> Result<u32, CanError> {
        Ok(self.written.lock()?.bitrate)
    }

    fn set_data_bitrate(&self, dbitrate: u32) -> Result<(), CanError> {
        self.written.lock()?.dbitrate = dbitrate;
        Ok(())
    }

    fn data_bitrate(&self) -> Result<u32, CanError> {
        Ok(self.written.lock()?.dbitrate)
    }

    fn set_restart_ms(&self, restart_ms: u32) -> Result<(), CanError> {
        self.written.lock()?.restart_ms = restart_ms;
        Ok(())
    }

    fn restart_ms(&self) -> Result<u32, CanError> {
        Ok(self.written.lock()?.restart_ms)
    }

    fn set_ctrl_mode(&self, mode: CtrlMode) -> Result<(), CanError> {
        let mut written = self.written.lock()?;
        written.ctrl_mode = (written.ctrl_mode & !mode.mask) | (mode.flags & mode.mask);
        Ok(())
    }

    fn ctrl_mode(&self) -> Result<CtrlModeFlags, CanError> {
        Ok(self.written.lock()?.ctrl_mode)
    }

    fn set_bit_timing(&self, timing: &BitTiming) -> Result<(), CanError> {
        self.written.lock()?.bit_timing = *timing;
        Ok(())
    }

    fn bit_timing(&self) -> Result<BitTiming, CanError> {
        Ok(self.written.lock()?.bit_timing)
    }

    fn device_stats(&self) -> Result<DeviceStats, CanError> {
        Ok(DeviceStats::default())
    }

    fn berr_counter(&self) -> Result<BerrCounter, CanError> {
        Ok(BerrCounter::default())
    }
}
