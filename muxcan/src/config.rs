//! Per-interface configuration.

use bitflags::bitflags;
use can_core::CanErrorMask;

bitflags! {
    /// Controller mode bits, as understood by the kernel CAN layer.
    #[repr(transparent)]
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct CtrlModeFlags: u32 {
        /// Loopback mode.
        const LOOPBACK = 0x01;
        /// Listen-only mode.
        const LISTEN_ONLY = 0x02;
        /// Triple sampling mode.
        const TRIPLE_SAMPLING = 0x04;
        /// One-shot mode.
        const ONE_SHOT = 0x08;
        /// Bus-error reporting.
        const BERR_REPORTING = 0x10;
        /// CAN FD mode.
        const FD = 0x20;
        /// Ignore missing CAN ACKs.
        const PRESUME_ACK = 0x40;
        /// CAN FD in non-ISO mode.
        const FD_NON_ISO = 0x80;
    }
}

/// Controller mode request: `flags` gives the desired value of every bit
/// selected by `mask`; unselected bits keep their current state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CtrlMode {
    pub mask: CtrlModeFlags,
    pub flags: CtrlModeFlags,
}

impl CtrlMode {
    /// Request that exactly the given modes are enabled.
    #[inline]
    pub fn enable(flags: CtrlModeFlags) -> Self {
        Self { mask: flags, flags }
    }
}

/// Bit-timing parameters, mirroring the kernel `can_bittiming` layout.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct BitTiming {
    pub bitrate: u32,
    pub sample_point: u32,
    pub tq: u32,
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    pub sjw: u32,
    pub brp: u32,
}

/// Interface configuration applied by [`crate::CanInterface::init`].
///
/// `None` on the netlink-backed options means "leave as set externally".
#[derive(Debug, Clone)]
pub struct CanConfig {
    /// Read every link setting back after writing it and compare.
    pub nl_cmd_verify: bool,
    /// 64-byte payload semantics on every endpoint of the interface.
    pub canfd_enabled: bool,
    /// Parse ancillary control messages on receive.
    pub process_header: bool,
    /// Request raw hardware timestamps instead of software timestamps.
    /// Only honored together with `process_header`.
    pub hw_timestamp: bool,
    /// Nominal bitrate.
    pub bitrate: Option<u32>,
    /// Data-phase bitrate for CAN FD.
    pub dbitrate: Option<u32>,
    /// Automatic bus-off recovery period in milliseconds.
    pub restart_ms: Option<u32>,
    /// Controller mode request.
    pub ctrl_mode: Option<CtrlMode>,
    /// Full bit-timing parameters.
    pub bit_timing: Option<BitTiming>,
    /// Error classes delivered to user space as error frames.
    pub error_mask: CanErrorMask,
    /// Do not start the reactor thread; the caller pumps explicitly.
    pub polled_mode: bool,
    /// Kernel send-buffer size for the TX endpoint, 0 keeps the default.
    pub tx_buf_len: u32,
    /// Kernel receive-buffer size for RX endpoints, 0 keeps the default.
    pub rx_buf_len: u32,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            nl_cmd_verify: true,
            canfd_enabled: false,
            process_header: true,
            hw_timestamp: false,
            bitrate: None,
            dbitrate: None,
            restart_ms: None,
            ctrl_mode: None,
            bit_timing: None,
            error_mask: CanErrorMask::default_classes(),
            // historically the driver thread is on by default
            polled_mode: false,
            tx_buf_len: 0,
            rx_buf_len: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CanConfig::default();
        assert!(cfg.nl_cmd_verify);
        assert!(!cfg.canfd_enabled);
        assert!(cfg.process_header);
        assert!(!cfg.hw_timestamp);
        assert_eq!(cfg.bitrate, None);
        assert_eq!(cfg.dbitrate, None);
        assert_eq!(cfg.restart_ms, None);
        assert_eq!(cfg.ctrl_mode, None);
        assert_eq!(cfg.bit_timing, None);
        assert_eq!(cfg.error_mask, CanErrorMask::default_classes());
        assert!(!cfg.polled_mode);
        assert_eq!(cfg.tx_buf_len, 0);
        assert_eq!(cfg.rx_buf_len, 0);
    }

    #[test]
    fn test_ctrl_mode_enable() {
        let mode = CtrlMode::enable(CtrlModeFlags::LOOPBACK | CtrlModeFlags::LISTEN_ONLY);
        assert_eq!(mode.mask, mode.flags);
        assert!(mode.mask.contains(CtrlModeFlags::LOOPBACK));
    }
}
