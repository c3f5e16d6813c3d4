use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Classes of link-level error frames, matching the class bits carried
    /// in the identifier of a kernel error frame.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct CanErrorMask: u32 {
        /// TX timeout reported by the device driver.
        const TX_TIMEOUT = 0x0000_0001;
        /// Lost arbitration.
        const LOSTARB = 0x0000_0002;
        /// Controller problems.
        const CRTL = 0x0000_0004;
        /// Protocol violations.
        const PROT = 0x0000_0008;
        /// Transceiver status.
        const TRX = 0x0000_0010;
        /// Received no ACK on transmission.
        const ACK = 0x0000_0020;
        /// Bus off.
        const BUSOFF = 0x0000_0040;
        /// Bus error, may flood on a broken bus.
        const BUSERROR = 0x0000_0080;
        /// Controller restarted.
        const RESTARTED = 0x0000_0100;
    }
}

impl CanErrorMask {
    /// Classes delivered to user space when nothing else is configured.
    #[inline]
    pub fn default_classes() -> Self {
        Self::TX_TIMEOUT | Self::CRTL | Self::BUSOFF | Self::BUSERROR | Self::RESTARTED
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanError {
    /// The operation needs an initialized interface.
    #[error("MUXCAN - interface is not initialized")]
    NotInitialized,
    #[error("MUXCAN - interface index error on {0}")]
    InterfaceIndex(String),

    /// A link-configuration command failed.
    #[error("MUXCAN - netlink {op} error: {reason}")]
    Netlink { op: &'static str, reason: String },
    /// A verified link setting read back a different value than was written.
    #[error("MUXCAN - {attr} value set does not match value read")]
    ReadbackMismatch { attr: &'static str },

    #[error("MUXCAN - tx socket create error: {0}")]
    TxSocketCreate(String),
    #[error("MUXCAN - tx socket bind error: {0}")]
    TxSocketBind(String),
    #[error("MUXCAN - tx socket write error: {0}")]
    TxSocketWrite(String),
    #[error("MUXCAN - rx socket create error: {0}")]
    RxSocketCreate(String),
    #[error("MUXCAN - rx socket bind error: {0}")]
    RxSocketBind(String),

    #[error("MUXCAN - setsockopt {opt} error: {reason}")]
    SocketOption { opt: &'static str, reason: String },
    #[error("MUXCAN - getsockopt {opt} error: {reason}")]
    SocketOptionRead { opt: &'static str, reason: String },

    /// The transmit queue is full; try again later.
    #[error("MUXCAN - TX retry later")]
    TxRetryLater,
    /// Fewer bytes than one full frame went out.
    #[error("MUXCAN - incomplete TX frame")]
    IncompleteFrame,

    #[error("MUXCAN - CAN network is down")]
    NetworkDown,
    /// The kernel dropped frames on a receive queue.
    #[error("MUXCAN - {0} frames dropped")]
    DroppedFrames(u32),
    /// The interface MTU does not allow CAN FD framing.
    #[error("MUXCAN - CAN FD mtu not supported")]
    NotCanFd,
    /// A link-level error frame, carrying its error classes.
    #[error("MUXCAN - error frame: {0:?}")]
    ErrorFrame(CanErrorMask),

    #[error("MUXCAN - handler already registered: {0}")]
    AlreadyRegistered(String),
    #[error("MUXCAN - handler not found: {0}")]
    NotFound(String),

    #[error("MUXCAN - readiness wait error: {0}")]
    Poll(String),
    #[error("MUXCAN - interface mutex poisoned")]
    MutexPoisoned,
    #[error("MUXCAN - reactor thread create error: {0}")]
    ThreadCreate(String),
}

impl CanError {
    #[inline]
    pub fn netlink(op: &'static str, reason: impl ToString) -> Self {
        Self::Netlink { op, reason: reason.to_string() }
    }

    #[inline]
    pub fn sockopt(opt: &'static str, reason: impl ToString) -> Self {
        Self::SocketOption { opt, reason: reason.to_string() }
    }

    #[inline]
    pub fn sockopt_read(opt: &'static str, reason: impl ToString) -> Self {
        Self::SocketOptionRead { opt, reason: reason.to_string() }
    }
}

impl<T> From<std::sync::PoisonError<T>> for CanError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::MutexPoisoned
    }
}
