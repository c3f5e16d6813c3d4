use bitflags::bitflags;

/// Mask for standard identifiers.
pub const SFF_MASK: u32 = 0x0000_07FF;
/// Mask for extended identifiers.
pub const EFF_MASK: u32 = 0x1FFF_FFFF;
/// Mask for error identifiers.
pub const ERR_MASK: u32 = 0x1FFF_FFFF;

bitflags! {
    /// Identifier flags for indicating various frame types.
    ///
    /// Flag values correspond to the format used by the Linux SocketCAN
    /// stack, so the all-in-one 32-bit identifier handed to the kernel can
    /// be assembled without further translation.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct IdentifierFlags: u32 {
        /// The frame is using the extended format i.e. 29-bit extended identifiers.
        const EXTENDED = 0x8000_0000;
        /// The frame is a remote transmission request.
        const REMOTE = 0x4000_0000;
        /// The frame is an error frame.
        const ERROR = 0x2000_0000;
    }
}

/// CAN acceptance filter element.
///
/// A received frame matches when `received_id & can_mask == can_id & can_mask`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Filter {
    pub can_id: u32,
    pub can_mask: u32,
    pub extended: bool,
}

impl Filter {
    #[inline]
    pub fn new(can_id: u32, can_mask: u32) -> Self {
        Self { can_id, can_mask, extended: false }
    }

    #[inline]
    pub fn new_extended(can_id: u32, can_mask: u32) -> Self {
        Self { can_id, can_mask, extended: true }
    }
}

/// CAN-Id define
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Id {
    Standard(u16),
    Extended(u32),
}

impl From<u32> for Id {
    #[inline]
    fn from(value: u32) -> Self {
        Self::from_bits(value, None)
    }
}

impl From<Id> for u32 {
    #[inline]
    fn from(id: Id) -> u32 {
        id.into_bits()
    }
}

impl Id {
    #[inline]
    pub fn new_standard(id: u16) -> Self {
        Self::Standard(id)
    }

    #[inline]
    pub fn new_extended(id: u32) -> Self {
        Self::Extended(id & EFF_MASK)
    }

    #[inline]
    pub fn from_bits(bits: u32, force_extend: Option<bool>) -> Self {
        match force_extend {
            Some(true) => Self::new_extended(bits),
            _ => {
                if bits & !SFF_MASK & EFF_MASK != 0 {
                    Self::new_extended(bits)
                } else {
                    Self::new_standard((bits & SFF_MASK) as u16)
                }
            }
        }
    }

    #[inline]
    pub fn into_bits(self) -> u32 {
        match self {
            Self::Standard(id) => id as u32,
            Self::Extended(id) => id,
        }
    }

    /// Returns this CAN Identifier as a raw 32-bit integer.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.into_bits()
    }

    /// Returns the Base ID part of this extended identifier.
    #[inline]
    pub fn standard_id(self) -> Self {
        match self {
            Self::Standard(_) => self,
            Self::Extended(v) => Self::Standard((v >> 18) as u16), // ID-28 to ID-18
        }
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Extended(_))
    }
}
