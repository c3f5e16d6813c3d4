use crate::identifier::Id;
use crate::utils;

/// The max sizeof classic can-frame data.
pub const MAX_FRAME_SIZE: usize = 8;
/// The max sizeof can-fd frame data.
pub const MAX_FD_FRAME_SIZE: usize = 64;

/// Owned CAN/CAN-FD frame record.
///
/// Constructors classify the frame from the payload length: up to 8 bytes
/// makes a classic frame, up to 64 a CAN-FD frame, anything longer is
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    arbitration_id: u32,
    extended: bool,
    remote: bool,
    error: bool,
    fd: bool,
    bitrate_switch: bool,
    error_state_indicator: bool,
    data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let fd = match data.len() {
            ..=MAX_FRAME_SIZE => false,
            ..=MAX_FD_FRAME_SIZE => true,
            _ => return None,
        };
        let id: Id = id.into();
        Some(Self {
            arbitration_id: id.as_raw(),
            extended: id.is_extended(),
            remote: false,
            error: false,
            fd,
            bitrate_switch: false,
            error_state_indicator: false,
            data: data.to_vec(),
        })
    }

    /// Remote transmission request: a classic frame carrying a length but
    /// no payload bytes.
    pub fn new_remote(id: impl Into<Id>, len: usize) -> Option<Self> {
        if len > MAX_FRAME_SIZE {
            return None;
        }
        let id: Id = id.into();
        Some(Self {
            arbitration_id: id.as_raw(),
            extended: id.is_extended(),
            remote: true,
            error: false,
            fd: false,
            bitrate_switch: false,
            error_state_indicator: false,
            data: vec![0; len],
        })
    }

    #[inline]
    pub fn id(&self) -> Id {
        Id::from_bits(self.arbitration_id, Some(self.extended))
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    #[inline]
    pub fn is_can_fd(&self) -> bool {
        self.fd
    }

    #[inline]
    pub fn set_can_fd(&mut self, value: bool) -> &mut Self {
        if !value && self.data.len() > MAX_FRAME_SIZE {
            log::warn!("MUXCAN - resize a fd-frame to: {}", MAX_FRAME_SIZE);
            self.data.truncate(MAX_FRAME_SIZE);
        }
        self.fd = value;
        self
    }

    #[inline]
    pub fn is_error_frame(&self) -> bool {
        self.error
    }

    #[inline]
    pub fn set_error_frame(&mut self, value: bool) -> &mut Self {
        self.error = value;
        self
    }

    #[inline]
    pub fn is_bitrate_switch(&self) -> bool {
        self.bitrate_switch
    }

    #[inline]
    pub fn set_bitrate_switch(&mut self, value: bool) -> &mut Self {
        self.bitrate_switch = value;
        self
    }

    /// Error state indicator
    #[inline]
    pub fn is_esi(&self) -> bool {
        self.error_state_indicator
    }

    /// Set error state indicator
    #[inline]
    pub fn set_esi(&mut self, value: bool) -> &mut Self {
        self.error_state_indicator = value;
        self
    }

    /// ensure return the actual length of data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn dlc(&self) -> u8 {
        if self.fd {
            utils::len_to_dlc(self.data.len())
        } else {
            self.data.len() as u8
        }
    }
}
