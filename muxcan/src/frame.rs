//! Conversion between the wire frames at the socket boundary and [`CanFrame`].

use std::{mem, ptr};

use can_core::{utils, CanError, CanFrame, Id, IdentifierFlags, EFF_MASK, MAX_FRAME_SIZE, MAX_FD_FRAME_SIZE};

pub(crate) const FRAME_SIZE: usize = mem::size_of::<libc::can_frame>();
pub(crate) const FD_FRAME_SIZE: usize = mem::size_of::<libc::canfd_frame>();

/// Bitrate-switch flag of `canfd_frame.flags`.
const CANFD_BRS: u8 = 0x01;
/// Error-state-indicator flag of `canfd_frame.flags`.
const CANFD_ESI: u8 = 0x02;

pub(crate) fn can_frame_default() -> libc::can_frame {
    unsafe { mem::zeroed() }
}

pub(crate) fn canfd_frame_default() -> libc::canfd_frame {
    unsafe { mem::zeroed() }
}

#[derive(Debug)]
pub(crate) enum RawFrame {
    Classic(libc::can_frame),
    Fd(libc::canfd_frame),
}

impl RawFrame {
    pub(crate) fn size(&self) -> usize {
        match self {
            RawFrame::Classic(_) => FRAME_SIZE,
            RawFrame::Fd(_) => FD_FRAME_SIZE,
        }
    }

    /// Classify a received datagram by its byte count.
    pub(crate) fn from_buffer(buf: &[u8], nbytes: usize) -> Option<Self> {
        match nbytes {
            FRAME_SIZE => {
                let frame = unsafe { ptr::read_unaligned(buf.as_ptr() as *const libc::can_frame) };
                Some(RawFrame::Classic(frame))
            }
            FD_FRAME_SIZE => {
                let frame = unsafe { ptr::read_unaligned(buf.as_ptr() as *const libc::canfd_frame) };
                Some(RawFrame::Fd(frame))
            }
            _ => None,
        }
    }

    /// Decode into the owned frame record.
    pub(crate) fn decode(&self) -> Option<CanFrame> {
        match self {
            RawFrame::Classic(f) => {
                let extended = f.can_id & IdentifierFlags::EXTENDED.bits() != 0;
                let id = Id::from_bits(f.can_id & EFF_MASK, Some(extended));
                let len = (f.can_dlc as usize).min(MAX_FRAME_SIZE);
                if f.can_id & IdentifierFlags::REMOTE.bits() != 0 {
                    return CanFrame::new_remote(id, len);
                }
                let mut frame = CanFrame::new(id, &f.data[..len])?;
                frame.set_error_frame(f.can_id & IdentifierFlags::ERROR.bits() != 0);
                Some(frame)
            }
            RawFrame::Fd(f) => {
                let extended = f.can_id & IdentifierFlags::EXTENDED.bits() != 0;
                let id = Id::from_bits(f.can_id & EFF_MASK, Some(extended));
                let len = (f.len as usize).min(MAX_FD_FRAME_SIZE);
                let mut frame = CanFrame::new(id, &f.data[..len])?;
                frame
                    .set_can_fd(true)
                    .set_bitrate_switch(f.flags & CANFD_BRS != 0)
                    .set_esi(f.flags & CANFD_ESI != 0);
                Some(frame)
            }
        }
    }

    /// Encode for transmission at the framing the interface is configured
    /// for. FD framing pads the payload up to the sanitized wire length.
    pub(crate) fn encode(frame: &CanFrame, fd_mode: bool) -> Result<Self, CanError> {
        let can_id = encode_id(frame);
        if fd_mode {
            let mut raw = canfd_frame_default();
            raw.can_id = can_id;
            raw.data[..frame.length()].copy_from_slice(frame.data());
            raw.len = utils::sanitize_fd_len(frame.length()) as u8;
            if frame.is_bitrate_switch() {
                raw.flags |= CANFD_BRS;
            }
            if frame.is_esi() {
                raw.flags |= CANFD_ESI;
            }
            Ok(RawFrame::Fd(raw))
        } else {
            if frame.length() > MAX_FRAME_SIZE {
                return Err(CanError::NotCanFd);
            }
            let mut raw = can_frame_default();
            raw.can_id = can_id;
            raw.can_dlc = frame.length() as u8;
            if !frame.is_remote() {
                raw.data[..frame.length()].copy_from_slice(frame.data());
            }
            Ok(RawFrame::Classic(raw))
        }
    }
}

fn encode_id(frame: &CanFrame) -> u32 {
    let mut can_id = frame.id().as_raw();
    if frame.is_extended() {
        can_id |= IdentifierFlags::EXTENDED.bits();
    }
    if frame.is_remote() {
        can_id |= IdentifierFlags::REMOTE.bits();
    }
    if frame.is_error_frame() {
        can_id |= IdentifierFlags::ERROR.bits();
    }
    can_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_classic() {
        let frame = CanFrame::new(0x123u32, &[1, 2, 3]).unwrap();
        let raw = RawFrame::encode(&frame, false).unwrap();
        assert_eq!(raw.size(), FRAME_SIZE);
        assert_eq!(raw.decode().unwrap(), frame);
    }

    #[test]
    fn test_encode_fd_pads_to_sanitized_length() {
        let frame = CanFrame::new(0x123u32, &[0xAA; 9]).unwrap();
        match RawFrame::encode(&frame, true).unwrap() {
            RawFrame::Fd(f) => {
                assert_eq!(f.len, 12);
                assert_eq!(&f.data[..9], &[0xAA; 9]);
                assert_eq!(&f.data[9..12], &[0; 3]);
            }
            RawFrame::Classic(_) => panic!("expected FD framing"),
        }
    }

    #[test]
    fn test_encode_rejects_fd_payload_without_fd_mode() {
        let frame = CanFrame::new(0x123u32, &[0u8; 12]).unwrap();
        assert_eq!(RawFrame::encode(&frame, false).unwrap_err(), CanError::NotCanFd);
    }

    #[test]
    fn test_decode_error_frame_keeps_class_bits() {
        let mut f = can_frame_default();
        f.can_id = 0x0000_0044 | IdentifierFlags::ERROR.bits();
        f.can_dlc = 8;
        let frame = RawFrame::Classic(f).decode().unwrap();
        assert!(frame.is_error_frame());
        assert_eq!(frame.id().as_raw(), 0x44);
    }

    #[test]
    fn test_from_buffer_rejects_odd_sizes() {
        let buf = [0u8; FD_FRAME_SIZE];
        assert!(RawFrame::from_buffer(&buf, FRAME_SIZE).is_some());
        assert!(RawFrame::from_buffer(&buf, FD_FRAME_SIZE).is_some());
        assert!(RawFrame::from_buffer(&buf, 7).is_none());
    }
}
