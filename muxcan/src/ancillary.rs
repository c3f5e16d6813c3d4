//! Decoding of the control messages attached to a received datagram.

use nix::sys::socket::ControlMessageOwned;

/// Out-of-band data carried with one received frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AncillaryData {
    /// Receive timestamp in microseconds, 0 when none was attached.
    pub(crate) timestamp_us: u64,
    /// Kernel drop counter since the socket was opened.
    pub(crate) rx_overflow: Option<u32>,
}

/// Fold a control-message chain into timestamp and overflow data.
///
/// Software timestamps arrive as a classic timeval; hardware-capable
/// timestamping delivers the kernel triple, of which only the raw hardware
/// stamp (index 2 of the kernel layout) is meaningful here. Unknown
/// messages are skipped.
pub(crate) fn decode<I>(cmsgs: I) -> AncillaryData
where
    I: IntoIterator<Item = ControlMessageOwned>,
{
    let mut out = AncillaryData::default();
    for cmsg in cmsgs {
        match cmsg {
            ControlMessageOwned::RxqOvfl(count) => out.rx_overflow = Some(count),
            ControlMessageOwned::ScmTimestamp(tv) => {
                out.timestamp_us = tv.tv_sec() as u64 * 1_000_000 + tv.tv_usec() as u64;
            }
            ControlMessageOwned::ScmTimestampsns(stamps) => {
                let raw = stamps.hw_raw;
                out.timestamp_us = raw.tv_sec() as u64 * 1_000_000 + raw.tv_nsec() as u64 / 1_000;
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::Timestamps;
    use nix::sys::time::{TimeSpec, TimeVal};

    #[test]
    fn test_software_timestamp() {
        let anc = decode([ControlMessageOwned::ScmTimestamp(TimeVal::new(10, 250))]);
        assert_eq!(anc.timestamp_us, 10_000_250);
        assert_eq!(anc.rx_overflow, None);
    }

    #[test]
    fn test_hardware_timestamp_takes_raw_element() {
        let stamps = Timestamps {
            system: TimeSpec::new(10, 0),
            hw_trans: TimeSpec::new(0, 0),
            hw_raw: TimeSpec::new(42, 750_000_000),
        };
        let anc = decode([ControlMessageOwned::ScmTimestampsns(stamps)]);
        assert_eq!(anc.timestamp_us, 42_750_000);
    }

    #[test]
    fn test_overflow_counter() {
        let anc = decode([ControlMessageOwned::RxqOvfl(5)]);
        assert_eq!(anc.rx_overflow, Some(5));
        assert_eq!(anc.timestamp_us, 0);
    }

    #[test]
    fn test_empty_chain() {
        let anc = decode(std::iter::empty());
        assert_eq!(anc, AncillaryData::default());
    }
}
