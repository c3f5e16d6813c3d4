use can_core::{CanError, CanErrorMask, CanFrame, Id};

#[test]
fn test_frame_classification() {
    let classic = CanFrame::new(0x123u32, &[0u8; 8]).unwrap();
    assert!(!classic.is_can_fd());
    assert_eq!(classic.dlc(), 8);

    let fd = CanFrame::new(0x123u32, &[0u8; 9]).unwrap();
    assert!(fd.is_can_fd());
    assert_eq!(fd.dlc(), 9);
    assert_eq!(fd.length(), 9);

    assert!(CanFrame::new(0x123u32, &[0u8; 65]).is_none());
}

#[test]
fn test_frame_id_classification() {
    let frame = CanFrame::new(0x123u32, &[1, 2]).unwrap();
    assert!(!frame.is_extended());
    assert_eq!(frame.id(), Id::Standard(0x123));

    let frame = CanFrame::new(0x1234_5678u32, &[1, 2]).unwrap();
    assert!(frame.is_extended());
    assert_eq!(frame.id().as_raw(), 0x1234_5678 & 0x1FFF_FFFF);
}

#[test]
fn test_remote_frame() {
    let frame = CanFrame::new_remote(0x7FFu32, 4).unwrap();
    assert!(frame.is_remote());
    assert_eq!(frame.length(), 4);
    assert!(CanFrame::new_remote(0x7FFu32, 9).is_none());
}

#[test]
fn test_fd_downgrade_truncates() {
    let mut frame = CanFrame::new(0x100u32, &[0xAA; 12]).unwrap();
    frame.set_can_fd(false);
    assert!(!frame.is_can_fd());
    assert_eq!(frame.length(), 8);
}

#[test]
fn test_standard_id_of_extended() {
    let id = Id::new_extended(0x18DA_F101);
    assert_eq!(id.standard_id(), Id::Standard((0x18DA_F101u32 >> 18) as u16));
}

#[test]
fn test_default_error_classes() {
    let classes = CanErrorMask::default_classes();
    assert!(classes.contains(CanErrorMask::TX_TIMEOUT));
    assert!(classes.contains(CanErrorMask::CRTL));
    assert!(classes.contains(CanErrorMask::BUSOFF));
    assert!(classes.contains(CanErrorMask::BUSERROR));
    assert!(classes.contains(CanErrorMask::RESTARTED));
    assert!(!classes.contains(CanErrorMask::LOSTARB));
}

#[test]
fn test_error_strings() {
    assert_eq!(CanError::TxRetryLater.to_string(), "MUXCAN - TX retry later");
    assert_eq!(
        CanError::ReadbackMismatch { attr: "bitrate" }.to_string(),
        "MUXCAN - bitrate value set does not match value read"
    );
    assert_eq!(CanError::DroppedFrames(5).to_string(), "MUXCAN - 5 frames dropped");
}
