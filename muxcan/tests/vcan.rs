//! Kernel-backed tests. They need a virtual CAN interface that is up:
//!
//! ```text
//! ip link add dev vcan0 type vcan
//! ip link set up vcan0
//! MUXCAN_TEST_IFACE=vcan0 cargo test
//! ```

use std::sync::mpsc;
use std::time::Duration;

use muxcan::{CanConfig, CanError, CanFrame, CanInterface, Filter, UnmanagedLink};

fn iface_name() -> Option<String> {
    std::env::var("MUXCAN_TEST_IFACE").ok()
}

fn open_polled(name: &str) -> anyhow::Result<CanInterface> {
    let mut iface = CanInterface::request_with_link(name, Box::new(UnmanagedLink::new()));
    let cfg = CanConfig { polled_mode: true, ..CanConfig::default() };
    iface.init(cfg)?;
    Ok(iface)
}

#[test]
fn test_loopback_round_trip() -> anyhow::Result<()> {
    let Some(name) = iface_name() else {
        eprintln!("skipping: set MUXCAN_TEST_IFACE to an up vcan interface");
        return Ok(());
    };
    let mut iface = open_polled(&name)?;
    assert!(iface.index()? > 0);

    let (sender, receiver) = mpsc::channel();
    iface.register_rx_handler("loopback", &[Filter::new(0x100, 0x7FF)], move |frame, ts| {
        let _ = sender.send((frame.clone(), ts));
    })?;

    let frame = CanFrame::new(0x100u32, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    iface.tx_frame(&frame)?;

    let mut received = None;
    for _ in 0..50 {
        iface.poll_msec(100)?;
        if let Ok(pair) = receiver.try_recv() {
            received = Some(pair);
            break;
        }
    }
    let (received, timestamp_us) = received.expect("no frame received");
    assert_eq!(received.id().as_raw(), 0x100);
    assert_eq!(received.data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    // process_header is on by default, so a software timestamp is attached
    assert!(timestamp_us > 0);

    iface.close()?;
    Ok(())
}

#[test]
fn test_duplicate_rx_handler_rejected() -> anyhow::Result<()> {
    let Some(name) = iface_name() else {
        eprintln!("skipping: set MUXCAN_TEST_IFACE to an up vcan interface");
        return Ok(());
    };
    let iface = open_polled(&name)?;

    iface.register_rx_handler("dup", &[Filter::new(0x100, 0x7FF)], |_, _| {})?;
    let err = iface
        .register_rx_handler("dup", &[Filter::new(0x200, 0x7FF)], |_, _| {})
        .unwrap_err();
    assert_eq!(err, CanError::AlreadyRegistered("dup".to_string()));
    assert_eq!(iface.rx_socket_count()?, 1);

    iface.unregister_rx_handler("dup")?;
    assert_eq!(iface.rx_socket_count()?, 0);
    assert_eq!(
        iface.unregister_rx_handler("dup").unwrap_err(),
        CanError::NotFound("dup".to_string())
    );
    Ok(())
}

#[test]
fn test_poll_one_reads_single_event() -> anyhow::Result<()> {
    let Some(name) = iface_name() else {
        eprintln!("skipping: set MUXCAN_TEST_IFACE to an up vcan interface");
        return Ok(());
    };
    let iface = open_polled(&name)?;
    let fd = iface.open_rx_socket(&[Filter::new(0x42, 0x7FF)])?;

    iface.tx_frame(&CanFrame::new(0x42u32, &[1]).unwrap())?;
    iface.tx_frame(&CanFrame::new(0x42u32, &[2]).unwrap())?;

    let evt = iface.poll_one(Duration::from_secs(2))?.expect("first event");
    assert!(evt.is_rx);
    assert!(!evt.is_error);
    assert_eq!(evt.endpoint, fd);
    assert_eq!(evt.frame.id().as_raw(), 0x42);
    assert_eq!(evt.dropped_frames, 0);

    let evt = iface.poll_one(Duration::from_secs(2))?.expect("second event");
    assert_eq!(evt.frame.data(), &[2]);

    iface.close_rx_socket(fd)?;
    assert_eq!(iface.rx_socket_count()?, 0);
    Ok(())
}

#[test]
fn test_driver_thread_dispatches() -> anyhow::Result<()> {
    let Some(name) = iface_name() else {
        eprintln!("skipping: set MUXCAN_TEST_IFACE to an up vcan interface");
        return Ok(());
    };
    let mut iface = CanInterface::request_with_link(&name, Box::new(UnmanagedLink::new()));
    iface.init(CanConfig::default())?;
    iface.set_thread_poll_rate_msec(100)?;

    let (sender, receiver) = mpsc::channel();
    iface.register_rx_handler("threaded", &[Filter::new(0x321, 0x7FF)], move |frame, _| {
        let _ = sender.send(frame.clone());
    })?;

    iface.tx_frame(&CanFrame::new(0x321u32, &[7, 7]).unwrap())?;

    let received = receiver.recv_timeout(Duration::from_secs(5)).expect("no frame dispatched");
    assert_eq!(received.id().as_raw(), 0x321);
    assert_eq!(received.data(), &[7, 7]);

    iface.close()?;
    Ok(())
}

#[test]
fn test_unfiltered_rx_socket_accepts_everything() -> anyhow::Result<()> {
    let Some(name) = iface_name() else {
        eprintln!("skipping: set MUXCAN_TEST_IFACE to an up vcan interface");
        return Ok(());
    };
    let iface = open_polled(&name)?;
    let _fd = iface.open_rx_socket(&[])?;

    iface.tx_frame(&CanFrame::new(0x7DFu32, &[0x02, 0x01, 0x0C]).unwrap())?;

    let evt = iface.poll_one(Duration::from_secs(2))?.expect("event");
    assert_eq!(evt.frame.id().as_raw(), 0x7DF);
    Ok(())
}
