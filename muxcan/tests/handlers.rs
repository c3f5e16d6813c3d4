use muxcan::{CanError, CanFrame, CanInterface, UnmanagedLink};

#[test]
fn test_error_handler_registry() {
    let iface = CanInterface::request_with_link("vcan9", Box::new(UnmanagedLink::new()));

    iface.register_error_handler("app", |_| {}).unwrap();
    let err = iface.register_error_handler("app", |_| {}).unwrap_err();
    assert_eq!(err, CanError::AlreadyRegistered("app".to_string()));

    let err = iface.unregister_error_handler("missing").unwrap_err();
    assert_eq!(err, CanError::NotFound("missing".to_string()));

    iface.unregister_error_handler("app").unwrap();
}

#[test]
fn test_operations_require_init() {
    let iface = CanInterface::request_with_link("vcan9", Box::new(UnmanagedLink::new()));
    let frame = CanFrame::new(0x123u32, &[0]).unwrap();

    assert_eq!(iface.tx_frame(&frame).unwrap_err(), CanError::NotInitialized);
    assert_eq!(iface.poll_msec(1).unwrap_err(), CanError::NotInitialized);
    assert_eq!(iface.index().unwrap_err(), CanError::NotInitialized);
    assert_eq!(iface.tx_fd().unwrap_err(), CanError::NotInitialized);
    assert_eq!(
        iface.register_rx_handler("h", &[], |_, _| {}).unwrap_err(),
        CanError::NotInitialized
    );
    assert_eq!(iface.rx_socket_count().unwrap(), 0);
}

#[test]
fn test_request_index_names_interface() {
    let iface = CanInterface::request_index(0);
    assert_eq!(iface.name(), "can0");
}
