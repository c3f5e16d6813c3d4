//! Readiness waiting, endpoint draining and event dispatch.
//!
//! The kernel wait runs on a snapshot of the descriptor set taken under the
//! interface lock; the lock itself is released for the duration of the
//! wait, so handler registration never blocks behind a sleeping reactor.
//! Membership is checked again after the wait, since an endpoint may have
//! been closed while it was in flight.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use can_core::{CanError, CanErrorMask};

use crate::endpoint::CanEvent;
use crate::iface::{ErrorHandler, Shared, State};

/// Wait for readiness on the snapshotted descriptor set.
/// An interrupted wait reports an empty ready set.
fn wait_ready(fds: &[RawFd], timeout: Duration) -> Result<Vec<RawFd>, CanError> {
    let mut pollfds: Vec<PollFd> = fds
        .iter()
        .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
        .collect();
    let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
    match poll(&mut pollfds, PollTimeout::from(timeout_ms)) {
        Ok(0) => Ok(Vec::new()),
        Ok(_) => Ok(pollfds
            .iter()
            .zip(fds)
            .filter(|(pollfd, _)| {
                pollfd
                    .revents()
                    .map_or(false, |r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
            })
            .map(|(_, &fd)| fd)
            .collect()),
        Err(Errno::EINTR) => Ok(Vec::new()),
        Err(e) => Err(CanError::Poll(e.to_string())),
    }
}

/// The watched descriptors: RX endpoints in registration order, TX last.
fn watch_set(st: &State) -> Vec<RawFd> {
    let mut fds: Vec<RawFd> = st.rx.iter().map(|endpoint| endpoint.fd()).collect();
    if let Some(tx) = &st.tx {
        fds.push(tx.fd());
    }
    fds
}

pub(crate) fn call_error_handlers(handlers: &[ErrorHandler], err: &CanError) {
    for handler in handlers {
        (handler.callback)(err);
    }
}

/// Apply the dispatch rules for one event.
///
/// An error event goes to every error handler, exactly once. A data event
/// first reports a non-zero drop delta to the error handlers, then reaches
/// the RX handlers whose endpoint matches.
pub(crate) fn dispatch(st: &State, evt: &CanEvent) {
    if evt.is_error {
        let class = CanErrorMask::from_bits_truncate(evt.frame.id().as_raw());
        call_error_handlers(&st.err_handlers, &CanError::ErrorFrame(class));
    } else if evt.is_rx {
        if evt.dropped_frames != 0 {
            call_error_handlers(&st.err_handlers, &CanError::DroppedFrames(evt.dropped_frames));
        }
        for handler in st.rx_handlers.iter().filter(|h| h.endpoint == evt.endpoint) {
            (handler.callback)(&evt.frame, evt.timestamp_us);
        }
    }
}

/// Drain one ready RX endpoint: receive until nothing is pending,
/// dispatching every event.
fn drain_rx(shared: &Shared, st: &mut State, fd: RawFd) -> Result<(), CanError> {
    loop {
        let (evt, overflow_total) = {
            let endpoint = match st.rx.iter_mut().find(|endpoint| endpoint.fd() == fd) {
                Some(endpoint) => endpoint,
                // closed while the wait was in flight
                None => return Ok(()),
            };
            (endpoint.recv_event()?, endpoint.overflow_total())
        };
        let evt = match evt {
            Some(evt) => evt,
            None => return Ok(()),
        };
        if evt.dropped_frames != 0 {
            shared.dropped_frames.store(overflow_total, Ordering::Relaxed);
        }
        dispatch(st, &evt);
    }
}

/// Drain the TX endpoint, which only ever surfaces error frames.
fn drain_tx(st: &mut State) -> Result<(), CanError> {
    loop {
        let evt = {
            let tx = match st.tx.as_ref() {
                Some(tx) => tx,
                None => return Ok(()),
            };
            tx.recv_event()?
        };
        let evt = match evt {
            Some(evt) => evt,
            None => return Ok(()),
        };
        dispatch(st, &evt);
    }
}

/// One wait-then-drain cycle over every endpoint of the interface.
///
/// `timeout` of `None` uses the interface's configured pump timeout.
pub(crate) fn pump(shared: &Shared, timeout: Option<Duration>) -> Result<(), CanError> {
    let (fds, timeout) = {
        let st = shared.lock()?;
        (watch_set(&st), timeout.unwrap_or(st.poll_timeout))
    };
    if fds.is_empty() {
        return Err(CanError::NotInitialized);
    }

    let ready = match wait_ready(&fds, timeout) {
        Ok(ready) => ready,
        Err(e) => {
            log::error!("MUXCAN - {}: {}", shared.name, e);
            let st = shared.lock()?;
            call_error_handlers(&st.err_handlers, &e);
            return Err(e);
        }
    };
    if ready.is_empty() {
        return Ok(());
    }

    let mut st = shared.lock()?;
    let rx_ready: Vec<RawFd> = st
        .rx
        .iter()
        .map(|endpoint| endpoint.fd())
        .filter(|fd| ready.contains(fd))
        .collect();
    for fd in rx_ready {
        drain_rx(shared, &mut st, fd)?;
    }

    if let Some(tx_fd) = st.tx.as_ref().map(|tx| tx.fd()) {
        if ready.contains(&tx_fd) {
            drain_tx(&mut st)?;
        }
    }
    Ok(())
}

/// Wait and read at most one event, without invoking user handlers.
///
/// The first ready RX endpoint in registration order wins; the TX endpoint
/// is only consulted when no RX endpoint was ready, so callers re-pump to
/// observe it.
pub(crate) fn pump_one(shared: &Shared, timeout: Duration) -> Result<Option<CanEvent>, CanError> {
    let fds = {
        let st = shared.lock()?;
        watch_set(&st)
    };
    if fds.is_empty() {
        return Err(CanError::NotInitialized);
    }

    let ready = wait_ready(&fds, timeout).map_err(|e| {
        log::error!("MUXCAN - {}: {}", shared.name, e);
        e
    })?;
    if ready.is_empty() {
        return Ok(None);
    }

    let mut st = shared.lock()?;
    let rx_fd = st
        .rx
        .iter()
        .map(|endpoint| endpoint.fd())
        .find(|fd| ready.contains(fd));
    if let Some(fd) = rx_fd {
        let (evt, overflow_total) = {
            let endpoint = match st.rx.iter_mut().find(|endpoint| endpoint.fd() == fd) {
                Some(endpoint) => endpoint,
                None => return Ok(None),
            };
            (endpoint.recv_event()?, endpoint.overflow_total())
        };
        if let Some(ref evt) = evt {
            if evt.dropped_frames != 0 {
                shared.dropped_frames.store(overflow_total, Ordering::Relaxed);
            }
        }
        return Ok(evt);
    }

    if let Some(tx) = st.tx.as_ref() {
        if ready.contains(&tx.fd()) {
            return tx.recv_event();
        }
    }
    Ok(None)
}

/// Move the calling thread into the FIFO real-time class where permitted.
fn promote_to_fifo(name: &str) {
    let param = libc::sched_param {
        sched_priority: unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) },
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        log::debug!("MUXCAN - {}: FIFO scheduling not available", name);
    }
}

/// Body of the interface's driver thread.
pub(crate) fn run(shared: Arc<Shared>) {
    promote_to_fifo(&shared.name);
    while shared.run.load(Ordering::SeqCst) {
        if let Err(e) = pump(&shared, None) {
            log::error!("MUXCAN - {}: {}", shared.name, e);
        }
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CanConfig;
    use crate::iface::{ErrorHandler, RxHandler};
    use can_core::CanFrame;
    use std::sync::Mutex;
    use std::time::Duration;

    fn empty_state() -> State {
        State {
            cfg: CanConfig::default(),
            addr: None,
            tx: None,
            rx: Vec::new(),
            rx_handlers: Vec::new(),
            err_handlers: Vec::new(),
            poll_timeout: Duration::from_secs(1),
            tx_buf_granted: 0,
            rx_buf_granted: 0,
            worker: None,
        }
    }

    fn rx_event(endpoint: RawFd, dropped: u32) -> CanEvent {
        CanEvent {
            frame: CanFrame::new(0x100u32, &[1, 2, 3]).unwrap(),
            timestamp_us: 0,
            endpoint,
            is_rx: true,
            is_error: false,
            dropped_frames: dropped,
        }
    }

    fn error_event(endpoint: RawFd, class_bits: u32) -> CanEvent {
        let mut frame = CanFrame::new(class_bits, &[0u8; 8]).unwrap();
        frame.set_error_frame(true);
        CanEvent {
            frame,
            timestamp_us: 0,
            endpoint,
            is_rx: true,
            is_error: true,
            dropped_frames: 0,
        }
    }

    fn recording_error_handler(log: Arc<Mutex<Vec<CanError>>>) -> ErrorHandler {
        ErrorHandler {
            name: "recorder".to_string(),
            callback: Box::new(move |err| log.lock().unwrap().push(err.clone())),
        }
    }

    #[test]
    fn test_error_event_reaches_error_handlers_once() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let rx_hits = Arc::new(Mutex::new(0u32));

        let mut st = empty_state();
        st.err_handlers.push(recording_error_handler(Arc::clone(&errors)));
        let hits = Arc::clone(&rx_hits);
        st.rx_handlers.push(RxHandler {
            name: "rx".to_string(),
            endpoint: 7,
            callback: Box::new(move |_, _| *hits.lock().unwrap() += 1),
        });

        dispatch(&st, &error_event(7, CanErrorMask::BUSOFF.bits()));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], CanError::ErrorFrame(CanErrorMask::BUSOFF));
        assert_eq!(*rx_hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_rx_event_reaches_matching_handler_only() {
        let matched = Arc::new(Mutex::new(0u32));
        let other = Arc::new(Mutex::new(0u32));

        let mut st = empty_state();
        let hits = Arc::clone(&matched);
        st.rx_handlers.push(RxHandler {
            name: "matched".to_string(),
            endpoint: 4,
            callback: Box::new(move |_, _| *hits.lock().unwrap() += 1),
        });
        let hits = Arc::clone(&other);
        st.rx_handlers.push(RxHandler {
            name: "other".to_string(),
            endpoint: 5,
            callback: Box::new(move |_, _| *hits.lock().unwrap() += 1),
        });

        dispatch(&st, &rx_event(4, 0));

        assert_eq!(*matched.lock().unwrap(), 1);
        assert_eq!(*other.lock().unwrap(), 0);
    }

    #[test]
    fn test_drop_delta_reported_on_third_event_only() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut st = empty_state();
        st.err_handlers.push(recording_error_handler(Arc::clone(&errors)));

        // kernel overflow counters 0, 0, 5 decode to deltas 0, 0, 5
        dispatch(&st, &rx_event(4, 0));
        dispatch(&st, &rx_event(4, 0));
        dispatch(&st, &rx_event(4, 5));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], CanError::DroppedFrames(5));
    }

    #[test]
    fn test_tx_error_event_skips_rx_handlers() {
        let rx_hits = Arc::new(Mutex::new(0u32));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let mut st = empty_state();
        st.err_handlers.push(recording_error_handler(Arc::clone(&errors)));
        let hits = Arc::clone(&rx_hits);
        st.rx_handlers.push(RxHandler {
            name: "rx".to_string(),
            endpoint: 9,
            callback: Box::new(move |_, _| *hits.lock().unwrap() += 1),
        });

        let mut evt = error_event(9, CanErrorMask::RESTARTED.bits());
        evt.is_rx = false;
        dispatch(&st, &evt);

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(*rx_hits.lock().unwrap(), 0);
    }
}
