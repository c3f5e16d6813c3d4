//! Per-interface state and the public call surface.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use can_core::{CanError, CanFrame, Filter};

use crate::config::CanConfig;
use crate::endpoint::{CanEvent, RxEndpoint, TxEndpoint};
use crate::netlink::{self, BerrCounter, CanLink, CanState, DeviceStats, LinkOps};
use crate::reactor;
use crate::socket::CanAddr;

/// Name under which the built-in logging error handler is registered.
///
/// It can be removed like any other handler:
/// `iface.unregister_error_handler(DEFAULT_ERROR_HANDLER)`.
pub const DEFAULT_ERROR_HANDLER: &str = "muxcan-default-error-handler";

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type RxCallback = Box<dyn Fn(&CanFrame, u64) + Send>;
pub(crate) type ErrorCallback = Box<dyn Fn(&CanError) + Send>;

pub(crate) struct RxHandler {
    pub(crate) name: String,
    pub(crate) endpoint: RawFd,
    pub(crate) callback: RxCallback,
}

pub(crate) struct ErrorHandler {
    pub(crate) name: String,
    pub(crate) callback: ErrorCallback,
}

pub(crate) struct State {
    pub(crate) cfg: CanConfig,
    pub(crate) addr: Option<CanAddr>,
    pub(crate) tx: Option<TxEndpoint>,
    /// RX endpoints in registration order; the reactor drains them in this
    /// order, before the TX endpoint.
    pub(crate) rx: Vec<RxEndpoint>,
    pub(crate) rx_handlers: Vec<RxHandler>,
    pub(crate) err_handlers: Vec<ErrorHandler>,
    pub(crate) poll_timeout: Duration,
    pub(crate) tx_buf_granted: u32,
    pub(crate) rx_buf_granted: u32,
    pub(crate) worker: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) run: AtomicBool,
    /// Last kernel drop counter observed on any RX endpoint.
    pub(crate) dropped_frames: AtomicU32,
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, State>, CanError> {
        self.state.lock().map_err(CanError::from)
    }
}

fn open_rx_locked(st: &mut State, filters: &[Filter]) -> Result<RawFd, CanError> {
    let addr = st.addr.as_ref().ok_or(CanError::NotInitialized)?;
    let (endpoint, granted) = RxEndpoint::open(addr, &st.cfg, filters)?;
    let fd = endpoint.fd();
    st.rx.push(endpoint);
    if granted != 0 {
        st.rx_buf_granted = granted;
    }
    Ok(fd)
}

fn close_rx_locked(st: &mut State, fd: RawFd) {
    st.rx.retain(|endpoint| endpoint.fd() != fd);
    st.rx_handlers.retain(|handler| handler.endpoint != fd);
}

/// A CAN interface: one shared TX endpoint, any number of filtered RX
/// endpoints and the reactor that drives them.
///
/// Handlers run on the reactor with the interface lock held. They must be
/// short, non-blocking, and must not call registration methods of their own
/// interface.
pub struct CanInterface {
    shared: Arc<Shared>,
    link: Box<dyn LinkOps>,
}

impl CanInterface {
    /// Allocate a handle for the named interface. No endpoint is opened and
    /// nothing is configured until [`CanInterface::init`].
    pub fn request(name: impl Into<String>) -> Self {
        let name = name.into();
        let link = Box::new(CanLink::new(name.clone()));
        Self::request_with_link(name, link)
    }

    /// Allocate a handle for `canN`.
    pub fn request_index(index: u32) -> Self {
        Self::request(format!("can{}", index))
    }

    /// Allocate a handle with a caller-supplied link-configuration backend,
    /// e.g. [`crate::UnmanagedLink`] for vcan interfaces.
    pub fn request_with_link(name: impl Into<String>, link: Box<dyn LinkOps>) -> Self {
        let name = name.into();
        log::debug!("MUXCAN - requesting {} interface", name);
        Self {
            shared: Arc::new(Shared {
                name,
                run: AtomicBool::new(false),
                dropped_frames: AtomicU32::new(0),
                state: Mutex::new(State {
                    cfg: CanConfig::default(),
                    addr: None,
                    tx: None,
                    rx: Vec::new(),
                    rx_handlers: Vec::new(),
                    err_handlers: Vec::new(),
                    poll_timeout: DEFAULT_POLL_TIMEOUT,
                    tx_buf_granted: 0,
                    rx_buf_granted: 0,
                    worker: None,
                }),
            }),
            link,
        }
    }

    /// Configure and start the interface.
    ///
    /// Applies the non-sentinel link settings, brings the link up, opens
    /// the TX endpoint, installs the default error handler and, unless
    /// `polled_mode`, spawns the reactor thread. Every failure path releases
    /// what was already acquired.
    pub fn init(&mut self, cfg: CanConfig) -> Result<(), CanError> {
        netlink::apply_link_config(self.link.as_ref(), &cfg)?;
        self.link.start()?;

        let addr = CanAddr::from_iface(&self.shared.name)?;
        let (tx, tx_buf_granted) = TxEndpoint::open(&self.shared.name, &addr, &cfg)?;

        let mut st = self.shared.lock()?;
        let spawn_worker = !cfg.polled_mode && st.worker.is_none();
        st.cfg = cfg;
        st.addr = Some(addr);
        st.tx = Some(tx);
        st.tx_buf_granted = tx_buf_granted;
        if !st.err_handlers.iter().any(|h| h.name == DEFAULT_ERROR_HANDLER) {
            st.err_handlers.push(ErrorHandler {
                name: DEFAULT_ERROR_HANDLER.to_string(),
                callback: Box::new(|err| log::error!("{}", err)),
            });
        }

        if spawn_worker {
            self.shared.run.store(true, Ordering::SeqCst);
            let shared = Arc::clone(&self.shared);
            let worker = std::thread::Builder::new()
                .name(format!("muxcan-{}", self.shared.name))
                .spawn(move || reactor::run(shared));
            match worker {
                Ok(handle) => st.worker = Some(handle),
                Err(e) => {
                    log::error!("MUXCAN - unable to create thread in {}", self.shared.name);
                    st.tx = None;
                    st.addr = None;
                    return Err(CanError::ThreadCreate(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Stop the reactor, bring the link down and release every endpoint.
    /// Runs on drop as well.
    pub fn close(&mut self) -> Result<(), CanError> {
        self.shared.run.store(false, Ordering::SeqCst);
        let worker = { self.shared.lock()?.worker.take() };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::warn!("MUXCAN - reactor thread of {} panicked", self.shared.name);
            }
        }

        let initialized = { self.shared.lock()?.tx.is_some() };
        let ret = if initialized {
            let ret = self.link.stop();
            if let Err(ref e) = ret {
                log::error!("MUXCAN - can not stop iface {}: {}", self.shared.name, e);
            }
            ret
        } else {
            Ok(())
        };

        let mut st = self.shared.lock()?;
        st.rx_handlers.clear();
        st.err_handlers.clear();
        st.rx.clear();
        st.tx = None;
        st.addr = None;
        ret
    }

    /// Submit one frame on the TX endpoint.
    ///
    /// A full transmit queue is back-pressure, not failure: the caller gets
    /// [`CanError::TxRetryLater`] and should simply try again.
    pub fn tx_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        let st = self.shared.lock()?;
        let tx = st.tx.as_ref().ok_or(CanError::NotInitialized)?;
        tx.write(frame, st.cfg.canfd_enabled)
    }

    /// Register a handler for link errors, drop notifications and reactor
    /// failures. `name` is the handler identity.
    pub fn register_error_handler<F>(&self, name: &str, callback: F) -> Result<(), CanError>
    where
        F: Fn(&CanError) + Send + 'static,
    {
        let mut st = self.shared.lock()?;
        if st.err_handlers.iter().any(|h| h.name == name) {
            log::error!("MUXCAN - callback already registered on {}", self.shared.name);
            return Err(CanError::AlreadyRegistered(name.to_string()));
        }
        st.err_handlers.push(ErrorHandler {
            name: name.to_string(),
            callback: Box::new(callback),
        });
        Ok(())
    }

    pub fn unregister_error_handler(&self, name: &str) -> Result<(), CanError> {
        let mut st = self.shared.lock()?;
        match st.err_handlers.iter().position(|h| h.name == name) {
            Some(pos) => {
                st.err_handlers.remove(pos);
                Ok(())
            }
            None => {
                log::error!("MUXCAN - callback not found on {}", self.shared.name);
                Err(CanError::NotFound(name.to_string()))
            }
        }
    }

    /// Open an RX endpoint with the given acceptance filters and link the
    /// handler record to it in one step.
    pub fn register_rx_handler<F>(&self, name: &str, filters: &[Filter], callback: F) -> Result<(), CanError>
    where
        F: Fn(&CanFrame, u64) + Send + 'static,
    {
        let mut st = self.shared.lock()?;
        if st.rx_handlers.iter().any(|h| h.name == name) {
            log::error!("MUXCAN - callback already registered on {}", self.shared.name);
            return Err(CanError::AlreadyRegistered(name.to_string()));
        }
        let endpoint = open_rx_locked(&mut st, filters)?;
        st.rx_handlers.push(RxHandler {
            name: name.to_string(),
            endpoint,
            callback: Box::new(callback),
        });
        Ok(())
    }

    /// Drop the handler record and close the endpoint it reads from.
    pub fn unregister_rx_handler(&self, name: &str) -> Result<(), CanError> {
        let mut st = self.shared.lock()?;
        let pos = st.rx_handlers.iter().position(|h| h.name == name).ok_or_else(|| {
            log::error!("MUXCAN - callback not found on {}", self.shared.name);
            CanError::NotFound(name.to_string())
        })?;
        let fd = st.rx_handlers[pos].endpoint;
        close_rx_locked(&mut st, fd);
        Ok(())
    }

    /// Open a filtered RX endpoint without a handler, for
    /// [`CanInterface::poll_one`] workflows.
    pub fn open_rx_socket(&self, filters: &[Filter]) -> Result<RawFd, CanError> {
        let mut st = self.shared.lock()?;
        open_rx_locked(&mut st, filters)
    }

    /// Close an RX endpoint; a handler record attached to it goes with it.
    pub fn close_rx_socket(&self, fd: RawFd) -> Result<(), CanError> {
        let mut st = self.shared.lock()?;
        close_rx_locked(&mut st, fd);
        Ok(())
    }

    /// One blocking pump: wait up to `timeout` for readiness, drain every
    /// ready endpoint and dispatch the events through the handler tables.
    pub fn poll(&self, timeout: Duration) -> Result<(), CanError> {
        reactor::pump(&self.shared, Some(timeout))
    }

    pub fn poll_msec(&self, milliseconds: u64) -> Result<(), CanError> {
        self.poll(Duration::from_millis(milliseconds))
    }

    /// Wait and read at most one event. Codec and ancillary decoding apply,
    /// but no user handler is invoked.
    pub fn poll_one(&self, timeout: Duration) -> Result<Option<CanEvent>, CanError> {
        reactor::pump_one(&self.shared, timeout)
    }

    /// Per-iteration timeout of the reactor thread.
    pub fn set_thread_poll_rate(&self, timeout: Duration) -> Result<(), CanError> {
        self.shared.lock()?.poll_timeout = timeout;
        Ok(())
    }

    pub fn set_thread_poll_rate_msec(&self, milliseconds: u64) -> Result<(), CanError> {
        self.set_thread_poll_rate(Duration::from_millis(milliseconds))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// OS-assigned interface index, available once initialized.
    pub fn index(&self) -> Result<u32, CanError> {
        let st = self.shared.lock()?;
        st.addr.as_ref().map(|a| a.ifindex()).ok_or(CanError::NotInitialized)
    }

    /// Descriptor of the TX endpoint.
    pub fn tx_fd(&self) -> Result<RawFd, CanError> {
        let st = self.shared.lock()?;
        st.tx.as_ref().map(|tx| tx.fd()).ok_or(CanError::NotInitialized)
    }

    /// Number of currently open RX endpoints.
    pub fn rx_socket_count(&self) -> Result<usize, CanError> {
        Ok(self.shared.lock()?.rx.len())
    }

    /// Last kernel drop counter observed on any RX endpoint.
    pub fn dropped_frames(&self) -> u32 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    /// Send-buffer size the kernel actually granted, 0 when left untouched.
    pub fn tx_buf_granted(&self) -> Result<u32, CanError> {
        Ok(self.shared.lock()?.tx_buf_granted)
    }

    /// Receive-buffer size the kernel actually granted, 0 when left untouched.
    pub fn rx_buf_granted(&self) -> Result<u32, CanError> {
        Ok(self.shared.lock()?.rx_buf_granted)
    }

    pub fn state(&self) -> Result<CanState, CanError> {
        self.link.state()
    }

    /// Trigger a manual bus-off recovery.
    pub fn restart(&self) -> Result<(), CanError> {
        self.link.restart()
    }

    pub fn device_stats(&self) -> Result<DeviceStats, CanError> {
        self.link.device_stats()
    }

    pub fn berr_counter(&self) -> Result<BerrCounter, CanError> {
        self.link.berr_counter()
    }
}

impl Drop for CanInterface {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
