//! I/O Control Blocks
//!
//! An [`Iocb`] stands for one request the local application has submitted and
//! is waiting on. Whoever produces the outcome calls [`Iocb::complete`] or
//! [`Iocb::abort`]; the submitter blocks in [`Iocb::wait`] (or awaits
//! [`Iocb::wait_async`]) or registers a callback with [`Iocb::add_callback`].
//!
//! # Components
//!
//! - [`Iocb`]: cloneable handle to the shared control block
//! - [`IoQueue`]: priority queue of pending control blocks with blocking get
//! - [`IoController`]: hook trait for whatever services control blocks
//! - [`IoQController`]: controller that services one control block at a time
//!   and queues the rest
//! - [`SieveQueue`]: queueing controller bound to one destination address
//!
//! # States
//!
//! ```text
//! Idle --request_io--> Pending --active_io--> Active
//!                         |                     |
//!                         +----complete/abort---+--> Completed | Aborted
//! ```
//!
//! Completed and Aborted are final: completing or aborting again changes
//! nothing.
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::app::{Apdu, Pdu};
//! use bacnet_tsm::iocb::{Iocb, IocbState};
//! use bacnet_tsm::network::Address;
//! use bacnet_tsm::service::ConfirmedServiceChoice;
//!
//! let device = Address::local_station(vec![10, 0, 0, 1, 0xBA, 0xC0]);
//! let request = Apdu::confirmed_request(0, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
//! let iocb = Iocb::new(Pdu::outbound(device.clone(), request));
//!
//! let ack = Apdu::SimpleAck { invoke_id: 0, service_choice: 12 };
//! iocb.complete(Some(Pdu::inbound(device, ack)));
//! assert_eq!(iocb.wait(), IocbState::Completed);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::app::{ApplicationError, Pdu};
use crate::service::{AbortReason, RejectReason};

pub mod controller;
pub mod queue;

pub use controller::{request_io, ControllerState, IoController, IoQController, SieveQueue};
pub use queue::IoQueue;

/// Result type for IOCB operations
pub type Result<T> = std::result::Result<T, IocbError>;

/// Why a control block was aborted, or why an operation on it failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IocbError {
    /// The timeout set with [`Iocb::set_timeout`] fired first
    #[error("Request timed out")]
    Timeout,
    /// The control block was handed to a controller twice
    #[error("IOCB already submitted, state {0}")]
    NotIdle(IocbState),
    /// Only pending control blocks can be queued
    #[error("IOCB must be pending to be queued, state {0}")]
    NotPending(IocbState),
    /// The request carries no destination address
    #[error("Request has no destination")]
    NoDestination,
    /// Device communication control forbids sending the request
    #[error("Communication disabled")]
    CommunicationDisabled,
    /// The remote device answered with an Error PDU
    #[error("Service error: class {error_class}, code {error_code}")]
    Service { error_class: u16, error_code: u16 },
    /// The remote device rejected the request
    #[error("Rejected: {0}")]
    Rejected(RejectReason),
    /// The transaction was aborted, locally or by the remote device
    #[error("Aborted: {0}")]
    Aborted(AbortReason),
    /// The access point refused the request
    #[error("Application error: {0}")]
    Application(#[from] ApplicationError),
    /// The controller went away or shut down
    #[error("Controller unavailable")]
    ControllerUnavailable,
}

/// Control block lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IocbState {
    Idle,
    Pending,
    Active,
    Completed,
    Aborted,
}

impl IocbState {
    /// True for Completed and Aborted
    pub fn is_terminal(&self) -> bool {
        matches!(self, IocbState::Completed | IocbState::Aborted)
    }
}

impl fmt::Display for IocbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IocbState::Idle => "IDLE",
            IocbState::Pending => "PENDING",
            IocbState::Active => "ACTIVE",
            IocbState::Completed => "COMPLETED",
            IocbState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Runs once when the control block reaches Completed or Aborted
pub type IocbCallback = Box<dyn FnOnce(&Iocb) + Send>;

static NEXT_IOCB_ID: AtomicU64 = AtomicU64::new(1);

/// Default priority; lower values are served first
pub const DEFAULT_PRIORITY: u8 = 0;

struct Shared {
    state: IocbState,
    response: Option<Pdu>,
    error: Option<IocbError>,
    callbacks: Vec<IocbCallback>,
    controller: Option<Weak<dyn IoController>>,
    timeout_generation: u64,
}

struct Inner {
    id: u64,
    priority: u8,
    request: Pdu,
    shared: Mutex<Shared>,
    trigger: Condvar,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

/// Handle to one submitted request; clones share the same block
#[derive(Clone)]
pub struct Iocb {
    inner: Arc<Inner>,
}

impl fmt::Debug for Iocb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.lock();
        f.debug_struct("Iocb")
            .field("id", &self.inner.id)
            .field("priority", &self.inner.priority)
            .field("state", &shared.state)
            .field("error", &shared.error)
            .field("callbacks", &shared.callbacks.len())
            .finish()
    }
}

impl PartialEq for Iocb {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Iocb {}

impl Iocb {
    /// Control block for `request` at the default priority
    pub fn new(request: Pdu) -> Self {
        Self::with_priority(request, DEFAULT_PRIORITY)
    }

    pub fn with_priority(request: Pdu, priority: u8) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_IOCB_ID.fetch_add(1, Ordering::Relaxed),
                priority,
                request,
                shared: Mutex::new(Shared {
                    state: IocbState::Idle,
                    response: None,
                    error: None,
                    callbacks: Vec::new(),
                    controller: None,
                    timeout_generation: 0,
                }),
                trigger: Condvar::new(),
                #[cfg(feature = "async")]
                notify: tokio::sync::Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn priority(&self) -> u8 {
        self.inner.priority
    }

    pub fn request(&self) -> &Pdu {
        &self.inner.request
    }

    pub fn state(&self) -> IocbState {
        self.lock().state
    }

    /// True once Completed or Aborted
    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn response(&self) -> Option<Pdu> {
        self.lock().response.clone()
    }

    pub fn error(&self) -> Option<IocbError> {
        self.lock().error.clone()
    }

    /// Run `callback` on completion, or right away if already complete
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Iocb) + Send + 'static,
    {
        let mut shared = self.lock();
        if shared.state.is_terminal() {
            drop(shared);
            callback(self);
        } else {
            shared.callbacks.push(Box::new(callback));
        }
    }

    /// Block until Completed or Aborted
    pub fn wait(&self) -> IocbState {
        let mut shared = self.lock();
        self.inner
            .trigger
            .wait_while(&mut shared, |shared| !shared.state.is_terminal());
        shared.state
    }

    /// Block for at most `timeout`. Returns true if the block completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut shared = self.lock();
        self.inner
            .trigger
            .wait_while_for(&mut shared, |shared| !shared.state.is_terminal(), timeout);
        shared.state.is_terminal()
    }

    /// Wait for Completed or Aborted without blocking the executor
    #[cfg(feature = "async")]
    pub async fn wait_async(&self) -> IocbState {
        loop {
            let notified = self.inner.notify.notified();
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    /// Abort with [`IocbError::Timeout`] unless finished within `delay`.
    /// Setting a new timeout replaces the previous one. The timer thread
    /// exits as soon as the block finishes or the timeout is replaced.
    pub fn set_timeout(&self, delay: Duration) {
        let generation = {
            let mut shared = self.lock();
            if shared.state.is_terminal() {
                return;
            }
            shared.timeout_generation += 1;
            shared.timeout_generation
        };
        // wake the timer being replaced
        self.inner.trigger.notify_all();

        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("iocb-{}-timeout", self.inner.id))
            .spawn(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let iocb = Iocb { inner };
                let expired = {
                    let mut shared = iocb.lock();
                    iocb.inner.trigger.wait_while_for(
                        &mut shared,
                        |shared| shared.timeout_generation == generation,
                        delay,
                    );
                    shared.timeout_generation == generation && !shared.state.is_terminal()
                };
                if expired {
                    trace!("iocb {} timed out", iocb.id());
                    iocb.abort(IocbError::Timeout);
                }
            });
        if let Err(e) = spawned {
            warn!("iocb {}: could not start timeout thread: {}", self.inner.id, e);
        }
    }

    /// Finish successfully. No effect once Completed or Aborted.
    pub fn complete(&self, response: Option<Pdu>) {
        match self.controller() {
            Some(controller) => controller.complete_io(self, response),
            None => {
                self.finish(IocbState::Completed, response, None);
            }
        }
    }

    /// Finish with `error`. No effect once Completed or Aborted.
    pub fn abort(&self, error: IocbError) {
        match self.controller() {
            Some(controller) => controller.abort_io(self, error),
            None => {
                self.finish(IocbState::Aborted, None, Some(error));
            }
        }
    }

    fn controller(&self) -> Option<Arc<dyn IoController>> {
        self.lock().controller.as_ref().and_then(Weak::upgrade)
    }

    /// Attach to `controller` and move Idle -> Pending
    pub(crate) fn bind(&self, controller: Weak<dyn IoController>) -> Result<()> {
        let mut shared = self.lock();
        if shared.state != IocbState::Idle {
            return Err(IocbError::NotIdle(shared.state));
        }
        shared.state = IocbState::Pending;
        shared.controller = Some(controller);
        Ok(())
    }

    /// Move to Active unless already finished
    pub(crate) fn set_active(&self) {
        let mut shared = self.lock();
        if !shared.state.is_terminal() {
            shared.state = IocbState::Active;
        }
    }

    /// Enter a final state, wake waiters and run callbacks. Returns false if
    /// the block was already finished.
    pub(crate) fn finish(
        &self,
        state: IocbState,
        response: Option<Pdu>,
        error: Option<IocbError>,
    ) -> bool {
        let callbacks = {
            let mut shared = self.lock();
            if shared.state.is_terminal() {
                return false;
            }
            shared.state = state;
            shared.response = response;
            shared.error = error;
            shared.timeout_generation += 1;
            std::mem::take(&mut shared.callbacks)
        };
        trace!("iocb {} {}", self.inner.id, state);

        self.inner.trigger.notify_all();
        #[cfg(feature = "async")]
        self.inner.notify.notify_waiters();

        for callback in callbacks {
            callback(self);
        }
        true
    }
}
