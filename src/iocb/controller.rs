//! Controllers servicing control blocks
//!
//! [`IoController`] is the hook a controller implements: `process_io` starts
//! work on a control block, and the `active_io`/`complete_io`/`abort_io`
//! defaults move the block through its states. [`IoQController`] serves one
//! block at a time and queues the rest; [`SieveQueue`] is one of those per
//! destination address, so each device sees at most one request in flight.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use super::{Iocb, IocbError, IocbState, IoQueue, Result};
use crate::app::Pdu;
use crate::network::Address;
use crate::task::TaskManager;

/// Something that services control blocks
pub trait IoController: Send + Sync {
    /// Start work on a Pending control block. An error aborts the block.
    fn process_io(&self, iocb: &Iocb) -> Result<()>;

    /// Work on `iocb` is under way
    fn active_io(&self, iocb: &Iocb) {
        iocb.set_active();
    }

    /// Work on `iocb` succeeded
    fn complete_io(&self, iocb: &Iocb, response: Option<Pdu>) {
        iocb.finish(IocbState::Completed, response, None);
    }

    /// Work on `iocb` failed
    fn abort_io(&self, iocb: &Iocb, error: IocbError) {
        iocb.finish(IocbState::Aborted, None, Some(error));
    }
}

/// Bind `iocb` to `controller`, mark it Pending and hand it over
pub fn request_io<C>(controller: &Arc<C>, iocb: &Iocb) -> Result<()>
where
    C: IoController + 'static,
{
    let weak: Weak<dyn IoController> = Arc::downgrade(controller) as Weak<dyn IoController>;
    iocb.bind(weak)?;
    if let Err(e) = controller.process_io(iocb) {
        debug!("iocb {} failed to start: {}", iocb.id(), e);
        controller.abort_io(iocb, e);
    }
    Ok(())
}

/// Queueing controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Ready for the next control block
    Idle,
    /// Serving a control block
    Active,
    /// Settling after a completion before taking the next block
    Waiting,
}

/// Hook an [`IoQController`] runs for each control block it takes up
pub type ProcessHook = Box<dyn Fn(&Iocb) -> Result<()> + Send + Sync>;

/// Deferred request to take up the next queued block
#[derive(Debug)]
struct TakeNext;

struct Serving {
    state: ControllerState,
    active: Option<Iocb>,
    deferred: TaskManager<TakeNext>,
    /// A caller is running the deferred loop
    draining: bool,
}

/// Controller serving one control block at a time, queueing the rest in
/// priority order
pub struct IoQController {
    name: String,
    me: Weak<IoQController>,
    queue: IoQueue,
    settle: Option<Duration>,
    serving: Mutex<Serving>,
    process: ProcessHook,
}

impl fmt::Debug for IoQController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serving = self.lock();
        f.debug_struct("IoQController")
            .field("name", &self.name)
            .field("state", &serving.state)
            .field("active", &serving.active.as_ref().map(Iocb::id))
            .field("queued", &self.queue.len())
            .field("settle", &self.settle)
            .finish()
    }
}

impl IoQController {
    /// `process` starts work on each control block taken up. After each
    /// completion the controller waits `settle`, if given, before taking the
    /// next block.
    pub fn new<F>(name: impl Into<String>, settle: Option<Duration>, process: F) -> Arc<Self>
    where
        F: Fn(&Iocb) -> Result<()> + Send + Sync + 'static,
    {
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            me: me.clone(),
            queue: IoQueue::new(),
            settle,
            serving: Mutex::new(Serving {
                state: ControllerState::Idle,
                active: None,
                deferred: TaskManager::with_system_clock(),
                draining: false,
            }),
            process: Box::new(process),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Serving> {
        self.serving.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    /// Control block being served
    pub fn active(&self) -> Option<Iocb> {
        self.lock().active.clone()
    }

    /// Control blocks waiting their turn
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Submit `iocb` to this controller
    pub fn request_io(&self, iocb: &Iocb) -> Result<()> {
        let me = self.me.upgrade().ok_or(IocbError::ControllerUnavailable)?;
        request_io(&me, iocb)
    }

    /// Abort the active control block and everything queued
    pub fn abort(&self, error: IocbError) {
        self.queue.abort_all(error.clone());
        if let Some(active) = self.active() {
            self.abort_io(&active, error);
        }
    }

    fn serve(&self, iocb: &Iocb) {
        trace!("{}: serving iocb {}", self.name, iocb.id());
        self.active_io(iocb);
        if let Err(e) = (self.process)(iocb) {
            debug!("{}: iocb {} failed: {}", self.name, iocb.id(), e);
            self.abort_io(iocb, e);
        }
    }

    /// Take up the next queued control block if idle
    fn next(&self) {
        let iocb = {
            let mut serving = self.lock();
            if serving.state != ControllerState::Idle {
                return;
            }
            let Some(iocb) = self.queue.get(false, None) else {
                return;
            };
            serving.state = ControllerState::Active;
            serving.active = Some(iocb.clone());
            iocb
        };
        self.serve(&iocb);
    }

    /// Queue a deferred [`TakeNext`] and run the deferred loop unless a
    /// caller further up the stack already does. A block completed from
    /// inside its own process hook therefore never starts the next one
    /// recursively.
    fn schedule_next(&self) {
        {
            let mut serving = self.lock();
            if let Err(e) = serving.deferred.defer(TakeNext) {
                warn!("{}: {}", self.name, e);
                return;
            }
            if serving.draining {
                return;
            }
            serving.draining = true;
        }
        loop {
            let task = {
                let mut serving = self.lock();
                let task = serving.deferred.pop_ready();
                if task.is_none() {
                    serving.draining = false;
                }
                task
            };
            let Some(TakeNext) = task else {
                return;
            };
            self.next();
        }
    }

    /// `iocb` finished; free the controller if it was the one being served
    fn release(&self, iocb: &Iocb) {
        {
            let mut serving = self.lock();
            if serving.active.as_ref() != Some(iocb) {
                return;
            }
            serving.active = None;
            serving.state = match self.settle {
                Some(_) => ControllerState::Waiting,
                None => ControllerState::Idle,
            };
        }

        let Some(settle) = self.settle else {
            self.schedule_next();
            return;
        };
        let me = self.me.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-settle", self.name))
            .spawn(move || {
                thread::sleep(settle);
                if let Some(controller) = me.upgrade() {
                    controller.lock().state = ControllerState::Idle;
                    controller.schedule_next();
                }
            });
        if let Err(e) = spawned {
            warn!("{}: could not start settle timer: {}", self.name, e);
            self.lock().state = ControllerState::Idle;
            self.schedule_next();
        }
    }
}

impl IoController for IoQController {
    fn process_io(&self, iocb: &Iocb) -> Result<()> {
        let mut serving = self.lock();
        if serving.state == ControllerState::Idle && self.queue.is_empty() {
            serving.state = ControllerState::Active;
            serving.active = Some(iocb.clone());
            drop(serving);
            self.serve(iocb);
            Ok(())
        } else {
            trace!("{}: queueing iocb {}", self.name, iocb.id());
            self.queue.put(iocb.clone())
        }
    }

    fn complete_io(&self, iocb: &Iocb, response: Option<Pdu>) {
        if iocb.finish(IocbState::Completed, response, None) {
            self.release(iocb);
        }
    }

    fn abort_io(&self, iocb: &Iocb, error: IocbError) {
        self.queue.remove(iocb);
        if iocb.finish(IocbState::Aborted, None, Some(error)) {
            self.release(iocb);
        }
    }
}

/// One-at-a-time request queue for a single destination
#[derive(Debug, Clone)]
pub struct SieveQueue {
    address: Address,
    controller: Arc<IoQController>,
}

impl SieveQueue {
    /// Queue for `address`; `send` is called with each control block as it
    /// becomes the one in flight
    pub fn new<F>(address: Address, send: F) -> Self
    where
        F: Fn(&Iocb) -> Result<()> + Send + Sync + 'static,
    {
        let controller = IoQController::new(format!("sieve {}", address), None, send);
        Self {
            address,
            controller,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn controller(&self) -> &Arc<IoQController> {
        &self.controller
    }

    /// Submit `iocb`; it is sent once everything ahead of it finished
    pub fn request_io(&self, iocb: &Iocb) -> Result<()> {
        request_io(&self.controller, iocb)
    }

    /// Request in flight
    pub fn active(&self) -> Option<Iocb> {
        self.controller.active()
    }

    /// Requests waiting behind the one in flight
    pub fn queued(&self) -> usize {
        self.controller.queued()
    }
}
