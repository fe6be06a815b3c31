//! Priority queue of pending control blocks

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{Iocb, IocbError, IocbState, Result};

#[derive(Default)]
struct Entries {
    /// Keyed by (priority, insertion sequence)
    items: BTreeMap<(u8, u64), Iocb>,
    sequence: u64,
}

/// Pending control blocks ordered by priority, then by insertion
#[derive(Default)]
pub struct IoQueue {
    entries: Mutex<Entries>,
    available: Condvar,
}

impl fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoQueue").field("len", &self.len()).finish()
    }
}

impl IoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock()
    }

    /// Queue a Pending control block
    pub fn put(&self, iocb: Iocb) -> Result<()> {
        let state = iocb.state();
        if state != IocbState::Pending {
            return Err(IocbError::NotPending(state));
        }
        let mut entries = self.lock();
        entries.sequence += 1;
        let key = (iocb.priority(), entries.sequence);
        entries.items.insert(key, iocb);
        drop(entries);
        self.available.notify_one();
        Ok(())
    }

    /// Take the most urgent control block. Without `block` this returns
    /// `None` on an empty queue right away; with `block` it waits up to
    /// `delay`, or for as long as it takes when `delay` is `None`.
    pub fn get(&self, block: bool, delay: Option<Duration>) -> Option<Iocb> {
        let mut entries = self.lock();
        match (block, delay) {
            (false, _) => {}
            (true, None) => self
                .available
                .wait_while(&mut entries, |entries| entries.items.is_empty()),
            (true, Some(delay)) => {
                self.available
                    .wait_while_for(&mut entries, |entries| entries.items.is_empty(), delay);
            }
        }
        entries.items.pop_first().map(|(_, iocb)| iocb)
    }

    /// Take `iocb` out of the queue. Returns false if it was not queued.
    pub fn remove(&self, iocb: &Iocb) -> bool {
        let mut entries = self.lock();
        let key = entries
            .items
            .iter()
            .find(|(_, queued)| queued.id() == iocb.id())
            .map(|(key, _)| *key);
        key.and_then(|key| entries.items.remove(&key)).is_some()
    }

    /// Abort every queued control block with `error`
    pub fn abort_all(&self, error: IocbError) {
        let drained = std::mem::take(&mut self.lock().items);
        for iocb in drained.into_values() {
            iocb.abort(error.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
