//! Task Scheduling Module
//!
//! Timers and deferred work for the transaction layers. Instead of a
//! process-wide timer wheel, each owner (an access point, an I/O queue
//! controller) holds its own [`TaskManager`] and pumps it from its event loop.
//! That keeps independent stacks independent and lets tests drive time with a
//! [`ManualClock`].
//!
//! A task is just a payload of the owner's choosing. The manager never runs
//! code itself; [`TaskManager::pop_ready`] hands back payloads whose time has
//! come and the owner dispatches them with a `match`.
//!
//! # Ordering
//!
//! - deferred payloads come out first, in the order they were deferred
//! - expired timers follow, earliest deadline first, ties in installation order
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//! use bacnet_tsm::task::{ManualClock, TaskManager};
//!
//! let clock = Arc::new(ManualClock::new());
//! let mut tasks = TaskManager::new(clock.clone());
//!
//! tasks.install(Duration::from_millis(100), "timeout").unwrap();
//! tasks.defer("now").unwrap();
//!
//! assert_eq!(tasks.pop_ready(), Some("now"));
//! assert_eq!(tasks.pop_ready(), None);
//!
//! clock.advance(Duration::from_millis(100));
//! assert_eq!(tasks.pop_ready(), Some("timeout"));
//! ```

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use log::trace;
use parking_lot::Mutex;
use thiserror::Error;

/// Result type for scheduling operations
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors that can occur when scheduling work
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The manager has been shut down and accepts no new work
    #[error("Task manager is shut down")]
    Shutdown,
}

/// Source of the current time
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Create a manual clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move time forward
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Handle to an installed timer, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

struct ScheduledTask<T> {
    deadline: Instant,
    handle: TaskHandle,
    payload: T,
}

impl<T> PartialEq for ScheduledTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl<T> Eq for ScheduledTask<T> {}

impl<T> PartialOrd for ScheduledTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ScheduledTask<T> {
    // reversed so the max-heap yields the earliest deadline
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

/// One-shot timers plus a queue of zero-delay work
pub struct TaskManager<T> {
    clock: Arc<dyn Clock>,
    timers: BinaryHeap<ScheduledTask<T>>,
    live: HashSet<TaskHandle>,
    deferred: VecDeque<T>,
    next_handle: u64,
    running: bool,
}

impl<T> TaskManager<T> {
    /// Create a task manager reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: BinaryHeap::new(),
            live: HashSet::new(),
            deferred: VecDeque::new(),
            next_handle: 1,
            running: true,
        }
    }

    /// Create a task manager on the wall clock
    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// The clock this manager reads
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time according to the manager's clock
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Schedule `payload` to become ready after `delay`
    pub fn install(&mut self, delay: Duration, payload: T) -> Result<TaskHandle> {
        if !self.running {
            return Err(TaskError::Shutdown);
        }
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        let deadline = self.clock.now() + delay;
        trace!("install task {:?} in {:?}", handle, delay);
        self.timers.push(ScheduledTask {
            deadline,
            handle,
            payload,
        });
        self.live.insert(handle);
        Ok(handle)
    }

    /// Cancel a pending timer. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        let removed = self.live.remove(&handle);
        if removed {
            trace!("cancel task {:?}", handle);
        }
        removed
    }

    /// True while the timer has neither fired nor been cancelled
    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.live.contains(&handle)
    }

    /// Queue `payload` to run on the next pump, ahead of any timers
    pub fn defer(&mut self, payload: T) -> Result<()> {
        if !self.running {
            return Err(TaskError::Shutdown);
        }
        self.deferred.push_back(payload);
        Ok(())
    }

    /// Next payload that is ready to run, if any
    pub fn pop_ready(&mut self) -> Option<T> {
        if let Some(payload) = self.deferred.pop_front() {
            return Some(payload);
        }
        let now = self.clock.now();
        while let Some(task) = self.timers.peek() {
            if !self.live.contains(&task.handle) {
                self.timers.pop();
                continue;
            }
            if task.deadline > now {
                return None;
            }
            let task = self.timers.pop()?;
            self.live.remove(&task.handle);
            trace!("fire task {:?}", task.handle);
            return Some(task.payload);
        }
        None
    }

    /// Deadline of the earliest live timer
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(task) = self.timers.peek() {
            if self.live.contains(&task.handle) {
                return Some(task.deadline);
            }
            self.timers.pop();
        }
        None
    }

    /// Number of live timers plus deferred payloads
    pub fn pending(&self) -> usize {
        self.live.len() + self.deferred.len()
    }

    /// True until [`TaskManager::shutdown`] is called
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Drop all scheduled work and refuse new work
    pub fn shutdown(&mut self) {
        self.running = false;
        self.timers.clear();
        self.live.clear();
        self.deferred.clear();
    }
}

impl<T> fmt::Debug for TaskManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("timers", &self.live.len())
            .field("deferred", &self.deferred.len())
            .field("running", &self.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<ManualClock>, TaskManager<u32>) {
        let clock = Arc::new(ManualClock::new());
        let tasks = TaskManager::new(clock.clone());
        (clock, tasks)
    }

    #[test]
    fn test_manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_millis(250));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), start + Duration::from_millis(500));
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let (clock, mut tasks) = manager();
        tasks.install(Duration::from_millis(30), 3).unwrap();
        tasks.install(Duration::from_millis(10), 1).unwrap();
        tasks.install(Duration::from_millis(20), 2).unwrap();

        assert_eq!(tasks.pop_ready(), None);
        clock.advance(Duration::from_millis(25));
        assert_eq!(tasks.pop_ready(), Some(1));
        assert_eq!(tasks.pop_ready(), Some(2));
        assert_eq!(tasks.pop_ready(), None);
        clock.advance(Duration::from_millis(5));
        assert_eq!(tasks.pop_ready(), Some(3));
    }

    #[test]
    fn test_equal_deadlines_keep_install_order() {
        let (clock, mut tasks) = manager();
        for i in 0..5 {
            tasks.install(Duration::from_millis(10), i).unwrap();
        }
        clock.advance(Duration::from_millis(10));
        let fired: Vec<u32> = std::iter::from_fn(|| tasks.pop_ready()).collect();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel() {
        let (clock, mut tasks) = manager();
        let a = tasks.install(Duration::from_millis(10), 1).unwrap();
        tasks.install(Duration::from_millis(10), 2).unwrap();
        assert!(tasks.is_pending(a));
        assert!(tasks.cancel(a));
        assert!(!tasks.cancel(a));
        assert!(!tasks.is_pending(a));

        clock.advance(Duration::from_millis(10));
        assert_eq!(tasks.pop_ready(), Some(2));
        assert_eq!(tasks.pop_ready(), None);
    }

    #[test]
    fn test_deferred_runs_before_timers() {
        let (clock, mut tasks) = manager();
        tasks.install(Duration::ZERO, 1).unwrap();
        tasks.defer(2).unwrap();
        tasks.defer(3).unwrap();
        clock.advance(Duration::from_millis(1));
        assert_eq!(tasks.pop_ready(), Some(2));
        assert_eq!(tasks.pop_ready(), Some(3));
        assert_eq!(tasks.pop_ready(), Some(1));
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let (_clock, mut tasks) = manager();
        let start = tasks.now();
        let a = tasks.install(Duration::from_millis(5), 1).unwrap();
        tasks.install(Duration::from_millis(50), 2).unwrap();
        tasks.cancel(a);
        assert_eq!(tasks.next_deadline(), Some(start + Duration::from_millis(50)));
        assert_eq!(tasks.pending(), 1);
    }

    #[test]
    fn test_shutdown_refuses_work() {
        let (_clock, mut tasks) = manager();
        tasks.install(Duration::from_millis(5), 1).unwrap();
        tasks.shutdown();
        assert!(!tasks.is_running());
        assert_eq!(tasks.pending(), 0);
        assert_eq!(
            tasks.install(Duration::from_millis(5), 2),
            Err(TaskError::Shutdown)
        );
        assert_eq!(tasks.defer(3), Err(TaskError::Shutdown));
    }
}
