//! Execution contexts, messages and pollers
//!
//! An [`ExecContext`] is a single-threaded scheduling domain: a FIFO of
//! messages plus a set of pollers, each with a period measured on a clock
//! shared by all contexts of one [`Reactor`]. While a context is running its
//! work it is the thread's *current* context, which is how device code learns
//! where it executes.
//!
//! The reactor is driven explicitly (`poll_all`, `advance`), which keeps
//! scheduling deterministic: time only moves when the owner says so.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Identifier of an execution context, unique within the process
pub type ContextId = u64;

/// Upper bound on rounds per `poll_all` call
const MAX_POLL_ROUNDS: usize = 10_000;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<ExecContext>>> = const { RefCell::new(None) };
}

/// Result of one poller invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerStatus {
    /// Nothing to do this time
    Idle,
    /// Work was performed
    Busy,
}

type Message = Box<dyn FnOnce() + Send>;
type PollFn = Box<dyn FnMut() -> PollerStatus + Send>;

#[derive(Debug, Default)]
struct Clock {
    now_us: AtomicU64,
}

impl Clock {
    fn now(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }

    fn advance(&self, by_us: u64) {
        self.now_us.fetch_add(by_us, Ordering::AcqRel);
    }
}

struct PollerEntry {
    id: u64,
    name: String,
    period_us: u64,
    next_run_us: AtomicU64,
    active: AtomicBool,
    func: Mutex<PollFn>,
}

impl PollerEntry {
    fn is_due(&self, now: u64) -> bool {
        self.active.load(Ordering::Acquire)
            && (self.period_us == 0 || self.next_run_us.load(Ordering::Acquire) <= now)
    }
}

/// A single-threaded execution context
pub struct ExecContext {
    id: ContextId,
    name: String,
    clock: Arc<Clock>,
    messages: Mutex<VecDeque<Message>>,
    pollers: Mutex<Vec<Arc<PollerEntry>>>,
    next_poller_id: AtomicU64,
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ExecContext {
    fn new(name: String, clock: Arc<Clock>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            clock,
            messages: Mutex::new(VecDeque::new()),
            pollers: Mutex::new(Vec::new()),
            next_poller_id: AtomicU64::new(1),
        })
    }

    /// The context the calling thread is currently running, if any
    pub fn current() -> Option<Arc<ExecContext>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether this context is the calling thread's current context
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|ctx| ctx.id == self.id)
        })
    }

    /// Queue a message; it runs on the next iteration of this context
    pub fn send_msg(&self, msg: impl FnOnce() + Send + 'static) {
        self.messages.lock().push_back(Box::new(msg));
    }

    /// Register a poller on this context.
    ///
    /// A zero period runs the poller on every iteration. The poller stays
    /// registered until the returned handle is dropped or unregistered.
    pub fn register_poller(
        self: &Arc<Self>,
        name: impl Into<String>,
        period: Duration,
        func: impl FnMut() -> PollerStatus + Send + 'static,
    ) -> Poller {
        let period_us = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
        let entry = Arc::new(PollerEntry {
            id: self.next_poller_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            period_us,
            next_run_us: AtomicU64::new(self.clock.now().saturating_add(period_us)),
            active: AtomicBool::new(true),
            func: Mutex::new(Box::new(func)),
        });
        self.pollers.lock().push(Arc::clone(&entry));
        debug!(
            "ctx {}: registered poller '{}' ({}us)",
            self.name, entry.name, period_us
        );

        Poller {
            ctx: Arc::downgrade(self),
            entry,
        }
    }

    /// Number of registered pollers
    #[must_use]
    pub fn poller_count(&self) -> usize {
        self.pollers.lock().len()
    }

    /// Check whether a poller with this name is registered
    #[must_use]
    pub fn has_poller(&self, name: &str) -> bool {
        self.pollers.lock().iter().any(|p| p.name == name)
    }

    /// Number of queued messages
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.messages.lock().len()
    }

    /// Run `f` with this context as the current one
    pub fn run<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// Run one iteration: the messages queued before the call, then every
    /// due poller. Returns the amount of work performed.
    pub fn poll(self: &Arc<Self>) -> usize {
        let _guard = self.enter();
        let mut work = 0;

        let batch = self.messages.lock().len();
        for _ in 0..batch {
            let Some(msg) = self.messages.lock().pop_front() else {
                break;
            };
            msg();
            work += 1;
        }

        let now = self.clock.now();
        let due: Vec<Arc<PollerEntry>> = self
            .pollers
            .lock()
            .iter()
            .filter(|p| p.is_due(now))
            .cloned()
            .collect();

        for entry in due {
            // An earlier poller in this round may have unregistered it
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            entry
                .next_run_us
                .store(now.saturating_add(entry.period_us), Ordering::Release);
            let mut func = entry.func.lock();
            if (&mut *func)() == PollerStatus::Busy {
                trace!("ctx {}: poller '{}' busy", self.name, entry.name);
                work += 1;
            }
        }

        work
    }

    fn enter(self: &Arc<Self>) -> CurrentGuard {
        let prev = CURRENT.with(|current| current.replace(Some(Arc::clone(self))));
        CurrentGuard { prev }
    }

    fn remove_poller(&self, id: u64) {
        self.pollers.lock().retain(|p| p.id != id);
    }
}

struct CurrentGuard {
    prev: Option<Arc<ExecContext>>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// Handle of a registered poller. Dropping it unregisters the poller.
pub struct Poller {
    ctx: Weak<ExecContext>,
    entry: Arc<PollerEntry>,
}

impl Poller {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Context the poller runs on, while that context is alive
    #[must_use]
    pub fn context(&self) -> Option<Arc<ExecContext>> {
        self.ctx.upgrade()
    }

    /// Unregister the poller. It will not run again, even later in the
    /// current iteration.
    pub fn unregister(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.entry.name)
            .field("period_us", &self.entry.period_us)
            .finish_non_exhaustive()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.entry.active.store(false, Ordering::Release);
        if let Some(ctx) = self.ctx.upgrade() {
            if !ctx.is_current() {
                warn!(
                    "poller '{}' unregistered off its context {}",
                    self.entry.name, ctx.name
                );
            }
            ctx.remove_poller(self.entry.id);
            debug!("ctx {}: unregistered poller '{}'", ctx.name, self.entry.name);
        }
    }
}

/// A set of execution contexts sharing one clock
pub struct Reactor {
    contexts: Vec<Arc<ExecContext>>,
    clock: Arc<Clock>,
}

impl Reactor {
    /// Create a reactor with `count` contexts named `ctx0..`
    #[must_use]
    pub fn new(count: usize) -> Self {
        let clock = Arc::new(Clock::default());
        let contexts = (0..count)
            .map(|i| ExecContext::new(format!("ctx{i}"), Arc::clone(&clock)))
            .collect();
        Self { contexts, clock }
    }

    /// Context by index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn context(&self, index: usize) -> &Arc<ExecContext> {
        &self.contexts[index]
    }

    /// One iteration of every context
    pub fn poll_once(&self) -> usize {
        self.contexts.iter().map(ExecContext::poll).sum()
    }

    /// Iterate every context until a full round does no work
    pub fn poll_all(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_POLL_ROUNDS {
            let work = self.poll_once();
            if work == 0 {
                return total;
            }
            total += work;
        }
        warn!("reactor still busy after {MAX_POLL_ROUNDS} rounds");
        total
    }

    /// Move the clock forward, then run until idle
    pub fn advance(&self, by: Duration) -> usize {
        self.clock
            .advance(u64::try_from(by.as_micros()).unwrap_or(u64::MAX));
        self.poll_all()
    }
}
