//! Single-threaded cooperative executor with a logical clock.
//!
//! Tasks live in a task table and are polled in the order their wakers fire.
//! When nothing is ready the clock jumps straight to the earliest timer, so a
//! run costs as many polls as there are suspension points, never wall time.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::{pin, Pin};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ExecutionError, HotflowResult, ValidationError};

use super::time::{Sleep, Ticks};

/// Identifier of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Reserved for the future driven by [`Scheduler::block_on`].
const MAIN_TASK: TaskId = TaskId(0);

/// Scheduler limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum task polls over the scheduler's lifetime.
    pub max_polls: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_polls: 1_000_000 }
    }
}

impl SchedulerConfig {
    /// Checks the limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_polls == 0 {
            return Err(ValidationError::ZeroPollBudget);
        }
        Ok(())
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Logical time when the run stopped.
    pub now: Ticks,
    /// Total polls performed so far.
    pub polls: u64,
    /// Tasks still parked without any timer or waker able to resume them.
    pub pending_tasks: usize,
}

struct TaskWaker {
    id: TaskId,
    ready: Sender<TaskId>,
    queued: AtomicBool,
}

impl TaskWaker {
    fn new(id: TaskId, ready: Sender<TaskId>) -> Self {
        Self {
            id,
            ready,
            queued: AtomicBool::new(false),
        }
    }

    fn reset(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            // The receiver lives as long as the scheduler.
            let _ = self.ready.send(self.id);
        }
    }
}

struct Task {
    future: Option<LocalBoxFuture<'static, ()>>,
    waker: Arc<TaskWaker>,
}

pub(crate) type TimerKey = (Ticks, u64);

pub(crate) struct Core {
    now: Cell<Ticks>,
    next_task: Cell<u64>,
    next_timer: Cell<u64>,
    polls: Cell<u64>,
    tasks: RefCell<HashMap<TaskId, Task>>,
    timers: RefCell<BTreeMap<TimerKey, Waker>>,
    ready_tx: Sender<TaskId>,
    ready_rx: Receiver<TaskId>,
}

impl Core {
    fn new() -> Self {
        let (ready_tx, ready_rx) = unbounded();
        Self {
            now: Cell::new(0),
            next_task: Cell::new(MAIN_TASK.0 + 1),
            next_timer: Cell::new(0),
            polls: Cell::new(0),
            tasks: RefCell::new(HashMap::new()),
            timers: RefCell::new(BTreeMap::new()),
            ready_tx,
            ready_rx,
        }
    }

    pub(crate) fn now(&self) -> Ticks {
        self.now.get()
    }

    pub(crate) fn register_timer(&self, deadline: Ticks, waker: Waker) -> TimerKey {
        let seq = self.next_timer.get();
        self.next_timer.set(seq + 1);
        let key = (deadline, seq);
        self.timers.borrow_mut().insert(key, waker);
        key
    }

    pub(crate) fn refresh_timer(&self, key: TimerKey, waker: &Waker) {
        if let Some(slot) = self.timers.borrow_mut().get_mut(&key) {
            if !slot.will_wake(waker) {
                slot.clone_from(waker);
            }
        }
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        self.timers.borrow_mut().remove(&key);
    }

    fn spawn_boxed(&self, future: LocalBoxFuture<'static, ()>) -> TaskId {
        let id = TaskId(self.next_task.get());
        self.next_task.set(id.0 + 1);

        let waker = Arc::new(TaskWaker::new(id, self.ready_tx.clone()));
        self.tasks.borrow_mut().insert(
            id,
            Task {
                future: Some(future),
                waker: Arc::clone(&waker),
            },
        );
        waker.wake_by_ref();
        id
    }

    fn charge_poll(&self, max_polls: u64) -> HotflowResult<()> {
        let polls = self.polls.get() + 1;
        if polls > max_polls {
            return Err(ExecutionError::BudgetExhausted { max_polls }.into());
        }
        self.polls.set(polls);
        Ok(())
    }

    fn poll_task(&self, id: TaskId) {
        let taken = {
            let mut tasks = self.tasks.borrow_mut();
            tasks
                .get_mut(&id)
                .and_then(|task| task.future.take().map(|f| (f, Arc::clone(&task.waker))))
        };
        // Stale wake-up for a finished task.
        let Some((mut future, task_waker)) = taken else {
            return;
        };

        task_waker.reset();
        let waker = Waker::from(task_waker);
        let mut cx = Context::from_waker(&waker);
        trace!(task = id.0, now = self.now.get(), "poll");

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                let finished = self.tasks.borrow_mut().remove(&id);
                drop(finished);
            }
            Poll::Pending => {
                if let Some(task) = self.tasks.borrow_mut().get_mut(&id) {
                    task.future = Some(future);
                }
            }
        }
    }

    /// Jumps to the earliest deadline and wakes its timers in registration order.
    ///
    /// Returns false when no timer is pending.
    fn advance_clock(&self) -> bool {
        let due: Vec<Waker> = {
            let mut timers = self.timers.borrow_mut();
            let Some(&(deadline, _)) = timers.keys().next() else {
                return false;
            };
            if deadline > self.now.get() {
                trace!(from = self.now.get(), to = deadline, "advance clock");
                self.now.set(deadline);
            }
            let later = timers.split_off(&(deadline.saturating_add(1), 0));
            std::mem::replace(&mut *timers, later).into_values().collect()
        };
        for waker in due {
            waker.wake();
        }
        true
    }

    fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }
}

/// Owner of the task table and logical clock.
///
/// Only the owner can drive execution; tasks interact with the scheduler
/// through a cloned [`SchedulerHandle`].
pub struct Scheduler {
    core: Rc<Core>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler with the default poll budget.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Rc::new(Core::new()),
            config: SchedulerConfig::default(),
        }
    }

    /// Creates a scheduler with explicit limits.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self {
            core: Rc::new(Core::new()),
            config,
        })
    }

    /// Returns a handle for spawning tasks and creating timers.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            core: Rc::clone(&self.core),
        }
    }

    /// Current logical time.
    #[must_use]
    pub fn now(&self) -> Ticks {
        self.core.now()
    }

    /// Runs every task until nothing is ready and no timer is pending.
    ///
    /// Tasks parked forever (for example a reader of a stream nobody closes)
    /// are left in place and counted in the report.
    pub fn run_until_idle(&mut self) -> HotflowResult<RunReport> {
        loop {
            while let Ok(id) = self.core.ready_rx.try_recv() {
                self.core.charge_poll(self.config.max_polls)?;
                self.core.poll_task(id);
            }
            if !self.core.advance_clock() {
                break;
            }
        }
        Ok(self.report())
    }

    /// Drives `future` together with all spawned tasks until it completes.
    ///
    /// Fails with [`ExecutionError::Stalled`] when `future` is still pending but
    /// no task is ready and no timer is left to fire.
    pub fn block_on<F: Future>(&mut self, future: F) -> HotflowResult<F::Output> {
        let mut future = pin!(future);
        let main = Arc::new(TaskWaker::new(MAIN_TASK, self.core.ready_tx.clone()));
        main.wake_by_ref();

        loop {
            while let Ok(id) = self.core.ready_rx.try_recv() {
                self.core.charge_poll(self.config.max_polls)?;
                if id != MAIN_TASK {
                    self.core.poll_task(id);
                    continue;
                }
                main.reset();
                let waker = Waker::from(Arc::clone(&main));
                let mut cx = Context::from_waker(&waker);
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Ok(output);
                }
            }
            if !self.core.advance_clock() {
                return Err(ExecutionError::Stalled {
                    now: self.core.now(),
                    pending_tasks: self.core.pending_tasks(),
                }
                .into());
            }
        }
    }

    fn report(&self) -> RunReport {
        RunReport {
            now: self.core.now(),
            polls: self.core.polls.get(),
            pending_tasks: self.core.pending_tasks(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.core.now())
            .field("tasks", &self.core.pending_tasks())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Parked futures hold handles back into the core; drop them outside the borrow.
        let tasks = std::mem::take(&mut *self.core.tasks.borrow_mut());
        drop(tasks);
        self.core.timers.borrow_mut().clear();
    }
}

/// Cloneable access to a [`Scheduler`] from inside tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    core: Rc<Core>,
}

impl SchedulerHandle {
    /// Spawns a task; it first runs after every task already queued.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let state = Rc::new(RefCell::new(JoinState {
            output: None,
            waiter: None,
        }));
        let task_state = Rc::clone(&state);
        let wrapped = async move {
            let output = future.await;
            let waiter = {
                let mut state = task_state.borrow_mut();
                state.output = Some(output);
                state.waiter.take()
            };
            if let Some(waiter) = waiter {
                waiter.wake();
            }
        };
        let id = self.core.spawn_boxed(wrapped.boxed_local());
        JoinHandle { id, state }
    }

    /// A future that completes `ticks` logical ticks from now.
    #[must_use]
    pub fn sleep(&self, ticks: Ticks) -> Sleep {
        Sleep::new(Rc::clone(&self.core), self.core.now().saturating_add(ticks))
    }

    /// Current logical time.
    #[must_use]
    pub fn now(&self) -> Ticks {
        self.core.now()
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle").field("now", &self.core.now()).finish()
    }
}

struct JoinState<T> {
    output: Option<T>,
    waiter: Option<Waker>,
}

/// Resolves to the output of a spawned task.
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    /// The task's id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns true once the task produced its output and it was not taken yet.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.borrow().output.is_some()
    }

    /// Takes the output without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.state.borrow_mut().output.take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        if let Some(output) = state.output.take() {
            return Poll::Ready(output);
        }
        state.waiter = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
