//! Preemptive priority scheduler.
//!
//! Each hart keeps a 40-level ready queue, strict FIFO within a level.
//! Aging pushes a task's queue priority down every PRIORITY_DECREASE runs
//! so hot tasks cannot starve the rest. Blocked tasks sit on one global
//! sleeping list walked on every tick; a task wakes when its deadline
//! passes, its wakeup predicate turns true, or a deliverable signal is
//! pending.

use super::hart::{self, Hart};
use super::{Priority, Task, TaskState, LOWEST_PRIORITY, MAX_PRIORITY};
use crate::error::Errno;
use crate::time::{get_time, Time, NANOS_PER_SEC};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::Mutex;

/// Runs between two aging steps.
pub const PRIORITY_DECREASE: u16 = 64;

/// Longest stretch between ticks on a busy hart (100 ms).
pub const MAX_TIME: Time = NANOS_PER_SEC / 10;
/// Tick period while idle (1 s).
pub const IDLE_TIME: Time = NANOS_PER_SEC;

pub struct SchedQueue {
    levels: Mutex<[VecDeque<Arc<Task>>; MAX_PRIORITY]>,
}

impl SchedQueue {
    pub fn new() -> Self {
        Self {
            levels: Mutex::new(core::array::from_fn(|_| VecDeque::new())),
        }
    }

    pub fn push(&self, task: Arc<Task>) {
        let priority = {
            let sched = task.sched.lock();
            sched.queue_priority.min(LOWEST_PRIORITY)
        };
        self.levels.lock()[priority as usize].push_back(task);
    }

    /// Highest-priority FIFO pop.
    pub fn pull(&self) -> Option<Arc<Task>> {
        let mut levels = self.levels.lock();
        for level in levels.iter_mut() {
            if let Some(task) = level.pop_front() {
                return Some(task);
            }
        }
        None
    }

    pub fn remove(&self, task: &Arc<Task>) -> bool {
        let mut levels = self.levels.lock();
        for level in levels.iter_mut() {
            if let Some(pos) = level.iter().position(|t| Arc::ptr_eq(t, task)) {
                level.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.levels.lock().iter().map(|level| level.len()).sum()
    }
}

static SLEEPING: Mutex<Vec<Arc<Task>>> = Mutex::new(Vec::new());

fn add_sleeping(task: Arc<Task>) {
    SLEEPING.lock().push(task);
}

/// Apply the aging rule and compute the queue level for this enqueue.
fn aged_priority(priority: Priority, runs: u16) -> Priority {
    if runs % PRIORITY_DECREASE == 0 {
        let aged = priority as u16 + (runs / PRIORITY_DECREASE) % MAX_PRIORITY as u16;
        (aged as Priority).min(LOWEST_PRIORITY)
    } else {
        priority
    }
}

/// Hand a task back to the scheduler according to its state.
pub fn enqueue_task(task: Arc<Task>) {
    let hart = hart::current_hart().expect("no hart registered");
    enqueue_task_on(&hart, task);
}

pub fn enqueue_task_on(hart: &Arc<Hart>, task: Arc<Task>) {
    if Arc::ptr_eq(&hart.idle, &task) {
        return;
    }
    let state = {
        let mut sched = task.sched.lock();
        match sched.state {
            TaskState::Enquable => {
                sched.state = TaskState::Ready;
                sched.queue_priority = aged_priority(sched.priority, sched.runs);
                TaskState::Ready
            }
            other => other,
        }
    };
    match state {
        TaskState::Ready => hart.queue.push(task),
        TaskState::Sleeping | TaskState::Paused | TaskState::WaitChld | TaskState::Waiting => {
            add_sleeping(task)
        }
        TaskState::Running => {}
        TaskState::Terminated => free_task(&task),
        TaskState::Enquable | TaskState::Freed => {}
    }
}

/// Drop the stack and descriptor of a dead task.
fn free_task(task: &Arc<Task>) {
    task.release_resources();
}

fn should_wake(task: &Arc<Task>, now: Time) -> bool {
    let sched = task.sched.lock();
    match sched.state {
        TaskState::Sleeping if sched.sleeping_until <= now => true,
        TaskState::Terminated | TaskState::Freed => true,
        _ => {
            if let Some(wakeup) = sched.wakeup.as_ref() {
                if wakeup(task) {
                    return true;
                }
            }
            drop(sched);
            // A deliverable pending signal interrupts any blocked state.
            task.process()
                .map(|proc| proc.signals.has_deliverable())
                .unwrap_or(false)
        }
    }
}

/// Finish a blocked task's syscall according to why it was parked.
fn awaken_task(task: Arc<Task>) {
    let state = task.state();
    match state {
        TaskState::Terminated | TaskState::Freed => {
            enqueue_task(task);
            return;
        }
        TaskState::Sleeping => {
            // sleep() reports the time left, zero when it ran out.
            let remaining = {
                let sched = task.sched.lock();
                sched.sleeping_until.saturating_sub(get_time())
            };
            task.restart.store(false, Ordering::Release);
            task.frame
                .lock()
                .set_return((remaining / NANOS_PER_SEC) as isize);
        }
        TaskState::WaitChld => {
            crate::process::wait::finish_wait(&task);
        }
        TaskState::Paused | TaskState::Waiting => {
            // Predicate satisfied means the syscall restarts (the pc
            // rewinds onto the ecall); a signal wakeup interrupts
            // instead.
            let predicate_true = {
                let sched = task.sched.lock();
                sched.wakeup.as_ref().map(|f| f(&task)).unwrap_or(false)
            };
            if predicate_true {
                if task.restart.swap(false, Ordering::AcqRel) {
                    task.frame.lock().pc -= 4;
                }
            } else {
                task.restart.store(false, Ordering::Release);
                task.frame.lock().set_return(Errno::EINTR.as_isize());
            }
        }
        _ => {}
    }
    {
        let mut sched = task.sched.lock();
        sched.state = TaskState::Enquable;
        sched.wakeup = None;
    }
    enqueue_task(task);
}

/// Walk the sleeping list, waking everything that is due.
pub fn awaken_tasks() {
    let now = get_time();
    let due: Vec<Arc<Task>> = {
        let mut sleeping = SLEEPING.lock();
        let mut woken = Vec::new();
        let mut index = 0;
        while index < sleeping.len() {
            if should_wake(&sleeping[index], now) {
                woken.push(sleeping.swap_remove(index));
            } else {
                index += 1;
            }
        }
        woken
    };
    for task in due {
        awaken_task(task);
    }
}

/// Explicitly wake one blocked task (I/O completion, signal send).
pub fn wake_task(task: &Arc<Task>) {
    let blocked = matches!(
        task.state(),
        TaskState::Waiting | TaskState::Sleeping | TaskState::Paused | TaskState::WaitChld
    );
    if !blocked {
        return;
    }
    {
        let mut sleeping = SLEEPING.lock();
        if let Some(pos) = sleeping.iter().position(|t| Arc::ptr_eq(t, task)) {
            sleeping.swap_remove(pos);
        }
    }
    awaken_task(task.clone());
}

/// Pull the next runnable task, stealing around the hart ring, falling
/// back to this hart's idle task.
pub fn pull_task(hart: &Arc<Hart>) -> Arc<Task> {
    let mut current = hart.clone();
    loop {
        if let Some(task) = current.queue.pull() {
            return task;
        }
        current = match hart::next_hart(current.index) {
            Some(next) if !Arc::ptr_eq(&next, hart) => next,
            _ => break,
        };
    }
    hart.idle.clone()
}

/// Pick the task that should run next on `hart` and make it current.
///
/// The architecture glue restores the returned task's frame; the host
/// build just records it.
pub fn schedule(hart: &Arc<Hart>) -> Arc<Task> {
    awaken_tasks();
    loop {
        let next = pull_task(hart);
        if next.state() == TaskState::Terminated {
            free_task(&next);
            continue;
        }
        {
            let mut sched = next.sched.lock();
            sched.state = TaskState::Running;
            sched.runs = sched.runs.wrapping_add(1);
        }
        {
            let mut frame = next.frame.lock();
            frame.hart = hart.index + 1;
        }
        next.entered.store(get_time(), Ordering::Release);
        // Deliver signals before re-entering user code; delivery may kill
        // the task, in which case pick another.
        if let Some(process) = next.process() {
            if !crate::process::signal::handle_pending(&next, &process) {
                enqueue_task_on(hart, next);
                continue;
            }
        }
        hart::set_current_task(hart.index, Some(next.clone()));
        return next;
    }
}

/// Timer tick: account the running task's slice and reschedule.
pub fn timer_tick(hart: &Arc<Hart>) -> Arc<Task> {
    if let Some(current) = hart::current_task_on(hart.index) {
        let entered = current.entered.load(Ordering::Acquire);
        let elapsed = get_time().saturating_sub(entered);
        if let Some(process) = current.process() {
            process.times.lock().user_time += elapsed;
        }
        if current.state() == TaskState::Running {
            current.set_state(TaskState::Enquable);
        }
        enqueue_task_on(hart, current);
        hart::set_current_task(hart.index, None);
    }
    schedule(hart)
}

/// When the next timer interrupt should fire on this hart.
pub fn next_timer_deadline(hart: &Arc<Hart>) -> Time {
    let now = get_time();
    let slice = if hart.queue.len() == 0 { IDLE_TIME } else { MAX_TIME };
    let mut deadline = now + slice;
    for task in SLEEPING.lock().iter() {
        let sched = task.sched.lock();
        if sched.state == TaskState::Sleeping && sched.sleeping_until < deadline {
            deadline = sched.sleeping_until.max(now);
        }
    }
    deadline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::hart::test_support::ensure_hart;
    use crate::task::DEFAULT_PRIORITY;

    #[test]
    fn fifo_within_one_priority() {
        let queue = SchedQueue::new();
        let a = Task::new(DEFAULT_PRIORITY);
        let b = Task::new(DEFAULT_PRIORITY);
        queue.push(a.clone());
        queue.push(b.clone());
        assert!(Arc::ptr_eq(&queue.pull().unwrap(), &a));
        assert!(Arc::ptr_eq(&queue.pull().unwrap(), &b));
        assert!(queue.pull().is_none());
    }

    #[test]
    fn higher_priority_runs_first() {
        let queue = SchedQueue::new();
        let low = Task::new(30);
        let high = Task::new(3);
        {
            low.sched.lock().queue_priority = 30;
            high.sched.lock().queue_priority = 3;
        }
        queue.push(low.clone());
        queue.push(high.clone());
        assert!(Arc::ptr_eq(&queue.pull().unwrap(), &high));
        assert!(Arc::ptr_eq(&queue.pull().unwrap(), &low));
    }

    #[test]
    fn aging_lowers_queue_priority_periodically() {
        assert_eq!(aged_priority(10, 1), 10);
        assert_eq!(aged_priority(10, 0), 10);
        assert_eq!(aged_priority(10, PRIORITY_DECREASE), 11);
        assert_eq!(aged_priority(10, PRIORITY_DECREASE * 3), 13);
        // Clamped to the lowest level.
        assert_eq!(aged_priority(38, PRIORITY_DECREASE * 5), LOWEST_PRIORITY);
    }

    #[test]
    fn schedule_falls_back_to_idle() {
        let hart = ensure_hart();
        let _serial = crate::task::hart::test_support::serialize_scheduler();
        let task = schedule(&hart);
        assert!(Arc::ptr_eq(&task, &hart.idle));
        hart::set_current_task(hart.index, None);
    }

    #[test]
    fn sleeping_task_wakes_after_deadline() {
        let hart = ensure_hart();
        let _serial = crate::task::hart::test_support::serialize_scheduler();
        let task = Task::new(DEFAULT_PRIORITY);
        task.park(TaskState::Sleeping, 0, None); // deadline already passed
        enqueue_task_on(&hart, task.clone());
        awaken_tasks();
        assert_eq!(task.state(), TaskState::Ready);
        // Drain the queue so other tests see an empty hart.
        while let Some(t) = hart.queue.pull() {
            let _ = t;
        }
    }

    #[test]
    fn predicate_wakes_waiting_task() {
        let hart = ensure_hart();
        let _serial = crate::task::hart::test_support::serialize_scheduler();
        let task = Task::new(DEFAULT_PRIORITY);
        task.frame.lock().pc = 0x1004;
        task.park(
            TaskState::Waiting,
            0,
            Some(alloc::boxed::Box::new(|_task: &Task| true)),
        );
        task.restart.store(true, Ordering::Release);
        enqueue_task_on(&hart, task.clone());
        awaken_tasks();
        assert_eq!(task.state(), TaskState::Ready);
        // A predicate wakeup rewinds onto the ecall for a restart.
        assert!(!task.restart.load(Ordering::Acquire));
        assert_eq!(task.frame.lock().pc, 0x1000);
        while let Some(t) = hart.queue.pull() {
            let _ = t;
        }
    }
}
