//! Signals.
//!
//! Pending signals form an ordered queue per process; delivery happens on
//! every return to the task, before user code resumes. SIGKILL and
//! SIGSTOP ignore the mask and cannot be caught. Handler invocation
//! pushes a restore frame onto the user stack that sigreturn pops.

use super::{signal_status, Process};
use crate::error::{Errno, Result};
use crate::syscall::uaccess;
use crate::task::{Reg, Task};
use crate::time::{get_time, Time};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

pub type SignalSet = u64;

pub const SIG_COUNT: usize = 34;

/// Handler sentinels.
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

/// sigaction flags; only NODEFER changes delivery here.
pub const SA_NODEFER: u32 = 1 << 6;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGTRAP = 5,
    SIGABRT = 6,
    SIGBUS = 7,
    SIGEMT = 8,
    SIGFPE = 9,
    SIGKILL = 10,
    SIGUSR1 = 11,
    SIGSEGV = 12,
    SIGUSR2 = 13,
    SIGPIPE = 14,
    SIGALRM = 15,
    SIGTERM = 16,
    SIGSTKFLT = 17,
    SIGCHLD = 18,
    SIGCONT = 19,
    SIGSTOP = 20,
    SIGTSTP = 21,
    SIGTTIN = 22,
    SIGTTOU = 23,
    SIGURG = 24,
    SIGXCPU = 25,
    SIGXFSZ = 26,
    SIGVTALRM = 27,
    SIGPROF = 28,
    SIGWINCH = 29,
    SIGIO = 30,
    SIGPWR = 31,
    SIGLOST = 32,
    SIGSYS = 33,
}

impl Signal {
    pub fn from_u32(value: u32) -> Option<Signal> {
        if value >= 1 && (value as usize) < SIG_COUNT {
            // Safe: the enum is a dense range starting at 1.
            Some(unsafe { core::mem::transmute::<u32, Signal>(value) })
        } else {
            None
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    fn bit(self) -> SignalSet {
        1 << (self.to_u32() - 1)
    }

    /// SIGKILL and SIGSTOP bypass masks and handlers.
    pub fn is_unblockable(self) -> bool {
        matches!(self, Signal::SIGKILL | Signal::SIGSTOP)
    }

    /// Signals whose default disposition is to be dropped.
    pub fn default_ignored(self) -> bool {
        matches!(self, Signal::SIGCHLD | Signal::SIGURG | Signal::SIGWINCH)
    }
}

/// One handler slot. The layout matches what sigaction copies from user
/// space: handler, added mask, flags word, restorer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: usize,
    pub mask: SignalSet,
    pub flags: u32,
    pub _reserved: u32,
    pub restorer: usize,
}

impl SigAction {
    pub const fn default_action() -> Self {
        Self {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
            _reserved: 0,
            restorer: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&(self.handler as u64).to_le_bytes());
        bytes[8..16].copy_from_slice(&self.mask.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.flags.to_le_bytes());
        bytes[24..32].copy_from_slice(&(self.restorer as u64).to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            handler: u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize,
            mask: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            _reserved: 0,
            restorer: u64::from_le_bytes(bytes[24..32].try_into().unwrap()) as usize,
        }
    }
}

struct SignalsInner {
    pending: VecDeque<Signal>,
    mask: SignalSet,
    handlers: [SigAction; SIG_COUNT],
    current: u32,
    restore_frame: usize,
    alarm_at: Time,
}

pub struct SignalState {
    inner: Mutex<SignalsInner>,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SignalsInner {
                pending: VecDeque::new(),
                mask: 0,
                handlers: [SigAction::default_action(); SIG_COUNT],
                current: 0,
                restore_frame: 0,
                alarm_at: 0,
            }),
        }
    }

    /// Fork inherits handlers and mask but not pending signals.
    pub fn inherit_from(&self, parent: &SignalState) {
        let parent = parent.inner.lock();
        let mut own = self.inner.lock();
        own.mask = parent.mask;
        own.handlers = parent.handlers;
    }

    pub fn push(&self, sig: Signal) {
        self.inner.lock().pending.push_back(sig);
    }

    pub fn has_pending(&self, sig: Signal) -> bool {
        self.inner.lock().pending.contains(&sig)
    }

    /// Is any pending signal deliverable under the current mask?
    pub fn has_deliverable(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .pending
            .iter()
            .any(|sig| sig.is_unblockable() || inner.mask & sig.bit() == 0)
        || (inner.alarm_at != 0 && get_time() >= inner.alarm_at)
    }

    /// Pop the first pending signal not blocked by the mask.
    fn take_deliverable(&self) -> Option<Signal> {
        let mut inner = self.inner.lock();
        let pos = inner
            .pending
            .iter()
            .position(|sig| sig.is_unblockable() || inner.mask & sig.bit() == 0)?;
        inner.pending.remove(pos)
    }

    pub fn handler(&self, sig: Signal) -> SigAction {
        self.inner.lock().handlers[sig.to_u32() as usize]
    }

    pub fn set_handler(&self, sig: Signal, action: SigAction) -> SigAction {
        let mut inner = self.inner.lock();
        let old = inner.handlers[sig.to_u32() as usize];
        inner.handlers[sig.to_u32() as usize] = action;
        old
    }

    pub fn pending_set(&self) -> SignalSet {
        let inner = self.inner.lock();
        let mut set = 0;
        for sig in inner.pending.iter() {
            set |= sig.bit();
        }
        set & inner.mask
    }

    pub fn mask(&self) -> SignalSet {
        self.inner.lock().mask
    }

    pub fn set_mask(&self, mask: SignalSet) -> SignalSet {
        let mut inner = self.inner.lock();
        let old = inner.mask;
        inner.mask = mask;
        old
    }

    pub fn block(&self, set: SignalSet) -> SignalSet {
        let mut inner = self.inner.lock();
        let old = inner.mask;
        inner.mask |= set;
        old
    }

    pub fn unblock(&self, set: SignalSet) -> SignalSet {
        let mut inner = self.inner.lock();
        let old = inner.mask;
        inner.mask &= !set;
        old
    }

    /// Arm the alarm; returns whole seconds left on the previous one.
    pub fn set_alarm(&self, at: Time) -> Time {
        let mut inner = self.inner.lock();
        let previous = inner.alarm_at;
        inner.alarm_at = at;
        previous
    }
}

/// Queue a signal and kick the receiving task out of any blocked state.
pub fn send_signal(process: &Arc<Process>, sig: Signal) {
    process.signals.push(sig);
    if let Some(task) = process.main_task() {
        crate::task::sched::wake_task(&task);
    }
}

/// The restore frame pushed below the user stack pointer, field order
/// matching the pushes in `invoke_handler`.
const RESTORE_FRAME_WORDS: usize = 31 + 32 + 4;

fn invoke_handler(task: &Task, process: &Arc<Process>, sig: Signal, action: SigAction) -> bool {
    let space = process.space();
    let mut frame = task.frame.lock();
    let mut sp = frame.get(Reg::Sp);

    let mut words = [0u64; RESTORE_FRAME_WORDS];
    let (prev_mask, prev_restore, prev_current) = {
        let inner = process.signals.inner.lock();
        (inner.mask, inner.restore_frame, inner.current)
    };
    words[0] = prev_mask;
    words[1] = prev_restore as u64;
    words[2] = prev_current as u64;
    words[3] = frame.pc as u64;
    for (i, freg) in frame.fregs.iter().enumerate() {
        words[4 + i] = freg.to_bits();
    }
    for (i, reg) in frame.regs.iter().enumerate() {
        words[4 + 32 + i] = *reg as u64;
    }
    sp -= RESTORE_FRAME_WORDS * 8;
    let mut bytes = [0u8; RESTORE_FRAME_WORDS * 8];
    for (i, word) in words.iter().enumerate() {
        bytes[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
    }
    if uaccess::copy_to_user(&space, sp, &bytes).is_err() {
        // Cannot build the frame; fall back to the default disposition.
        super::exit_process(process, signal_status(sig.to_u32()));
        return false;
    }

    {
        let mut inner = process.signals.inner.lock();
        inner.mask |= action.mask;
        if action.flags & SA_NODEFER == 0 {
            inner.mask |= sig.bit();
        }
        inner.restore_frame = sp;
        inner.current = sig.to_u32();
    }
    frame.pc = action.handler;
    frame.set(Reg::Sp, sp);
    frame.set(Reg::A0, sig.to_u32() as usize);
    frame.set(Reg::Ra, action.restorer);
    true
}

/// Deliver one pending signal (or a due alarm) to the task. Returns false
/// when delivery terminated the process.
pub fn handle_pending(task: &Arc<Task>, process: &Arc<Process>) -> bool {
    let sig = match process.signals.take_deliverable() {
        Some(sig) => sig,
        None => {
            // Alarm expiry turns into a one-shot SIGALRM.
            let due = {
                let mut inner = process.signals.inner.lock();
                if inner.alarm_at != 0 && get_time() >= inner.alarm_at {
                    inner.alarm_at = 0;
                    true
                } else {
                    false
                }
            };
            if !due {
                return true;
            }
            Signal::SIGALRM
        }
    };

    if sig.is_unblockable() {
        super::exit_process(process, signal_status(sig.to_u32()));
        return false;
    }
    let action = process.signals.handler(sig);
    match action.handler {
        SIG_DFL => {
            if sig.default_ignored() {
                true
            } else {
                super::exit_process(process, signal_status(sig.to_u32()));
                false
            }
        }
        SIG_IGN => true,
        _ => invoke_handler(task, process, sig, action),
    }
}

/// Pop the restore frame pushed by `invoke_handler`.
pub fn sigreturn(task: &Arc<Task>, process: &Arc<Process>) -> Result<()> {
    let (restore_frame, in_handler) = {
        let inner = process.signals.inner.lock();
        (inner.restore_frame, inner.current != 0)
    };
    if !in_handler {
        return Err(Errno::EINVAL);
    }
    let space = process.space();
    let mut bytes = [0u8; RESTORE_FRAME_WORDS * 8];
    uaccess::copy_from_user(&space, restore_frame, &mut bytes)?;
    let mut words = [0u64; RESTORE_FRAME_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
    }
    {
        let mut frame = task.frame.lock();
        frame.pc = words[3] as usize;
        for i in 0..32 {
            frame.fregs[i] = f64::from_bits(words[4 + i]);
        }
        for i in 0..31 {
            frame.regs[i] = words[4 + 32 + i] as usize;
        }
    }
    {
        let mut inner = process.signals.inner.lock();
        inner.mask = words[0];
        inner.restore_frame = words[1] as usize;
        inner.current = words[2] as u32;
    }
    Ok(())
}
