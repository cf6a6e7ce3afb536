//! Inter-hart messaging.
//!
//! A single global slot carries one message to one recipient at a time.
//! Two locks implement the handshake: the producer lock serializes
//! senders, the slot lock protects the payload until the target consumes
//! it. Delivery rides on the machine-mode software interrupt; the boot
//! glue registers the trigger.

use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HartMessage {
    None,
    /// Bring a secondary hart into the scheduler.
    InitHart,
    /// Another hart panicked; halt.
    Panic,
    /// Give up the current task and reschedule.
    YieldTask,
}

struct MessageSlot {
    target: usize,
    message: HartMessage,
}

static PRODUCER: Mutex<()> = Mutex::new(());
static SLOT: Mutex<MessageSlot> = Mutex::new(MessageSlot {
    target: 0,
    message: HartMessage::None,
});

/// Raises the software interrupt on a hart; installed by the boot glue.
static TRIGGER: Mutex<Option<fn(usize)>> = Mutex::new(None);

pub fn set_trigger(trigger: fn(usize)) {
    *TRIGGER.lock() = Some(trigger);
}

/// Post `message` to `target` and wait until it is taken.
pub fn send_message(target: usize, message: HartMessage) {
    let _producer = PRODUCER.lock();
    {
        let mut slot = SLOT.lock();
        slot.target = target;
        slot.message = message;
    }
    let trigger = *TRIGGER.lock();
    match trigger {
        Some(trigger) => {
            trigger(target);
            // Hold the producer lock until the recipient consumed the slot.
            while SLOT.lock().message != HartMessage::None {
                core::hint::spin_loop();
            }
        }
        None => {
            // No interrupt path (single hart or host build): handle inline.
            handle_message(target);
        }
    }
}

/// Consume a pending message addressed to `hart_id`. Called from the
/// software-interrupt path.
pub fn handle_message(hart_id: usize) {
    let message = {
        let mut slot = SLOT.lock();
        if slot.message == HartMessage::None || slot.target != hart_id {
            return;
        }
        let message = slot.message;
        slot.message = HartMessage::None;
        message
    };
    match message {
        HartMessage::None => {}
        HartMessage::InitHart => {
            super::hart::setup_hart(hart_id);
        }
        HartMessage::Panic => {
            crate::panic::halt_this_hart();
        }
        HartMessage::YieldTask => {
            if let Some(hart) = super::hart::hart_by_id(hart_id) {
                if let Some(current) = super::hart::current_task_on(hart.index) {
                    if current.state() == super::TaskState::Running {
                        current.set_state(super::TaskState::Enquable);
                    }
                    super::sched::enqueue_task_on(&hart, current);
                    super::hart::set_current_task(hart.index, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_slot_round_trip() {
        let _serial = crate::task::hart::test_support::serialize_scheduler();
        // Without a trigger the message is handled inline and the slot
        // drains back to None.
        send_message(0, HartMessage::YieldTask);
        assert_eq!(SLOT.lock().message, HartMessage::None);
    }
}
