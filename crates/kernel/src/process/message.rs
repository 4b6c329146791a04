// Message queues
//
// Each task holds a bounded FIFO of messages. Posting to a task in
// WAITMESSAGE wakes it. EWM_DRAW is the single coalesced id: a new draw
// for a target replaces the undispatched one (moving it to the back with
// fresh parameters) so redraws never accumulate. Overflow drops the
// oldest non-draw message and latches a flag on the queue.

use super::{task, TaskId};
use crate::klib::{KernelError, Result};
use crate::time;
use alloc::collections::VecDeque;
use spin::{Mutex, RwLock};

/// Capacity of every task message queue.
pub const TASK_MESSAGE_QUEUE_MAX_MESSAGES: usize = 64;

/// Quit request; `get_message` returns `None` after delivering it.
pub const ETM_QUIT: u32 = 0x0001;
/// Redraw request; the only coalesced message id.
pub const EWM_DRAW: u32 = 0x0400;

/// One queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Handle the message is addressed to (task id or window handle).
    pub target: u32,
    /// Queue insertion time, milliseconds.
    pub timestamp: u64,
    pub id: u32,
    pub param1: u32,
    pub param2: u32,
}

struct QueueState {
    messages: VecDeque<Message>,
    overflowed: bool,
}

/// Bounded FIFO owned by a task (and by each process for its own
/// notifications).
pub struct MessageQueue {
    state: Mutex<QueueState>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                overflowed: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the queue has ever dropped a message to make room.
    pub fn overflowed(&self) -> bool {
        self.state.lock().overflowed
    }

    /// Append a message, applying the draw-coalescing and overflow
    /// policies.
    pub fn post(&self, mut message: Message) {
        message.timestamp = time::system_time();
        let mut state = self.state.lock();

        if message.id == EWM_DRAW {
            // An undispatched draw for the same target is re-armed at
            // the back instead of queueing a second one.
            if let Some(position) = state
                .messages
                .iter()
                .position(|m| m.id == EWM_DRAW && m.target == message.target)
            {
                state.messages.remove(position);
            }
        }

        if state.messages.len() >= TASK_MESSAGE_QUEUE_MAX_MESSAGES {
            // Sacrifice the oldest non-draw message.
            match state.messages.iter().position(|m| m.id != EWM_DRAW) {
                Some(position) => {
                    state.messages.remove(position);
                }
                None => {
                    state.messages.pop_front();
                }
            }
            state.overflowed = true;
        }

        state.messages.push_back(message);
    }

    /// Pop the first message, or the first one addressed to `target`.
    pub fn take(&self, target: Option<u32>) -> Option<Message> {
        let mut state = self.state.lock();
        match target {
            None => state.messages.pop_front(),
            Some(target) => {
                let position = state.messages.iter().position(|m| m.target == target)?;
                state.messages.remove(position)
            }
        }
    }

    /// Drop every queued message (task teardown).
    pub fn clear(&self) {
        self.state.lock().messages.clear();
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> alloc::vec::Vec<Message> {
        self.state.lock().messages.iter().copied().collect()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Route from a window handle to its owning task, provided by the GUI
/// collaborator when present.
static WINDOW_ROUTER: RwLock<Option<fn(u32) -> Option<TaskId>>> = RwLock::new(None);

pub fn register_window_router(router: fn(u32) -> Option<TaskId>) {
    *WINDOW_ROUTER.write() = Some(router);
}

/// Post a message to a task (by id) or to a window (routed to the task
/// owning it). Wakes the receiving task if it sits in WAITMESSAGE.
pub fn post_message(target: u32, id: u32, param1: u32, param2: u32) -> Result<()> {
    let _task_lock = crate::sync::lock_task();
    let _desktop_lock = crate::sync::lock_desktop();

    let receiver = match task::get_task(TaskId(target)) {
        Some(receiver) => receiver,
        None => {
            let router = *WINDOW_ROUTER.read();
            let owner = router
                .and_then(|route| route(target))
                .ok_or(KernelError::NotFound)?;
            task::get_task(owner).ok_or(KernelError::NotFound)?
        }
    };

    receiver.messages.post(Message {
        target,
        timestamp: 0,
        id,
        param1,
        param2,
    });

    if receiver.state() == super::TaskState::WaitMessage {
        super::scheduler::wake_task(receiver.id);
    }

    Ok(())
}

/// Fetch the next message for the current task, parking in WAITMESSAGE
/// while the queue is empty. Returns `None` once ETM_QUIT arrives.
pub fn get_message(target: Option<u32>) -> Option<Message> {
    let task = super::current_task()?;

    loop {
        if let Some(message) = task.messages.take(target) {
            if message.id == ETM_QUIT {
                return None;
            }
            return Some(message);
        }

        super::scheduler::block_current(super::TaskState::WaitMessage, time::INFINITY);

        // Parked without a scheduler (boot, host): report empty rather
        // than spin.
        if task.messages.is_empty() && !crate::kernel_ready() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw(target: u32, p1: u32) -> Message {
        Message {
            target,
            timestamp: 0,
            id: EWM_DRAW,
            param1: p1,
            param2: 0,
        }
    }

    fn plain(id: u32) -> Message {
        Message {
            target: 9,
            timestamp: 0,
            id,
            param1: 0,
            param2: 0,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = MessageQueue::new();
        queue.post(plain(10));
        queue.post(plain(11));
        queue.post(plain(12));
        assert_eq!(queue.take(None).unwrap().id, 10);
        assert_eq!(queue.take(None).unwrap().id, 11);
        assert_eq!(queue.take(None).unwrap().id, 12);
    }

    #[test]
    fn draw_messages_coalesce_per_target() {
        let queue = MessageQueue::new();
        queue.post(draw(1, 100));
        queue.post(plain(42));
        queue.post(draw(2, 200));
        // Re-posting target 1's draw replaces it and moves it back.
        queue.post(draw(1, 300));

        let order: alloc::vec::Vec<(u32, u32, u32)> = queue
            .snapshot()
            .iter()
            .map(|m| (m.id, m.target, m.param1))
            .collect();
        assert_eq!(
            order,
            alloc::vec![(42, 9, 0), (EWM_DRAW, 2, 200), (EWM_DRAW, 1, 300)]
        );
    }

    #[test]
    fn non_draw_messages_queue_verbatim() {
        let queue = MessageQueue::new();
        queue.post(plain(7));
        queue.post(plain(7));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn overflow_drops_oldest_non_draw() {
        let queue = MessageQueue::new();
        queue.post(draw(1, 0));
        for n in 0..TASK_MESSAGE_QUEUE_MAX_MESSAGES as u32 - 1 {
            queue.post(plain(100 + n));
        }
        assert_eq!(queue.len(), TASK_MESSAGE_QUEUE_MAX_MESSAGES);
        assert!(!queue.overflowed());

        queue.post(plain(999));
        assert_eq!(queue.len(), TASK_MESSAGE_QUEUE_MAX_MESSAGES);
        assert!(queue.overflowed());
        // The draw survived; the oldest plain message (100) is gone.
        let ids: alloc::vec::Vec<u32> = queue.snapshot().iter().map(|m| m.id).collect();
        assert!(ids.contains(&EWM_DRAW));
        assert!(!ids.contains(&100));
        assert!(ids.contains(&999));
    }

    #[test]
    fn take_by_target_filters() {
        let queue = MessageQueue::new();
        queue.post(Message { target: 5, timestamp: 0, id: 1, param1: 0, param2: 0 });
        queue.post(Message { target: 6, timestamp: 0, id: 2, param1: 0, param2: 0 });
        let taken = queue.take(Some(6)).unwrap();
        assert_eq!(taken.id, 2);
        assert_eq!(queue.len(), 1);
    }
}
