// Deferred deletion - epoch-style reclamation of GPU resources
//
// A resource that may still be referenced by an in-flight command buffer is
// never destroyed directly. Its owner pushes a destruction closure here and the
// render loop runs it once the frame counter has advanced far enough.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// A zero-argument destructive action, run exactly once.
pub type DeletionAction = Box<dyn FnOnce() + Send + 'static>;

/// A destruction queued at a given frame. Immutable once queued.
struct PendingDeletion {
    action: DeletionAction,
    frame_queued: u64,
}

struct QueueState {
    // Non-decreasing in frame_queued, so only the front can ever mature
    pending: VecDeque<PendingDeletion>,
    current_frame: u64,
}

/// Delayed-destructor queue keyed by frame number.
///
/// `push`/`enqueue` may be called from any thread. `flush` and `flush_all`
/// belong to the thread driving the render loop; calling them concurrently
/// from several threads is not supported.
pub struct DeletionQueue {
    state: Mutex<QueueState>,
    delay: u64,
}

impl DeletionQueue {
    /// Create a queue that holds each action for `delay` frames.
    ///
    /// `delay` must be at least the number of frames in flight, otherwise a
    /// resource can be released while a submission still references it.
    pub fn new(delay: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current_frame: 0,
            }),
            delay,
        }
    }

    /// Queue a destruction stamped with the current frame counter.
    pub fn push<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Some(Box::new(action)));
    }

    /// Queue an optional action. `None` is logged and dropped.
    pub fn enqueue(&self, action: Option<DeletionAction>) {
        let Some(action) = action else {
            log::warn!("Ignoring empty deletion action");
            return;
        };

        let mut state = self.state.lock();
        let frame_queued = state.current_frame;
        state.pending.push_back(PendingDeletion {
            action,
            frame_queued,
        });
    }

    /// Advance the frame counter and run every action old enough to be safe.
    ///
    /// Returns the number of actions run.
    pub fn flush(&self, current_frame: u64) -> usize {
        let ready: Vec<DeletionAction> = {
            let mut state = self.state.lock();
            state.current_frame = current_frame;

            let mut ready = Vec::new();
            while let Some(front) = state.pending.front() {
                if !Self::is_aged(front.frame_queued, current_frame, self.delay) {
                    break;
                }
                if let Some(entry) = state.pending.pop_front() {
                    ready.push(entry.action);
                }
            }
            ready
        };

        // Run outside the lock so an action can push follow-up deletions
        let count = ready.len();
        for action in ready {
            action();
        }

        if count > 0 {
            log::trace!("Frame {}: released {} deferred resources", current_frame, count);
        }
        count
    }

    /// Run every pending action regardless of age.
    ///
    /// Only valid once the device is idle; anything earlier defeats the queue.
    pub fn flush_all(&self) -> usize {
        let mut count = 0;
        // Loop so actions pushed by other actions are drained too
        loop {
            let drained: Vec<PendingDeletion> = self.state.lock().pending.drain(..).collect();
            if drained.is_empty() {
                break;
            }
            count += drained.len();
            for entry in drained {
                (entry.action)();
            }
        }

        if count > 0 {
            log::info!("Released {} deferred resources", count);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn current_frame(&self) -> u64 {
        self.state.lock().current_frame
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    /// Age is signed: a counter that wrapped or restarted yields a negative
    /// age, which counts as fully aged instead of stalling the queue.
    fn is_aged(frame_queued: u64, current_frame: u64, delay: u64) -> bool {
        let age = current_frame.wrapping_sub(frame_queued) as i64;
        age < 0 || age as u64 >= delay
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        let pending = self.state.get_mut().pending.len();
        if pending > 0 {
            log::warn!(
                "Deletion queue dropped with {} pending actions; running them now",
                pending
            );
            self.flush_all();
        }
    }
}
