use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::job::JobId;

/// The delayed re-publications of the suspended jobs.
///
/// Jobs waiting for their back-off are parked here; a pump thread pops them when due and puts
/// them back on the worker queue.
#[derive(Debug, Default)]
pub(crate) struct DelayQueue {
    state: Mutex<DelayState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct DelayState {
    heap: BinaryHeap<Reverse<(Instant, JobId)>>,
    stopped: bool,
}

impl DelayQueue {
    /// Make a new empty queue.
    pub fn new() -> DelayQueue {
        Default::default()
    }

    /// Park a job until the given instant.
    pub fn push(&self, due: Instant, id: JobId) {
        let mut state = self.state.lock().unwrap();
        state.heap.push(Reverse((due, id)));
        self.changed.notify_one();
    }

    /// Block until a job is due and return it, or `None` when the queue is stopped.
    pub fn next(&self) -> Option<JobId> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                return None;
            }
            match state.heap.peek() {
                Some(&Reverse((due, _))) => {
                    let now = Instant::now();
                    if due <= now {
                        let Reverse((_, id)) = state.heap.pop().unwrap();
                        return Some(id);
                    }
                    let (guard, _) = self.changed.wait_timeout(state, due - now).unwrap();
                    state = guard;
                }
                None => {
                    state = self.changed.wait(state).unwrap();
                }
            }
        }
    }

    /// Stop the queue: `next` returns `None` from now on.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_pops_in_due_order() {
        let queue = DelayQueue::new();
        let now = Instant::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.push(now + Duration::from_millis(50), second);
        queue.push(now, first);
        assert_eq!(queue.next(), Some(first));
        assert_eq!(queue.next(), Some(second));
    }

    #[test]
    fn test_stop_unblocks() {
        use std::sync::Arc;

        let queue = Arc::new(DelayQueue::new());
        let other = queue.clone();
        let thr = std::thread::spawn(move || other.next());
        std::thread::sleep(Duration::from_millis(100));
        queue.stop();
        assert_eq!(thr.join().unwrap(), None);
    }
}
