//! Tick-thread work queue
//!
//! Background threads (the control server, mainly) must not touch capture
//! state directly; they post closures here and the driver loop runs them at
//! the top of each tick. An explicit queue owned by the driver, not a
//! process-wide singleton.

use crossbeam_channel::{unbounded, Receiver, Sender};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Posting half. Cheap to clone and hand to background threads.
pub struct TickQueue<S> {
    tx: Sender<Job<S>>,
}

/// Draining half, owned by the driver loop.
pub struct TickRunner<S> {
    rx: Receiver<Job<S>>,
}

pub fn tick_queue<S>() -> (TickQueue<S>, TickRunner<S>) {
    let (tx, rx) = unbounded();
    (TickQueue { tx }, TickRunner { rx })
}

impl<S> TickQueue<S> {
    /// Queue `job` to run on the driver thread at the next tick. Jobs posted
    /// after the runner is gone are silently discarded (the loop is shutting
    /// down).
    pub fn post(&self, job: impl FnOnce(&mut S) + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }
}

// Manual impl: #[derive(Clone)] would demand S: Clone.
impl<S> Clone for TickQueue<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S> TickRunner<S> {
    /// Run every queued job against `state`, in posting order.
    pub fn run_pending(&self, state: &mut S) {
        while let Ok(job) = self.rx.try_recv() {
            job(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_run_in_posting_order() {
        let (queue, runner) = tick_queue::<Vec<u32>>();
        queue.post(|v| v.push(1));
        queue.post(|v| v.push(2));
        queue.post(|v| v.push(3));

        let mut state = Vec::new();
        runner.run_pending(&mut state);
        assert_eq!(state, vec![1, 2, 3]);

        // Nothing pending: run is a no-op.
        runner.run_pending(&mut state);
        assert_eq!(state, vec![1, 2, 3]);
    }

    #[test]
    fn posting_from_another_thread() {
        let (queue, runner) = tick_queue::<u32>();
        let handle = std::thread::spawn(move || queue.post(|n| *n += 41));
        handle.join().unwrap();

        let mut state = 1u32;
        runner.run_pending(&mut state);
        assert_eq!(state, 42);
    }
}
