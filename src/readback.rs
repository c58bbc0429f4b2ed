//! Asynchronous device-to-host frame readback
//!
//! The transfer subsystem completes requests out of caller control and in no
//! guaranteed order. [`ReadbackQueue`] restores submission order: the head of
//! the queue is the only entry allowed to emit, and a later completion while
//! the head is still pending forces the head to finish synchronously.
//!
//! The traits here are the seam between the pipeline and whatever graphics
//! backend produces the pixels; [`ImmediateSource`] is the synchronous
//! fallback used by the demo driver (a CPU-side copy that completes at
//! submission time).

use std::collections::VecDeque;

use anyhow::Result;

use crate::logw;

/// Maximum number of in-flight readback requests. Submissions beyond this are
/// refused (frame skipped) rather than letting the queue grow.
pub const MAX_IN_FLIGHT: usize = 6;

/// A pending device-to-host transfer. The payload is valid only once the
/// request reports done.
pub trait Readback: Send {
    fn is_done(&self) -> bool;
    fn has_error(&self) -> bool;
    /// Block until the transfer completes.
    fn wait(&mut self);
    /// Consume the request and return the frame payload.
    fn take(self: Box<Self>) -> Vec<u8>;
}

/// The device side of the capture session: submits readback requests and owns
/// the lazily-created preprocessing transform (color-space/channel-layout
/// normalization applied before readback).
pub trait ReadbackSource {
    /// Opaque frame-buffer handle this source reads from.
    type Frame: ?Sized;

    /// Whether the backend can read frames back asynchronously at all.
    /// Sessions degrade to a no-op stub when this is false.
    fn supports_async_readback(&self) -> bool {
        true
    }

    /// Create the preprocessing transform. Called once, before the first
    /// request of a session.
    fn ensure_preprocess(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the preprocessing transform. Called when the session closes.
    fn release_preprocess(&mut self) {}

    fn request(&mut self, frame: &Self::Frame) -> Box<dyn Readback>;
}

/// FIFO of outstanding readback requests with in-order emission.
#[derive(Default)]
pub struct ReadbackQueue {
    queue: VecDeque<Box<dyn Readback>>,
}

impl ReadbackQueue {
    pub fn new() -> Self {
        Self { queue: VecDeque::with_capacity(4) }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True once the outstanding-request bound is exceeded. Callers check
    /// this before submitting a request to the device.
    pub fn is_full(&self) -> bool {
        self.queue.len() > MAX_IN_FLIGHT
    }

    pub fn push(&mut self, req: Box<dyn Readback>) {
        self.queue.push_back(req);
    }

    /// Emit completed payloads in submission order.
    ///
    /// Stops at the first pending entry, with one exception: if a later entry
    /// completed before the head (out-of-order completion), the head is
    /// forced to complete now. Emitted bytes must stay in submission order.
    pub fn drain(&mut self, mut emit: impl FnMut(Vec<u8>)) {
        loop {
            let head_done = match self.queue.front() {
                None => break,
                Some(req) => req.is_done(),
            };

            if !head_done {
                let second_done = self.queue.get(1).is_some_and(|req| req.is_done());
                if !second_done {
                    // Nothing ready yet.
                    break;
                }
                if let Some(head) = self.queue.front_mut() {
                    head.wait();
                }
            }

            let Some(req) = self.queue.pop_front() else { break };

            if req.has_error() {
                // Prefer stream continuity over one corrupt frame.
                logw!("READBACK", "device readback reported an error; frame dropped");
                continue;
            }

            emit(req.take());
        }
    }
}

/// Synchronous source: copies the frame on the calling thread and hands back
/// an already-completed request. Useful when the backend has no async
/// transfer path, and as the demo driver's source.
#[derive(Default)]
pub struct ImmediateSource;

impl ImmediateSource {
    pub fn new() -> Self {
        Self
    }
}

impl ReadbackSource for ImmediateSource {
    type Frame = [u8];

    fn request(&mut self, frame: &[u8]) -> Box<dyn Readback> {
        Box::new(ImmediateReadback { data: frame.to_vec() })
    }
}

/// A readback that completed at submission time.
pub struct ImmediateReadback {
    data: Vec<u8>,
}

impl Readback for ImmediateReadback {
    fn is_done(&self) -> bool {
        true
    }

    fn has_error(&self) -> bool {
        false
    }

    fn wait(&mut self) {}

    fn take(self: Box<Self>) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Test double with externally scripted completion.
    struct Scripted {
        data: Vec<u8>,
        done: Arc<AtomicBool>,
        error: bool,
        forced: Arc<AtomicBool>,
    }

    impl Scripted {
        fn pending(data: Vec<u8>) -> (Self, Arc<AtomicBool>, Arc<AtomicBool>) {
            let done = Arc::new(AtomicBool::new(false));
            let forced = Arc::new(AtomicBool::new(false));
            let req = Self {
                data,
                done: done.clone(),
                error: false,
                forced: forced.clone(),
            };
            (req, done, forced)
        }

        fn completed(data: Vec<u8>) -> Self {
            let (req, done, _) = Self::pending(data);
            done.store(true, Ordering::SeqCst);
            req
        }

        fn failed() -> Self {
            let (mut req, done, _) = Self::pending(vec![0xEE]);
            req.error = true;
            done.store(true, Ordering::SeqCst);
            req
        }
    }

    impl Readback for Scripted {
        fn is_done(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }

        fn has_error(&self) -> bool {
            self.error
        }

        fn wait(&mut self) {
            self.done.store(true, Ordering::SeqCst);
            self.forced.store(true, Ordering::SeqCst);
        }

        fn take(self: Box<Self>) -> Vec<u8> {
            self.data
        }
    }

    fn collect(queue: &mut ReadbackQueue) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        queue.drain(|bytes| out.push(bytes));
        out
    }

    #[test]
    fn drains_completed_requests_in_order() {
        let mut q = ReadbackQueue::new();
        q.push(Box::new(Scripted::completed(vec![1])));
        q.push(Box::new(Scripted::completed(vec![2])));
        q.push(Box::new(Scripted::completed(vec![3])));
        assert_eq!(collect(&mut q), vec![vec![1], vec![2], vec![3]]);
        assert!(q.is_empty());
    }

    #[test]
    fn stops_at_pending_head() {
        let mut q = ReadbackQueue::new();
        let (head, done, _) = Scripted::pending(vec![1]);
        q.push(Box::new(head));
        assert!(collect(&mut q).is_empty());
        assert_eq!(q.len(), 1);

        done.store(true, Ordering::SeqCst);
        assert_eq!(collect(&mut q), vec![vec![1]]);
    }

    #[test]
    fn out_of_order_completion_forces_head() {
        let mut q = ReadbackQueue::new();
        let (head, _done, forced) = Scripted::pending(vec![1]);
        q.push(Box::new(head));
        q.push(Box::new(Scripted::completed(vec![2])));

        // Second entry finished first; the head must be forced so emission
        // order still matches submission order.
        assert_eq!(collect(&mut q), vec![vec![1], vec![2]]);
        assert!(forced.load(Ordering::SeqCst));
    }

    #[test]
    fn errored_request_is_dropped_and_stream_continues() {
        let mut q = ReadbackQueue::new();
        q.push(Box::new(Scripted::completed(vec![1])));
        q.push(Box::new(Scripted::failed()));
        q.push(Box::new(Scripted::completed(vec![3])));
        assert_eq!(collect(&mut q), vec![vec![1], vec![3]]);
    }

    #[test]
    fn reports_full_past_the_bound() {
        let mut q = ReadbackQueue::new();
        for _ in 0..=MAX_IN_FLIGHT {
            assert!(!q.is_full());
            let (req, _, _) = Scripted::pending(vec![0]);
            q.push(Box::new(req));
        }
        assert!(q.is_full());
    }
}
