//! Encoder pipe (two-stage staging pipeline)
//!
//! The render thread must never block on process I/O, so frames travel
//! through two worker stages before reaching the encoder's stdin:
//!
//!   producer → copy stage (pooled staging buffers) → write stage → stdin
//!
//! Each stage is a named thread fed by a crossbeam channel. The write-stage
//! channel is bounded, which makes the backlog limit structural: the copy
//! stage blocks handing off a staged buffer while the encoder is behind, and
//! [`EncoderPipe::sync_and_throttle`] blocks the producer until every
//! accepted payload has been staged. That pair is the pipeline's only
//! backpressure mechanism.
//!
//! Write errors (broken pipe when the encoder already exited) are logged and
//! swallowed here; the session notices process death through its own
//! lifecycle and stops pushing.

use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::logging;
use crate::{loge, logi, logw};

/// Maximum staged buffers waiting on the write stage. When a slow codec
/// (HEVC, ProRes) falls behind, the producer is throttled at this depth
/// instead of queueing frames until memory runs out.
pub const WRITE_BACKLOG_LIMIT: usize = 4;

/// How long `close` waits for the encoder to exit before killing it.
const EXIT_WAIT_LIMIT: Duration = Duration::from_secs(10);

pub struct EncoderPipe {
    // Dropping this sender is the shutdown signal for both stages.
    frames_tx: Option<Sender<Vec<u8>>>,
    copied_rx: Receiver<()>,
    // Payloads handed to the copy stage vs. staging acknowledgements
    // consumed back. The channel length alone cannot stand in for this:
    // the copy stage pops a payload before staging it, so the frame
    // channel can look empty while one copy is still in flight.
    sent: AtomicUsize,
    acked: AtomicUsize,
    // Length probe only; never received from.
    staged_probe: Receiver<Vec<u8>>,
    copy_join: Option<JoinHandle<()>>,
    write_join: Option<JoinHandle<()>>,
    child: Option<Child>,
    stderr: Option<ChildStderr>,
    closed: bool,
}

impl EncoderPipe {
    /// Spawn the encoder process with stdin/stdout/stderr redirected and
    /// start both pipeline stages. stdout is streamed into the log; stderr
    /// is collected and returned from [`close_and_collect_diagnostics`].
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start encoder process '{program}'"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("encoder stdin was not captured"))?;

        if let Some(out) = child.stdout.take() {
            logging::spawn_pipe_thread("encoder_out", "ENCODER", out, false);
        }
        let stderr = child.stderr.take();

        let (frames_tx, frames_rx) = unbounded::<Vec<u8>>();
        let (staged_tx, staged_rx) = bounded::<Vec<u8>>(WRITE_BACKLOG_LIMIT);
        let (free_tx, free_rx) = unbounded::<Vec<u8>>();
        let (copied_tx, copied_rx) = unbounded::<()>();
        let staged_probe = staged_rx.clone();

        let copy_join = thread::Builder::new()
            .name("pipe_copy".to_string())
            .spawn(move || copy_stage(frames_rx, staged_tx, free_rx, copied_tx))
            .context("failed to spawn copy stage")?;

        let write_join = thread::Builder::new()
            .name("pipe_write".to_string())
            .spawn(move || write_stage(staged_rx, free_tx, stdin))
            .context("failed to spawn write stage")?;

        Ok(Self {
            frames_tx: Some(frames_tx),
            copied_rx,
            sent: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
            staged_probe,
            copy_join: Some(copy_join),
            write_join: Some(write_join),
            child: Some(child),
            stderr,
            closed: false,
        })
    }

    /// Hand one frame's raw bytes to the copy stage. Never blocks.
    pub fn enqueue(&self, payload: Vec<u8>) {
        if let Some(tx) = &self.frames_tx {
            if tx.send(payload).is_ok() {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Block until every accepted payload has been staged, including the one
    /// the copy stage may already hold in hand.
    ///
    /// The write backlog is capped by the bounded staged channel, so once
    /// this returns at most `WRITE_BACKLOG_LIMIT` staged frames (plus one in
    /// flight at the write stage) remain downstream.
    pub fn sync_and_throttle(&self) {
        if self.frames_tx.is_none() {
            return;
        }
        loop {
            self.drain_copy_acks();
            if self.acked.load(Ordering::Relaxed) >= self.sent.load(Ordering::Relaxed) {
                return;
            }
            match self.copied_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(()) => {
                    self.acked.fetch_add(1, Ordering::Relaxed);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Frames accepted by `enqueue` but not yet staged.
    pub fn pending_copies(&self) -> usize {
        self.drain_copy_acks();
        let sent = self.sent.load(Ordering::Relaxed);
        let acked = self.acked.load(Ordering::Relaxed);
        sent.saturating_sub(acked)
    }

    // Consume staging acknowledgements that piled up since the producer
    // last looked.
    fn drain_copy_acks(&self) {
        while self.copied_rx.try_recv().is_ok() {
            self.acked.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Staged buffers waiting on the write stage.
    pub fn write_backlog(&self) -> usize {
        self.staged_probe.len()
    }

    /// Whether the encoder process is still running.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Drain both stages, close the encoder's stdin, wait for the process to
    /// exit, and return everything it printed on stderr. The encoder may use
    /// stderr for informational text, so the caller decides how loudly to
    /// surface it.
    pub fn close_and_collect_diagnostics(&mut self) -> String {
        if self.closed {
            return String::new();
        }
        self.closed = true;

        // Disconnecting the frame channel lets the copy stage drain and
        // exit; that drops its staged sender, which in turn winds down the
        // write stage after its queue empties. stdin closes with it.
        drop(self.frames_tx.take());
        if let Some(join) = self.copy_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.write_join.take() {
            let _ = join.join();
        }

        // Read stderr to EOF before waiting so a chatty encoder can't
        // deadlock on a full pipe.
        let mut diagnostics = String::new();
        if let Some(mut err) = self.stderr.take() {
            let _ = err.read_to_string(&mut diagnostics);
        }

        if let Some(mut child) = self.child.take() {
            wait_bounded(&mut child);
        }

        diagnostics
    }
}

impl Drop for EncoderPipe {
    fn drop(&mut self) {
        if !self.closed {
            loge!(
                "PIPE",
                "EncoderPipe dropped without being closed; closing now. \
                 Call close_and_collect_diagnostics() before dropping."
            );
            let _ = self.close_and_collect_diagnostics();
        }
    }
}

// Copy stage: stage each incoming payload into a pooled buffer and hand it
// to the write stage. Runs until the frame channel disconnects.
fn copy_stage(
    frames_rx: Receiver<Vec<u8>>,
    staged_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    copied_tx: Sender<()>,
) {
    for payload in frames_rx {
        // Reuse a pooled buffer when its size matches the incoming frame;
        // otherwise allocate fresh (and let the stale buffer drop).
        let mut buf = match free_rx.try_recv() {
            Ok(pooled) if pooled.len() == payload.len() => pooled,
            _ => vec![0u8; payload.len()],
        };
        buf.copy_from_slice(&payload);

        // Blocks while the write backlog is at its bound.
        if staged_tx.send(buf).is_err() {
            break;
        }

        // Consumption signal for sync_and_throttle.
        let _ = copied_tx.send(());
    }
}

// Write stage: push staged buffers into the encoder's stdin in order, then
// return them to the free pool. Runs until the staged channel disconnects;
// dropping stdin afterwards is what lets the encoder finalize its output.
fn write_stage(staged_rx: Receiver<Vec<u8>>, free_tx: Sender<Vec<u8>>, mut stdin: ChildStdin) {
    for buf in staged_rx {
        if let Err(e) = stdin.write_all(&buf).and_then(|()| stdin.flush()) {
            // Encoder likely exited; the session detects that through its
            // own lifecycle, so just log and keep draining.
            logw!("PIPE", "write to encoder stdin failed: {e}");
        }
        let _ = free_tx.send(buf);
    }
}

fn wait_bounded(child: &mut Child) {
    let deadline = Instant::now() + EXIT_WAIT_LIMIT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                logi!("PIPE", "encoder process exited with {status}");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                logw!("PIPE", "failed to poll encoder process: {e}");
                return;
            }
        }
        if Instant::now() >= deadline {
            logw!(
                "PIPE",
                "encoder did not exit within {EXIT_WAIT_LIMIT:?}; killing it"
            );
            let _ = child.kill();
            let _ = child.wait();
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    // A stub "encoder" that copies stdin to a file, standing in for ffmpeg.
    fn stub_pipe(out_path: &Path) -> EncoderPipe {
        let script = format!("cat > '{}'", out_path.display());
        EncoderPipe::spawn("sh", &["-c".to_string(), script]).expect("spawn stub encoder")
    }

    #[test]
    fn delivers_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames.bin");
        let mut pipe = stub_pipe(&out);

        for i in 0..8u8 {
            pipe.enqueue(vec![i; 16]);
        }
        pipe.sync_and_throttle();
        let _ = pipe.close_and_collect_diagnostics();

        let written = fs::read(&out).unwrap();
        let mut expected = Vec::new();
        for i in 0..8u8 {
            expected.extend_from_slice(&[i; 16]);
        }
        assert_eq!(written, expected);
    }

    #[test]
    fn pooled_buffers_carry_no_stale_data() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reuse.bin");
        let mut pipe = stub_pipe(&out);

        // Same size both times: the second frame reuses the first frame's
        // staging buffer out of the free pool.
        pipe.enqueue(vec![0xAA; 64]);
        pipe.sync_and_throttle();
        pipe.enqueue(vec![0x55; 64]);
        pipe.sync_and_throttle();
        let _ = pipe.close_and_collect_diagnostics();

        let written = fs::read(&out).unwrap();
        assert_eq!(&written[..64], &[0xAA; 64][..]);
        assert_eq!(&written[64..], &[0x55; 64][..]);
    }

    #[test]
    fn throttles_against_a_slow_encoder() {
        // Stub sleeps before consuming, so writes block and backlog builds.
        let pipe = {
            let p = EncoderPipe::spawn(
                "sh",
                &["-c".to_string(), "sleep 0.3; cat > /dev/null".to_string()],
            )
            .expect("spawn stub encoder");
            for i in 0..10u8 {
                p.enqueue(vec![i; 1024]);
            }
            p
        };

        // The write backlog must never exceed its bound at any sampled
        // instant, even with ten rapid enqueues outstanding.
        for _ in 0..30 {
            assert!(pipe.write_backlog() <= WRITE_BACKLOG_LIMIT);
            thread::sleep(Duration::from_millis(10));
        }

        pipe.sync_and_throttle();
        assert_eq!(pipe.pending_copies(), 0);

        let mut pipe = pipe;
        let _ = pipe.close_and_collect_diagnostics();
    }

    #[test]
    fn sync_consumes_every_staging_acknowledgement() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("acks.bin");
        let mut pipe = stub_pipe(&out);

        for i in 0..5u8 {
            pipe.enqueue(vec![i; 16]);
        }
        // Let the copy stage run ahead of the producer so acknowledgements
        // pile up before sync looks at them.
        thread::sleep(Duration::from_millis(50));
        pipe.sync_and_throttle();

        assert!(pipe.copied_rx.is_empty());
        assert_eq!(pipe.pending_copies(), 0);
        let _ = pipe.close_and_collect_diagnostics();
    }

    #[test]
    fn sync_covers_the_copy_in_flight() {
        // Big frames against a stub that sleeps before consuming: the write
        // stage blocks on a full OS pipe, the staged channel fills, and the
        // copy stage ends up holding a payload it has popped from the frame
        // channel but not yet staged. Sync must wait for that one too, not
        // just for the frame channel to look empty.
        let pipe = EncoderPipe::spawn(
            "sh",
            &["-c".to_string(), "sleep 0.5; cat > /dev/null".to_string()],
        )
        .expect("spawn stub encoder");
        for _ in 0..6 {
            pipe.enqueue(vec![0u8; 256 * 1024]);
        }

        pipe.sync_and_throttle();
        assert_eq!(pipe.pending_copies(), 0);
        assert!(pipe.copied_rx.is_empty());

        let mut pipe = pipe;
        let _ = pipe.close_and_collect_diagnostics();
    }

    #[test]
    fn dropped_unclosed_pipe_still_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dropped.bin");
        {
            let pipe = stub_pipe(&out);
            for i in 0..4u8 {
                pipe.enqueue(vec![i; 16]);
            }
            // Dropped without close_and_collect_diagnostics().
        }

        let written = fs::read(&out).unwrap();
        assert_eq!(written.len(), 4 * 16);
        assert_eq!(&written[..16], &[0u8; 16][..]);
        assert_eq!(&written[48..], &[3u8; 16][..]);
    }

    #[test]
    fn close_with_no_frames_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("empty.bin");
        let mut pipe = stub_pipe(&out);
        let diagnostics = pipe.close_and_collect_diagnostics();
        assert!(diagnostics.is_empty());
        assert_eq!(fs::read(&out).unwrap().len(), 0);
    }

    #[test]
    fn write_errors_are_swallowed() {
        // "false" exits immediately, so every write hits a broken pipe.
        let mut pipe = EncoderPipe::spawn("false", &[]).expect("spawn");
        thread::sleep(Duration::from_millis(50));
        assert!(!pipe.is_alive());
        for _ in 0..4 {
            pipe.enqueue(vec![0u8; 32]);
        }
        pipe.sync_and_throttle();
        let _ = pipe.close_and_collect_diagnostics();
    }
}
