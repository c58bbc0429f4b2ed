//! Capture session
//!
//! A session converts "push this frame buffer" calls into an ordered byte
//! stream feeding one [`EncoderPipe`]. Readback requests complete out of
//! order; the session's queue re-serializes them before the bytes reach the
//! pipe.
//!
//! Construction fails soft: a missing encoder executable or a backend with
//! no async readback support leaves the session in a disabled state where
//! every call is a no-op. Capture is usually optional, so a warning beats an
//! error here.

use std::env;
use std::path::Path;

use crate::pipe::EncoderPipe;
use crate::preset::{Preset, StreamTarget};
use crate::readback::{ReadbackQueue, ReadbackSource};
use crate::{loge, logi, logw};

pub struct Session<S: ReadbackSource> {
    source: S,
    pipe: Option<EncoderPipe>,
    queue: ReadbackQueue,
    preprocess_ready: bool,
}

impl<S: ReadbackSource> Session<S> {
    /// Start a session recording to a timestamped file in `out_dir`.
    pub fn create(
        source: S,
        encoder: &str,
        name: &str,
        out_dir: &Path,
        width: u32,
        height: u32,
        frame_rate: f32,
        preset: Preset,
    ) -> Self {
        let file = format!(
            "{}_{}{}",
            name.replace(' ', "_"),
            crate::logging::file_timestamp(),
            preset.suffix()
        );
        let out_path = out_dir.join(file);
        if let Err(e) = std::fs::create_dir_all(out_dir) {
            logw!("SESSION", "failed to create output dir {}: {e}", out_dir.display());
        }
        let args = encoder_args(width, height, frame_rate, preset, &out_path);
        Self::create_with_args(source, encoder, args)
    }

    /// Start a session streaming to a network address.
    pub fn create_stream(
        source: S,
        encoder: &str,
        width: u32,
        height: u32,
        frame_rate: f32,
        preset: Preset,
        target: StreamTarget,
        address: &str,
    ) -> Self {
        let mut args = raw_input_args(width, height, frame_rate);
        args.extend(preset.options().iter().map(|s| s.to_string()));
        args.extend(target.mux_options().iter().map(|s| s.to_string()));
        args.push(address.to_string());
        Self::create_with_args(source, encoder, args)
    }

    /// Start a session with a fully caller-assembled argument list.
    pub fn create_with_args(source: S, encoder: &str, args: Vec<String>) -> Self {
        let mut session = Self {
            source,
            pipe: None,
            queue: ReadbackQueue::new(),
            preprocess_ready: false,
        };

        if !encoder_available(encoder) {
            logw!(
                "SESSION",
                "encoder executable '{encoder}' not found; capture session disabled"
            );
            return session;
        }
        if !session.source.supports_async_readback() {
            logw!(
                "SESSION",
                "backend does not support asynchronous readback; capture session disabled"
            );
            return session;
        }

        match EncoderPipe::spawn(encoder, &args) {
            Ok(pipe) => {
                logi!("SESSION", "encoder pipe initialized");
                session.pipe = Some(pipe);
            }
            Err(e) => {
                logw!("SESSION", "failed to start encoder: {e:#}; capture session disabled");
            }
        }
        session
    }

    /// True unless construction degraded to the no-op stub.
    pub fn is_enabled(&self) -> bool {
        self.pipe.is_some()
    }

    /// Readback requests submitted but not yet drained.
    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }

    /// Drain completed readbacks into the pipe, then (for `Some`) submit a
    /// new readback for `frame`. `None` keeps the encoder timeline moving
    /// without new pixel data.
    pub fn push_frame(&mut self, frame: Option<&S::Frame>) {
        let Some(pipe) = self.pipe.as_ref() else { return };

        self.queue.drain(|bytes| pipe.enqueue(bytes));

        if let Some(frame) = frame {
            self.queue_frame(frame);
        }
    }

    /// End-of-tick synchronization: drain whatever finished during the tick,
    /// then block until the pipe has staged everything and its write backlog
    /// is back under the bound. Called exactly once per render frame.
    pub fn complete_push_frames(&mut self) {
        let Some(pipe) = self.pipe.as_ref() else { return };
        self.queue.drain(|bytes| pipe.enqueue(bytes));
        pipe.sync_and_throttle();
    }

    /// Flush and close the pipe, wait for the encoder to exit, and release
    /// the preprocessing transform. Returns the encoder's diagnostic output
    /// (also surfaced as a warning when non-empty — encoders print progress
    /// text there, so it is not an error by itself).
    pub fn close(&mut self) -> String {
        let mut diagnostics = String::new();

        // Completed readbacks still sitting in the queue belong in the
        // output; requests still pending are abandoned.
        if let Some(pipe) = self.pipe.as_ref() {
            self.queue.drain(|bytes| pipe.enqueue(bytes));
        }

        if let Some(mut pipe) = self.pipe.take() {
            diagnostics = pipe.close_and_collect_diagnostics();
            if !diagnostics.trim().is_empty() {
                logw!(
                    "SESSION",
                    "encoder returned warning/error messages; see the following lines for details:\n{diagnostics}"
                );
            }
        }

        if self.preprocess_ready {
            self.source.release_preprocess();
            self.preprocess_ready = false;
        }

        diagnostics
    }

    fn queue_frame(&mut self, frame: &S::Frame) {
        if self.queue.is_full() {
            logw!("SESSION", "too many outstanding readback requests; frame skipped");
            return;
        }

        // Lazy initialization of the preprocessing transform.
        if !self.preprocess_ready {
            if let Err(e) = self.source.ensure_preprocess() {
                logw!("SESSION", "failed to create preprocess transform: {e:#}; frame skipped");
                return;
            }
            self.preprocess_ready = true;
        }

        let req = self.source.request(frame);
        self.queue.push(req);
    }
}

impl<S: ReadbackSource> Drop for Session<S> {
    fn drop(&mut self) {
        if self.pipe.is_some() {
            loge!(
                "SESSION",
                "Session dropped without being closed; closing now. \
                 Call close() before dropping."
            );
            let _ = self.close();
        }
    }
}

/// Fixed raw-format input flags: interleaved RGBA, bt709, explicit geometry
/// and rate, frames on stdin. The byte-stream contract (width*height*4 bytes
/// per frame, no framing) is agreed here once at process start.
fn raw_input_args(width: u32, height: u32, frame_rate: f32) -> Vec<String> {
    let video_size = format!("{}x{}", width.max(1), height.max(1));
    let rate = format!("{frame_rate}");
    [
        "-y",
        "-f",
        "rawvideo",
        "-vcodec",
        "rawvideo",
        "-pixel_format",
        "rgba",
        "-colorspace",
        "bt709",
        "-video_size",
        video_size.as_str(),
        "-framerate",
        rate.as_str(),
        "-loglevel",
        "warning",
        "-i",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn encoder_args(
    width: u32,
    height: u32,
    frame_rate: f32,
    preset: Preset,
    out_path: &Path,
) -> Vec<String> {
    let mut args = raw_input_args(width, height, frame_rate);
    args.extend(preset.options().iter().map(|s| s.to_string()));
    args.push(out_path.to_string_lossy().into_owned());
    args
}

/// Check for the encoder executable before spawning, so a missing install
/// degrades the session instead of erroring later.
fn encoder_available(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}
