//! Stream capture driver
//!
//! Ties the pacer and the session together behind the entry points an
//! external driver loop calls: `begin`/`end` for session lifecycle and
//! `tick(now, frame)` once per rendered frame. The driver makes no
//! scheduling assumptions beyond `now` being monotonic.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::pacer::{Cadence, Pacer};
use crate::preset::{Preset, StreamTarget};
use crate::readback::ReadbackSource;
use crate::session::Session;
use crate::{loge, logi, logw};

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureCfg {
    #[serde(default = "default_encoder")]
    pub encoder_path: String,

    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: f32,

    #[serde(default)]
    pub preset: Preset,

    // When both are set, sessions stream to the address instead of
    // recording to out_dir.
    #[serde(default)]
    pub stream_target: Option<StreamTarget>,

    #[serde(default)]
    pub stream_address: Option<String>,

    #[serde(default)]
    pub control: ControlCfg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlCfg {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_control_port")]
    pub port: u16,

    // Delay before acknowledging a negotiate command, giving the encoder
    // process time to start.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: f32,
}

fn default_encoder() -> String {
    "ffmpeg".to_string()
}
fn default_name() -> String {
    "framepipe".to_string()
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("captures")
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_frame_rate() -> f32 {
    60.0
}
fn default_control_port() -> u16 {
    9944
}
fn default_settle_secs() -> f32 {
    5.0
}

impl Default for CaptureCfg {
    fn default() -> Self {
        Self {
            encoder_path: default_encoder(),
            name: default_name(),
            out_dir: default_out_dir(),
            width: default_width(),
            height: default_height(),
            frame_rate: default_frame_rate(),
            preset: Preset::default(),
            stream_target: None,
            stream_address: None,
            control: ControlCfg::default(),
        }
    }
}

impl Default for ControlCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_control_port(),
            settle_secs: default_settle_secs(),
        }
    }
}

pub fn load_cfg(path: &Path) -> CaptureCfg {
    let data = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return CaptureCfg::default(),
    };

    match serde_json::from_str::<CaptureCfg>(&data) {
        Ok(cfg) => cfg,
        Err(e) => {
            logw!(
                "CAPTURE",
                "failed to parse capture config ({}): {e}. Using defaults.",
                path.display()
            );
            CaptureCfg::default()
        }
    }
}

pub struct StreamCapture<S: ReadbackSource> {
    cfg: CaptureCfg,
    active: Option<Active<S>>,
}

struct Active<S: ReadbackSource> {
    session: Session<S>,
    pacer: Pacer,
}

impl<S: ReadbackSource> StreamCapture<S> {
    pub fn new(cfg: CaptureCfg) -> Self {
        Self { cfg, active: None }
    }

    pub fn cfg(&self) -> &CaptureCfg {
        &self.cfg
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Start a session at the negotiated geometry and rate. `now` becomes
    /// the pacer's session start timestamp.
    pub fn begin(&mut self, source: S, width: u32, height: u32, frame_rate: f32, now: f64) {
        if self.active.is_some() {
            loge!("CAPTURE", "stream requested while one is ongoing");
            return;
        }

        logi!("CAPTURE", "beginning stream {width}x{height} @{frame_rate:.2}fps");

        let session = match (&self.cfg.stream_target, &self.cfg.stream_address) {
            (Some(target), Some(address)) => Session::create_stream(
                source,
                &self.cfg.encoder_path,
                width,
                height,
                frame_rate,
                self.cfg.preset,
                *target,
                address,
            ),
            _ => Session::create(
                source,
                &self.cfg.encoder_path,
                &self.cfg.name,
                &self.cfg.out_dir,
                width,
                height,
                frame_rate,
                self.cfg.preset,
            ),
        };

        self.active = Some(Active {
            session,
            pacer: Pacer::new(frame_rate, now),
        });
    }

    /// Per-render-frame entry point: apply the pacing decision for `now`,
    /// then run the end-of-tick session sync exactly once.
    pub fn tick(&mut self, now: f64, frame: &S::Frame) {
        let Some(active) = self.active.as_mut() else { return };

        match active.pacer.tick(now) {
            Cadence::Coast => active.session.push_frame(None),
            Cadence::Emit => active.session.push_frame(Some(frame)),
            Cadence::EmitTwice => {
                active.session.push_frame(Some(frame));
                active.session.push_frame(Some(frame));
            }
            Cadence::Resync { .. } => active.session.push_frame(Some(frame)),
        }

        active.session.complete_push_frames();
    }

    /// Close the active session, if any. Safe to call repeatedly.
    pub fn end(&mut self) {
        if let Some(mut active) = self.active.take() {
            logi!(
                "CAPTURE",
                "ending stream after {} frames",
                active.pacer.frame_count()
            );
            let _ = active.session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readback::ImmediateSource;

    fn test_cfg() -> CaptureCfg {
        CaptureCfg {
            encoder_path: "definitely-not-an-encoder-binary".to_string(),
            ..CaptureCfg::default()
        }
    }

    #[test]
    fn begin_tick_end_with_disabled_session() {
        // A missing encoder degrades the session but the driver surface
        // still works end to end.
        let mut capture = StreamCapture::new(test_cfg());
        assert!(!capture.is_streaming());

        capture.begin(ImmediateSource::new(), 64, 64, 30.0, 0.0);
        assert!(capture.is_streaming());

        let frame = vec![0u8; 64 * 64 * 4];
        for i in 0..10 {
            capture.tick(i as f64 / 30.0, frame.as_slice());
        }

        capture.end();
        assert!(!capture.is_streaming());
        capture.end(); // idempotent
    }

    #[test]
    fn second_begin_is_rejected_while_streaming() {
        let mut capture = StreamCapture::new(test_cfg());
        capture.begin(ImmediateSource::new(), 64, 64, 30.0, 0.0);
        capture.begin(ImmediateSource::new(), 128, 128, 60.0, 0.0);
        assert!(capture.is_streaming());
        capture.end();
    }

    #[test]
    fn cfg_defaults_parse_from_empty_object() {
        let cfg: CaptureCfg = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.encoder_path, "ffmpeg");
        assert_eq!(cfg.frame_rate, 60.0);
        assert_eq!(cfg.control.port, 9944);
        assert!(!cfg.control.enabled);
    }
}
