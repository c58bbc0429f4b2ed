//! framepipe — pipe rendered frames into an external video encoder
//!
//! The pipeline core is three layers, composed top-down:
//! - [`pacer`]: wall-clock pacing of frame emission against the target rate
//!   (drop/duplicate policy when the render loop drifts).
//! - [`session`]: ordered draining of asynchronous device-to-host readbacks
//!   into the pipe.
//! - [`pipe`]: a bounded two-stage staging pipeline feeding the encoder
//!   process's stdin without blocking the render thread.
//!
//! [`capture`] wraps the three behind a driver-facing `begin`/`tick`/`end`
//! surface; [`control`] exposes the remote negotiation protocol; [`dispatch`]
//! carries work from background threads onto the driver loop.

pub mod capture;
pub mod control;
pub mod dispatch;
pub mod logging;
pub mod pacer;
pub mod pipe;
pub mod preset;
pub mod readback;
pub mod session;

pub use capture::{load_cfg, CaptureCfg, StreamCapture};
pub use pacer::{Cadence, Pacer};
pub use pipe::EncoderPipe;
pub use preset::{Preset, StreamTarget};
pub use readback::{ImmediateSource, Readback, ReadbackQueue, ReadbackSource};
pub use session::Session;
