//! Demo driver
//!
//! Stands in for the host render loop: synthesizes RGBA test frames, ticks
//! the capture at the configured rate, and optionally serves the remote
//! negotiation protocol so a peer can start/stop the stream.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use framepipe::capture::{load_cfg, CaptureCfg, StreamCapture};
use framepipe::control::{ControlServer, StreamControl};
use framepipe::dispatch::{tick_queue, TickRunner};
use framepipe::readback::ImmediateSource;
use framepipe::{logi, logw};

struct App {
    capture: StreamCapture<ImmediateSource>,
    clock: Instant,
    frame: Vec<u8>,
    width: u32,
    height: u32,
    tick_index: u64,
}

impl App {
    fn new(cfg: CaptureCfg) -> Self {
        Self {
            capture: StreamCapture::new(cfg),
            clock: Instant::now(),
            frame: Vec::new(),
            width: 0,
            height: 0,
            tick_index: 0,
        }
    }

    fn now(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    // Moving gradient so dropped/duplicated frames are visible in the output.
    fn render_test_pattern(&mut self) {
        let t = self.tick_index as u32;
        let (w, h) = (self.width as usize, self.height as usize);
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 4;
                self.frame[i] = (x as u32 + t) as u8;
                self.frame[i + 1] = (y as u32 + t / 2) as u8;
                self.frame[i + 2] = t as u8;
                self.frame[i + 3] = 0xFF;
            }
        }
        self.tick_index += 1;
    }
}

impl StreamControl for App {
    fn begin_stream(&mut self, width: u32, height: u32, frame_rate: f32) {
        self.width = width;
        self.height = height;
        self.frame = vec![0u8; width as usize * height as usize * 4];
        let now = self.now();
        self.capture.begin(ImmediateSource::new(), width, height, frame_rate, now);
    }

    fn end_stream(&mut self) {
        self.capture.end();
    }
}

fn main() -> anyhow::Result<()> {
    let cfg = load_cfg(Path::new("capture.json"));
    logi!(
        "MAIN",
        "framepipe demo: {}x{} @{}fps, preset {}",
        cfg.width,
        cfg.height,
        cfg.frame_rate,
        cfg.preset.display_name()
    );

    let tick_period = Duration::from_secs_f64(1.0 / f64::from(cfg.frame_rate.max(1.0)));
    let control_enabled = cfg.control.enabled;
    let (queue, runner) = tick_queue::<App>();
    let mut app = App::new(cfg.clone());

    if control_enabled {
        let settle = Duration::from_secs_f32(cfg.control.settle_secs.max(0.0));
        let server = ControlServer::bind(cfg.control.port, settle)?;
        logi!("MAIN", "control server listening on port {}", cfg.control.port);
        let accept_queue = queue.clone();
        thread::Builder::new()
            .name("control_accept".to_string())
            .spawn(move || {
                if let Err(e) = server.accept_one(accept_queue) {
                    logw!("CONTROL", "accept failed: {e:#}");
                }
            })?;
        run_loop(&mut app, &runner, tick_period, None);
    } else {
        // No controller: run a fixed-length local capture.
        queue.post(move |app: &mut App| {
            let (w, h, r) = (app.capture.cfg().width, app.capture.cfg().height, app.capture.cfg().frame_rate);
            app.begin_stream(w, h, r);
        });
        run_loop(&mut app, &runner, tick_period, Some(Duration::from_secs(10)));
        app.end_stream();
    }

    Ok(())
}

fn run_loop(
    app: &mut App,
    runner: &TickRunner<App>,
    tick_period: Duration,
    limit: Option<Duration>,
) {
    let started = Instant::now();
    loop {
        runner.run_pending(app);

        if app.capture.is_streaming() {
            app.render_test_pattern();
            let now = app.now();
            let App { capture, frame, .. } = &mut *app;
            capture.tick(now, frame.as_slice());
        }

        if let Some(limit) = limit {
            if started.elapsed() >= limit {
                return;
            }
        }

        thread::sleep(tick_period);
    }
}
