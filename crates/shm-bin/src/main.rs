//! Shimmer diagnostic client and test server.
//!
//! `shimmer connect` dials a display server (environment or CLI), dumps
//! the preroll state, renders a moving test pattern and logs every
//! inbound event. `shimmer serve` hosts a bare connection point that
//! accepts one client, answers resizes and consumes frames, which is
//! enough to exercise the full substrate without a real display server.

use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, tick};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use core_client::{ContextFlags, SegmentKind, ShmError, SignalMask};
use core_layout::{Pixel, rgba};
use core_server::{AllocOpts, ConnPoint, PrerollOpts};

mod config;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "shimmer", version, about = "shimmer IPC diagnostic tool")]
struct Args {
    /// Optional configuration file path (overrides discovery of `shimmer.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect as a client and render a test pattern.
    Connect {
        /// Endpoint name; falls back to the environment, then the config.
        endpoint: Option<String>,
        /// Fallback endpoint for crash recovery.
        #[arg(long)]
        fallback: Option<String>,
        /// Stop after this many frames (0 = run until EXIT).
        #[arg(long, default_value_t = 0)]
        frames: u64,
    },
    /// Host a connection point and accept a single client.
    Serve {
        /// Absolute path for the connection socket.
        path: PathBuf,
        #[arg(long, default_value_t = 32)]
        width: u32,
        #[arg(long, default_value_t = 32)]
        height: u32,
    },
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) {
        let file_appender = tracing_appender::rolling::never(".", "shimmer.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => {
                self.log_guard = Some(guard);
            }
            Err(_err) => {
                // Global subscriber already installed; drop guard so the
                // writer shuts down.
            }
        }
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

fn main() -> Result<()> {
    let mut startup = AppStartup::new();
    startup.configure_logging();
    AppStartup::install_panic_hook();
    info!(target: "runtime", "startup");

    let args = Args::parse();
    let cfg = config::load_from(args.config.clone())?;

    match args.command {
        Command::Connect {
            endpoint,
            fallback,
            frames,
        } => run_client(endpoint, fallback, frames, &cfg),
        Command::Serve {
            path,
            width,
            height,
        } => run_server(&path, width, height),
    }
}

fn run_client(
    endpoint: Option<String>,
    fallback: Option<String>,
    frames: u64,
    cfg: &config::ConfigFile,
) -> Result<()> {
    // CLI wins over config; the environment stays authoritative when
    // neither names an endpoint
    if let Some(ep) = endpoint.or_else(|| cfg.connection.endpoint.clone()) {
        // connection setup reads the environment; single-threaded here
        unsafe { std::env::set_var("SHIMMER_CONNPATH", &ep) };
    }
    if let Some(fb) = fallback.clone().or_else(|| cfg.connection.fallback.clone()) {
        unsafe { std::env::set_var("SHIMMER_ALTCONN", &fb) };
    }

    let mut ctx = core_client::open(SegmentKind::Application, ContextFlags::empty())
        .context("connecting to the display server")?;

    if let Some(initial) = ctx.take_initial() {
        info!(target: "client",
            display_w = initial.display_width_px,
            display_h = initial.display_height_px,
            rate = initial.rate,
            density = initial.density,
            fonts = initial.fonts.iter().filter(|f| f.fd.is_some()).count(),
            "preroll state");
    }

    if let Some(args) = ctx.args() {
        for arg in args.iter() {
            debug!(target: "client", key = %arg.key, value = ?arg.value, "packed argument");
        }
    }

    let fps = cfg.pattern.fps.max(1);
    let ticker = tick(Duration::from_millis(1000 / fps as u64));
    let mut frame: u64 = 0;

    loop {
        // frame pacing on the channel, event pumping between ticks
        select! {
            recv(ticker) -> _ => {
                let (w, h) = (ctx.width(), ctx.height());
                draw_pattern(ctx.video_mut(), w, h, frame);
                match ctx.signal(SignalMask::VIDEO) {
                    Ok(blocked_ms) => {
                        frame += 1;
                        if blocked_ms > 0 {
                            debug!(target: "client", blocked_ms, frame, "signal");
                        }
                    }
                    Err(e) => warn!(target: "client", error = %e, "signal failed"),
                }
                if frames != 0 && frame >= frames {
                    ctx.last_words("frame budget reached");
                    return Ok(());
                }
            }
            default(Duration::from_millis(1)) => {}
        }

        loop {
            match ctx.poll() {
                Ok(Some(ev)) => info!(target: "client", event = %ev, "event"),
                Ok(None) => break,
                Err(ShmError::Dead) | Err(ShmError::Exited) => {
                    info!(target: "client", "server closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e).context("event pump"),
            }
        }
    }
}

/// Scrolling colour bars, frame counter in the phase.
fn draw_pattern(buf: &mut [Pixel], w: u32, h: u32, frame: u64) {
    let w = w as usize;
    for (i, px) in buf.iter_mut().enumerate().take(w * h as usize) {
        let x = (i % w) as u64;
        let y = (i / w) as u64;
        let bar = ((x + frame) / 8) % 3;
        *px = match bar {
            0 => rgba((64 + y) as u8, 0, 0, 255),
            1 => rgba(0, (64 + y) as u8, 0, 255),
            _ => rgba(0, 0, (64 + y) as u8, 255),
        };
    }
}

fn run_server(path: &std::path::Path, width: u32, height: u32) -> Result<()> {
    let cp = ConnPoint::bind(path).context("binding connection point")?;
    info!(target: "server", path = %cp.path().display(), "waiting for a client");

    let mut seg = cp
        .accept(width, height, AllocOpts::default())
        .context("accepting client")?;

    if let Some((guid, kind)) = seg.await_register(Duration::from_secs(5)) {
        info!(target: "server", guid0 = guid[0], guid1 = guid[1], kind, "client registered");
    }
    seg.preroll(PrerollOpts::default())
        .context("sending preroll burst")?;

    let mut frames: u64 = 0;
    loop {
        if !seg.alive() {
            info!(target: "server", words = %seg.last_words(), "client gone");
            return Ok(());
        }

        if seg.step_resize().context("resize step")?.is_some() {
            info!(target: "server", w = seg.width(), h = seg.height(), "resized");
        }

        if let Some(index) = seg.video_ready() {
            let checksum: u64 = seg
                .video(index)
                .map(|px| px.iter().map(|&p| p as u64).sum())
                .unwrap_or(0);
            seg.ack_video().context("video acknowledge")?;
            frames += 1;
            debug!(target: "server", frames, index, checksum, "frame consumed");
        }

        if let Some((index, used)) = seg.audio_ready() {
            debug!(target: "server", index, used, "audio consumed");
            seg.ack_audio().context("audio acknowledge")?;
        }

        for ev in seg.poll() {
            info!(target: "server", event = %ev, "client event");
        }

        std::thread::sleep(Duration::from_millis(2));
    }
}
