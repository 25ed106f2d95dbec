//! synchronome - persist one frame per observed scene tick
//!
//! Opens the camera, starts the capture, detection and persistence stages on
//! fixed-priority threads, and exits once the requested number of ticks has
//! been written. Ctrl-C stops the run early with a non-zero exit.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use synchronome::config::SynchronomeConfig;
use synchronome::stages::BackpressurePolicy;
use synchronome::{open_camera, FilesystemSink, Pipeline, SchedPolicy, StopFlag};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Camera device, e.g. "/dev/video0", or stub://<name> for the synthetic camera.
    #[arg(short, long)]
    device: Option<String>,
    /// Negotiate 640x480 YUYV instead of keeping the driver's format.
    #[arg(long)]
    force_format: bool,
    /// Number of frames to persist.
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    count: Option<u64>,
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SYNCHRONOME_CONFIG")]
    config: Option<PathBuf>,
    /// Directory for persisted frames.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Persist every frame, not only ticks.
    #[arg(long)]
    save_all: bool,
    /// Run stage threads in the default time-shared class.
    #[arg(long)]
    no_realtime: bool,
    /// Return frames to the driver instead of blocking when detection falls behind.
    #[arg(long)]
    drop_when_full: bool,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = SynchronomeConfig::load_from(args.config.as_deref())?;
        apply_args(&mut cfg, &args);
        cfg.validate()?;
        cfg
    };
    log::info!(
        "synchronome: device {}, {} frames into {}, realtime {}",
        cfg.camera.device,
        cfg.pipeline.target_frames,
        cfg.output.dir.display(),
        cfg.realtime()
    );

    let interrupt = StopFlag::new();
    let flag = interrupt.clone();
    ctrlc::set_handler(move || flag.request()).context("install Ctrl-C handler")?;

    let camera = {
        let _stage = ui.stage("Open camera");
        open_camera(&cfg.camera)?
    };
    let sink = {
        let _stage = ui.stage("Prepare output directory");
        FilesystemSink::new(&cfg.output.dir, cfg.output.prefix.clone())?
    };
    let pipeline = Pipeline::new(cfg.pipeline.clone())?;

    let report = {
        let spinner = ui.running(cfg.pipeline.target_frames);
        let report = pipeline.run(camera, Box::new(sink), &interrupt);
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        report?
    };

    eprintln!(
        "{} frames in {} ({:.2} fps): {} captured, {} dropped, {} ticks, {} bytes written",
        report.frames_written(),
        ui::format_duration(report.elapsed),
        report.fps(),
        report.capture.captured,
        report.capture.dropped + report.detection.pool_exhausted,
        report.detection.ticks,
        report.persistence.bytes_written
    );
    if report.interrupted {
        return Err(anyhow!(
            "interrupted after {} of {} frames",
            report.frames_written(),
            cfg.pipeline.target_frames
        ));
    }
    Ok(())
}

/// Command-line flags override file and environment settings.
fn apply_args(cfg: &mut SynchronomeConfig, args: &Args) {
    if let Some(device) = &args.device {
        cfg.camera.device = device.clone();
    }
    if args.force_format {
        cfg.camera.force_format = true;
    }
    if let Some(count) = args.count {
        cfg.pipeline.target_frames = count;
    }
    if let Some(dir) = &args.output_dir {
        cfg.output.dir = dir.clone();
    }
    if args.save_all {
        cfg.pipeline.save_all = true;
    }
    if args.no_realtime {
        cfg.pipeline.sched_policy = SchedPolicy::Normal;
    }
    if args.drop_when_full {
        cfg.pipeline.backpressure = BackpressurePolicy::Drop;
    }
}
