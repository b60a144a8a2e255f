//! Vermilion entrypoint: a self-contained demo run of the display worker
//! against a synthetic adapter and a loopback client. Real deployments
//! embed `core-display` behind a device and a network front-end; this
//! binary exists to exercise the full pipeline and to give the log and
//! stats surfaces something to show.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use core_cache::PixmapCache;
use core_codec::glz::GlzDictionary;
use core_dispatch::dispatcher::{WorkerMessage, dispatcher};
use core_display::{DisplayWorker, WorkerConfig};
use core_region::Rect;
use core_stats::StatsTree;

use demo::{DemoDevice, DemoTransport};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "vermilion", version, about = "Display worker demo run")]
struct Args {
    /// Optional configuration file path (overrides discovery of
    /// `vermilion.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Number of synthetic video frames to push through the pipeline.
    #[arg(long, default_value_t = 90)]
    frames: u32,
    /// Frame pacing in milliseconds.
    #[arg(long, default_value_t = 33)]
    frame_ms: u64,
    /// Log to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn configure_logging(args: &Args) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &args.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().map(PathBuf::from).unwrap_or_else(|| "vermilion.log".into());
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = configure_logging(&args);
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(target: "runtime", %info, "panic");
        eprintln!("panic: {info}");
    }));

    let config = core_config::load_from(args.config.clone())?;
    info!(
        target: "runtime",
        mode = ?config.compress_mode(),
        streaming = ?config.streaming_video(),
        "startup"
    );

    let stats = if config.file.stats.enabled {
        let name = config
            .file
            .stats
            .shm_name
            .clone()
            .unwrap_or_else(|| format!("vermilion.{}", std::process::id()));
        Some(Arc::new(StatsTree::create(&name, 64)))
    } else {
        None
    };

    // Shared end-user caches.
    let pixmap_cache = Arc::new(PixmapCache::new(1, config.file.cache.pixmap_bytes));
    let glz_dict = GlzDictionary::new(1, config.file.cache.glz_window_bytes as usize);

    let worker_config = WorkerConfig {
        compress_mode: config.compress_mode(),
        streaming: config.streaming_video(),
        palette_cache_budget: config.file.cache.palette_entries,
        cursor_cache_budget: config.file.cache.cursor_bytes,
        max_pipe_size: config.file.client.max_pipe_size,
    };

    let device = DemoDevice::new();
    let (disp, port, _completions) = dispatcher(256);
    let mut worker = DisplayWorker::new(
        Box::new(device.clone()),
        port,
        pixmap_cache,
        glz_dict,
        worker_config,
    );
    if let Some(tree) = &stats {
        worker.attach_stats(tree.clone());
    }
    let worker_thread = std::thread::Builder::new()
        .name("vd-worker".into())
        .spawn(move || worker.run())?;

    // Bring up a desktop and a loopback client.
    device.queue_primary(1024, 768);
    device.queue_fill(Rect::new(0, 0, 1024, 768), 0x2A2A33);
    device.queue_fill(Rect::new(0, 740, 1024, 768), 0x101014);
    disp.wakeup()?;

    let (transport, link) = DemoTransport::new();
    disp.send(WorkerMessage::DisplayConnect {
        channel_id: 0,
        transport: Box::new(transport),
        migration: false,
    })?;

    // Animate a photographic region: the detector should promote it and
    // later frames leave as stream data.
    let video_box = Rect::new(352, 264, 672, 504); // 320×240 center
    for frame_no in 0..args.frames {
        device.queue_video_frame(video_box, frame_no);
        disp.wakeup()?;
        std::thread::sleep(Duration::from_millis(args.frame_ms));
    }

    // Let the pipeline drain, then tear down: dropping the dispatcher ends
    // the worker loop.
    while device.pending() > 0 {
        disp.wakeup()?;
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(100));
    drop(disp);
    worker_thread
        .join()
        .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;

    let frames = link.frames.load(std::sync::atomic::Ordering::Relaxed);
    let bytes = link.bytes.load(std::sync::atomic::Ordering::Relaxed);
    let stream_data = link.stream_data.load(std::sync::atomic::Ordering::Relaxed);
    info!(
        target: "runtime",
        frames,
        bytes,
        stream_data,
        released = device.released(),
        "demo_complete"
    );
    if let Some(tree) = &stats {
        let node = tree.add_node(None, "link_bytes", true)?;
        tree.set(node, bytes as u64);
    }
    println!(
        "demo: {frames} messages, {bytes} bytes, {stream_data} stream frames, \
         {} guest resources released",
        device.released()
    );
    Ok(())
}
