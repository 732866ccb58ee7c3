use stemdeck::cli::{Args, Command};
use stemdeck::config::{self, LoadingConfig};
use stemdeck::context::{AppContext, AppEvent};
use stemdeck::core::ResourceError;
use stemdeck::playback::NullSink;
use stemdeck::progress::SplitProgress;
use stemdeck::resources::LrcDirectory;
use stemdeck::separation::JobEvent;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll period of the headless event loop
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Slack on top of settle delay and load timeout when waiting for playback
const PLAY_MARGIN: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // Parse command-line arguments first (needed for log setup)
    let args = Args::parse();

    // Create path configuration from CLI args and environment
    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());

    // Ensure directories exist
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;

    info!("stemdeck starting...");
    debug!("Command-line args: {:?}", args);

    let config_path = config::config_file(config::CONFIG_FILE, &path_config);
    info!("Config path: {}", config_path.display());

    let mut settings = LoadingConfig::load(&config_path);
    if let Some(library) = &args.library {
        settings.library_dir = library.clone();
    }

    match args.command {
        Command::Scan { lyrics_dir, json } => scan(settings, lyrics_dir, json),
        Command::Split {
            artist,
            title,
            files,
            no_verify,
        } => split(settings, &artist, title.as_deref(), &files, no_verify),
        Command::Play { start, count } => play(settings, start, count),
        Command::ShiftLyrics { folder, offset } => shift_lyrics(settings, &folder, offset),
        Command::Info { json, save_config } => info_cmd(settings, &config_path, json, save_config),
    }
}

/// 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        // File logging with specified verbosity level
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn scan(settings: LoadingConfig, lyrics_dir: Option<PathBuf>, json: bool) -> Result<()> {
    let mut ctx = AppContext::new(settings, Box::new(NullSink));
    if let Some(dir) = lyrics_dir {
        ctx = ctx.with_lyrics_provider(Arc::new(LrcDirectory::new(dir)));
    }

    let report = ctx.scan_library();

    // Wait for lyric checks queued by the scan
    while ctx.has_pending_lyric_checks() {
        ctx.pump_events();
        std::thread::sleep(PUMP_INTERVAL);
    }
    for event in ctx.events().try_iter() {
        if let AppEvent::LyricsRefreshed { folder, outcome } = event {
            debug!("Lyrics {}: {:?}", folder.display(), outcome);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (idx, track) in ctx.playlist().tracks().enumerate() {
        let stems = if track.has_separated_stems { "stems" } else { "-" };
        println!("{:4}  {:5}  {}", idx, stems, track.display_name());
    }
    for (path, reason) in &report.malformed {
        eprintln!("skipped {}: {}", path.display(), reason);
    }
    println!(
        "{} tracks ({} new, {} malformed descriptors)",
        ctx.playlist().len(),
        report.added.len(),
        report.malformed.len()
    );
    Ok(())
}

/// Expand glob patterns; plain paths pass through unchanged
fn expand_inputs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let path = PathBuf::from(pattern);
        if path.exists() {
            files.push(path);
            continue;
        }
        let matches: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("Bad pattern {}", pattern))?
            .filter_map(|entry| entry.ok())
            .collect();
        if matches.is_empty() {
            warn!("No files match {}", pattern);
        }
        files.extend(matches);
    }
    Ok(files)
}

fn split(settings: LoadingConfig, artist: &str, title: Option<&str>, patterns: &[String], no_verify: bool) -> Result<()> {
    let files = expand_inputs(patterns)?;
    if files.is_empty() {
        bail!("Nothing to split");
    }
    if title.is_some() && files.len() > 1 {
        bail!("--title applies to a single file, got {}", files.len());
    }

    let mut ctx = AppContext::new(settings, Box::new(NullSink));
    let mut progress = SplitProgress::new(files.len());

    for file in &files {
        let title = match title {
            Some(t) => t.to_string(),
            None => file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .with_context(|| format!("No file name in {}", file.display()))?,
        };
        ctx.submit_separation(artist, &title, file.clone());
    }

    let mut last_ok = false;
    'pump: loop {
        ctx.pump_events();
        for event in ctx.events().try_iter() {
            let AppEvent::Job(event) = event else { continue };
            progress.update(&event);
            match event {
                JobEvent::Finished { .. } => last_ok = true,
                JobEvent::Failed { .. } => last_ok = false,
                JobEvent::Idle if no_verify || !last_ok => break 'pump,
                JobEvent::Verified { .. } | JobEvent::VerificationTimeout { .. } => break 'pump,
                _ => {}
            }
        }
        std::thread::sleep(PUMP_INTERVAL);
    }

    progress.finish();
    ctx.shutdown();

    if progress.failed() > 0 {
        bail!("{} of {} jobs failed", progress.failed(), files.len());
    }
    Ok(())
}

fn play(settings: LoadingConfig, start: usize, count: usize) -> Result<()> {
    let mut ctx = AppContext::new(settings, Box::new(NullSink));
    ctx.scan_library();
    if ctx.playlist().is_empty() {
        bail!("Library {} has no tracks", ctx.config().library_dir.display());
    }

    // Worst case per transition: settle delay plus a timed-out load
    let load_timeout = ctx.config().load_timeout().unwrap_or(Duration::from_secs(60));
    let wait = ctx.config().settle_delay() + load_timeout + PLAY_MARGIN;

    for step in 0..count.max(1) {
        let requested = if step == 0 { ctx.play(start) } else { ctx.next() };
        if !requested {
            bail!("No track at index {} ({} tracks)", start, ctx.playlist().len());
        }

        let (index, outcome) = wait_for_track(&ctx, wait)?;
        let name = ctx
            .playlist()
            .get(index)
            .map(|t| t.display_name())
            .unwrap_or_default();
        match outcome {
            Ok(bytes) => println!("{:4}  {}  ({} bytes)", index, name, bytes),
            Err(e) => println!("{:4}  {}  unavailable: {}", index, name, e),
        }
    }

    ctx.shutdown();
    let report = ctx.cache_report();
    println!(
        "audio cache: {}/{} entries, hit rate {:.0}%",
        report.audio.size, report.audio.capacity, report.audio.hit_rate_pct
    );
    Ok(())
}

/// Block until the transport reports the requested track
fn wait_for_track(ctx: &AppContext, wait: Duration) -> Result<(usize, Result<usize, ResourceError>)> {
    let deadline = Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = ctx
            .events()
            .recv_timeout(left)
            .context("Timed out waiting for playback to start")?;
        match event {
            AppEvent::TrackLoaded { index, stems } => return Ok((index, Ok(stems.total_bytes()))),
            AppEvent::TrackLoadFailed { index, error } => return Ok((index, Err(error))),
            _ => {}
        }
    }
}

fn shift_lyrics(settings: LoadingConfig, folder: &Path, offset: f64) -> Result<()> {
    let ctx = AppContext::new(settings, Box::new(NullSink));
    let count = ctx
        .lyrics()
        .adjust_timing(folder, offset)
        .with_context(|| format!("Failed to shift lyrics in {}", folder.display()))?;
    println!("Shifted {} timestamps by {:+.2}s", count, offset);
    Ok(())
}

fn info_cmd(settings: LoadingConfig, config_path: &Path, json: bool, save_config: bool) -> Result<()> {
    if save_config {
        settings.save(config_path)?;
        println!("Saved {}", config_path.display());
    }

    let ctx = AppContext::new(settings.clone(), Box::new(NullSink));
    let report = ctx.cache_report();

    if json {
        let doc = serde_json::json!({ "config": settings, "status": report });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("config:  {}", config_path.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!(
        "memory:  {:.0} / {:.0} MB ({:.0}%, {:?})",
        report.memory.usage_mb, report.memory.ceiling_mb, report.memory.usage_pct, report.memory.trend
    );
    for (name, stats) in [
        ("audio", &report.audio),
        ("images", &report.images),
        ("icons", &report.icons),
        ("lyrics", &report.lyrics),
    ] {
        println!("{:8} {}/{} entries", format!("{}:", name), stats.size, stats.capacity);
    }
    println!("workers: {}", ctx.workers().num_threads());
    Ok(())
}
