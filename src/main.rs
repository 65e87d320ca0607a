use futures::StreamExt;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use tandem::config::Config;
use tandem::format::format_timestamp;
use tandem::import::IngestOutcome;
use tandem::preview::PreviewOptions;
use tandem::AppContext;

struct Args {
    file: PathBuf,
    previews: Option<PathBuf>,
    play_secs: Option<f64>,
}

#[tokio::main]
async fn main() {
    // Use RUST_LOG env var if set, otherwise default to info level
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let argv: Vec<String> = env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(message) => {
            error!("{}", message);
            print_usage(&argv[0]);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let mut file: Option<PathBuf> = None;
    let mut previews: Option<PathBuf> = None;
    let mut play_secs: Option<f64> = None;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--previews" => {
                let dir = argv.get(i + 1).ok_or("--previews requires a directory")?;
                previews = Some(PathBuf::from(dir));
                i += 2;
            }
            "--play" => {
                let secs = argv.get(i + 1).ok_or("--play requires a number of seconds")?;
                play_secs = Some(
                    secs.parse::<f64>()
                        .ok()
                        .filter(|s| s.is_finite() && *s >= 0.0)
                        .ok_or_else(|| format!("Invalid --play value: {}", secs))?,
                );
                i += 2;
            }
            arg if arg.starts_with("--") => return Err(format!("Unknown argument: {}", arg)),
            arg => {
                if file.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                file = Some(PathBuf::from(arg));
                i += 1;
            }
        }
    }

    Ok(Args {
        file: file.ok_or("Missing video file")?,
        previews,
        play_secs,
    })
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} <video> [--previews <dir>] [--play <seconds>]", program);
    eprintln!("Supported containers: mp4, webm, ogg");
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let context = AppContext::new(config).await?;

    let outcome = if args.play_secs.is_some() {
        context.open(&args.file).await?
    } else {
        context.pipeline.ingest(&args.file).await?
    };

    match &outcome {
        IngestOutcome::Hit(_) => info!("Served from cache"),
        IngestOutcome::Miss(_) => info!("Ingested"),
        IngestOutcome::PartialFailure { failures, .. } => {
            for failure in failures {
                warn!(
                    "Audio stream {} unavailable: {}",
                    failure.stream_index, failure.error
                );
            }
        }
    }

    let handle = outcome.handle();
    println!("content id: {}", handle.content_id);
    println!("video:      {}", handle.video.display());
    if let Some(duration) = handle.duration {
        println!("duration:   {}", format_timestamp(duration));
    }
    for track in &handle.tracks {
        println!(
            "track {}:    {} (volume {:.2}{})",
            track.stream_index,
            track.asset_path.display(),
            track.volume,
            if track.muted { ", muted" } else { "" }
        );
    }

    if let Some(dir) = &args.previews {
        tokio::fs::create_dir_all(dir).await?;
        let mut tiles = context.preview(&handle.video, PreviewOptions::default());
        let mut written = 0;
        while let Some(tile) = tiles.next().await {
            let tile = tile?;
            let path = dir.join(format!("{:04}.jpg", tile.index));
            tokio::fs::write(&path, &tile.bytes).await?;
            written += 1;
        }
        info!("Wrote {} preview tiles to {}", written, dir.display());
    }

    if let Some(secs) = args.play_secs {
        let playback = &context.playback_handle;
        playback.play().await?;
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        let status = playback.status().await?;
        info!("Stopping at {}", format_timestamp(status.position));
        context.stop().await?;
    }

    Ok(())
}
