use clap::Parser;
use courtfeed::RelayConfig;
use courtfeed_server::{run_server, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Camera relay and recording service for court installations.
#[derive(Parser, Debug)]
#[command(name = "court-serve", version, about)]
struct Args {
    /// Address for the control API.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Court-to-camera mapping, repeatable, as `COURT=URL`.
    ///
    /// Example: --camera 1=rtsp://admin:pw@10.0.0.4:554/ch0
    #[arg(long = "camera", value_parser = parse_camera)]
    cameras: Vec<(u32, String)>,

    /// First loopback port probed for relay listeners.
    #[arg(long, default_value_t = 8090)]
    port_range_start: u16,

    /// Maximum concurrently active camera sessions.
    #[arg(long, default_value_t = 10)]
    max_sessions: usize,

    /// Maximum concurrently active recordings.
    #[arg(long, default_value_t = 3)]
    max_recordings: usize,

    /// Directory for recording output files.
    #[arg(long, default_value = "recordings")]
    recordings_dir: PathBuf,

    /// Encoder binary.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Media inspection binary.
    #[arg(long, default_value = "ffprobe")]
    ffprobe: String,
}

fn parse_camera(value: &str) -> Result<(u32, String), String> {
    let (court, url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected COURT=URL, got {value:?}"))?;
    let court = court
        .trim()
        .parse()
        .map_err(|e| format!("bad court id {court:?}: {e}"))?;
    if url.trim().is_empty() {
        return Err(format!("empty camera URL for court {court}"));
    }
    Ok((court, url.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courtfeed=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig {
        port_range_start: args.port_range_start,
        max_sessions: args.max_sessions,
        max_recordings: args.max_recordings,
        recordings_dir: args.recordings_dir,
        ffmpeg_path: args.ffmpeg,
        ffprobe_path: args.ffprobe,
        camera_map: args.cameras.into_iter().collect(),
        ..RelayConfig::default()
    };
    tracing::info!(
        "starting with {} configured cameras",
        config.camera_map.len()
    );

    run_server(AppState::new(config), args.bind).await
}
