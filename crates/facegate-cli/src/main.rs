use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{CaptureError, Frame, FrameSource};
use facegate_hw::{CameraConfig, CameraSource};
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// How often `enroll --wait` polls the daemon for progress.
const ENROLL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[zbus::proxy(
    interface = "org.facegate.Facegate1",
    default_service = "org.facegate.Facegate1",
    default_path = "/org/facegate/Facegate1"
)]
trait Facegate {
    fn enroll(&self, name: &str) -> zbus::Result<String>;
    fn cancel_enrollment(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn recent_access(&self, limit: u32) -> zbus::Result<String>;
    fn access_log(&self, identity_id: &str, from: &str, to: &str) -> zbus::Result<String>;
    fn access_stats(&self, day: &str) -> zbus::Result<String>;
    fn open_entries(&self, day: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate employee face recognition CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    /// Print raw JSON replies
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an employee from the live camera (re-enrolls an existing name)
    Enroll {
        /// Employee name
        name: String,
        /// Return as soon as the session has started
        #[arg(long)]
        no_wait: bool,
    },
    /// Cancel the active enrollment session
    Cancel,
    /// List enrolled identities
    List,
    /// Remove an identity and its embeddings
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show daemon status
    Status,
    /// Show recent entry/exit events
    Access {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// Search the access log by identity and date range
    Log {
        /// Only events for this identity ID
        #[arg(long)]
        id: Option<String>,
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
    },
    /// Show access counts for a day
    Stats {
        /// Day to report (YYYY-MM-DD, default today)
        #[arg(long)]
        day: Option<String>,
    },
    /// List employees who entered and have not left
    OpenEntries {
        /// Day to report (YYYY-MM-DD, default today)
        #[arg(long)]
        day: Option<String>,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
        /// Save the last captured frame as a PNG
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { name, no_wait } => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.enroll(&name).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let started: Value = serde_json::from_str(&reply)?;
                println!("Enrollment started for {name} (session {})", text(&started["session_id"]));
            }
            if !no_wait {
                wait_for_enrollment(&proxy).await?;
            }
        }
        Commands::Cancel => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.cancel_enrollment().await?;
            if cli.json {
                println!("{reply}");
            } else {
                println!("Enrollment cancelled");
            }
        }
        Commands::List => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.list_identities().await?;
            if cli.json {
                println!("{reply}");
            } else {
                print_identities(&serde_json::from_str(&reply)?);
            }
        }
        Commands::Remove { id } => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.remove_identity(&id).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let removed: Value = serde_json::from_str(&reply)?;
                println!("Removed {} ({})", text(&removed["name"]), text(&removed["id"]));
            }
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.status().await?;
            let status: Value = serde_json::from_str(&reply)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Access { limit } => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.recent_access(limit).await?;
            if cli.json {
                println!("{reply}");
            } else {
                print_access(&serde_json::from_str(&reply)?);
            }
        }
        Commands::Log { id, from, to } => {
            let proxy = connect(cli.session).await?;
            let reply = proxy
                .access_log(
                    id.as_deref().unwrap_or(""),
                    from.as_deref().unwrap_or(""),
                    to.as_deref().unwrap_or(""),
                )
                .await?;
            if cli.json {
                println!("{reply}");
            } else {
                print_access(&serde_json::from_str(&reply)?);
            }
        }
        Commands::Stats { day } => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.access_stats(day.as_deref().unwrap_or("")).await?;
            if cli.json {
                println!("{reply}");
            } else {
                print_stats(&serde_json::from_str(&reply)?);
            }
        }
        Commands::OpenEntries { day } => {
            let proxy = connect(cli.session).await?;
            let reply = proxy.open_entries(day.as_deref().unwrap_or("")).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let open: Value = serde_json::from_str(&reply)?;
                match open.as_array().filter(|rows| !rows.is_empty()) {
                    Some(rows) => {
                        println!("{:<36}  {:<24}  ENTERED", "ID", "NAME");
                        for row in rows {
                            println!(
                                "{:<36}  {:<24}  {}",
                                text(&row["identity_id"]),
                                text(&row["name"]),
                                text(&row["recorded_at"]),
                            );
                        }
                    }
                    None => println!("Everyone who entered has left"),
                }
            }
        }
        Commands::Test { device, frames, snapshot } => {
            camera_test(&device, frames, snapshot.as_deref())?;
        }
    }

    Ok(())
}

async fn connect(session: bool) -> Result<FacegateProxy<'static>> {
    let connection = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    FacegateProxy::new(&connection)
        .await
        .context("failed to reach facegated; is the daemon running?")
}

/// Poll status until the session leaves the active states. Ctrl-C cancels it.
async fn wait_for_enrollment(proxy: &FacegateProxy<'_>) -> Result<()> {
    println!("Look at the camera. Press Ctrl-C to cancel.");
    let mut last_collected = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                proxy.cancel_enrollment().await?;
                bail!("enrollment cancelled");
            }
            _ = tokio::time::sleep(ENROLL_POLL_INTERVAL) => {}
        }

        let status: Value = serde_json::from_str(&proxy.status().await?)?;
        let state = &status["enrollment"];
        if let Some(progress) = status["progress"].as_object() {
            let collected = progress.get("collected").and_then(Value::as_u64);
            if collected != last_collected {
                println!(
                    "  samples: {}/{}",
                    collected.unwrap_or(0),
                    progress.get("required").and_then(Value::as_u64).unwrap_or(0)
                );
                last_collected = collected;
            }
        }

        match state["state"].as_str() {
            Some("completed") => {
                println!("Enrollment complete (identity {})", text(&state["identity_id"]));
                return Ok(());
            }
            Some("failed") => bail!("enrollment failed: {}", state["reason"]),
            Some("cancelled") => bail!("enrollment cancelled"),
            Some("idle") => bail!("no enrollment session is running"),
            _ => {}
        }
    }
}

fn text(value: &Value) -> &str {
    value.as_str().unwrap_or("-")
}

fn print_identities(identities: &Value) {
    let Some(rows) = identities.as_array().filter(|rows| !rows.is_empty()) else {
        println!("No identities enrolled");
        return;
    };
    println!("{:<36}  {:<24}  {:>10}  UPDATED", "ID", "NAME", "EMBEDDINGS");
    for row in rows {
        println!(
            "{:<36}  {:<24}  {:>10}  {}",
            text(&row["id"]),
            text(&row["name"]),
            row["embedding_count"].as_u64().unwrap_or(0),
            text(&row["updated_at"]),
        );
    }
}

fn print_access(events: &Value) {
    let Some(rows) = events.as_array().filter(|rows| !rows.is_empty()) else {
        println!("No access events recorded");
        return;
    };
    println!("{:<32}  {:<8}  {:<24}  SCORE", "TIME", "KIND", "NAME");
    for row in rows {
        println!(
            "{:<32}  {:<8}  {:<24}  {:.2}",
            text(&row["recorded_at"]),
            text(&row["kind"]),
            row["name"].as_str().unwrap_or("(unknown)"),
            row["score"].as_f64().unwrap_or(0.0),
        );
    }
}

fn print_stats(stats: &Value) {
    let count = |key: &str| stats[key].as_u64().unwrap_or(0);
    println!("Day:          {}", text(&stats["day"]));
    println!("Identities:   {}", count("identities"));
    println!("Accesses:     {}", count("accesses_on_day"));
    println!("Permitted:    {} ({} entries, {} exits, all time)", count("permitted"), count("entries"), count("exits"));
    println!("Unknown:      {} (all time)", count("unknown"));
}

/// Open the camera directly and report what the recognition pipeline would see.
fn camera_test(device: &str, frames: usize, snapshot: Option<&std::path::Path>) -> Result<()> {
    let devices = CameraSource::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("{}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    println!("\nOpening {device}...");
    let mut camera = CameraSource::open(device, CameraConfig::default())
        .with_context(|| format!("failed to open {device}"))?;
    println!("  format: {:?} {}x{}", camera.fourcc, camera.width, camera.height);

    let started = Instant::now();
    let mut captured = 0usize;
    let mut timeouts = 0usize;
    let mut brightness = 0.0f32;
    let mut last: Option<Frame> = None;
    while captured < frames {
        match camera.next_frame(Duration::from_secs(2)) {
            Ok(frame) => {
                captured += 1;
                brightness += frame.avg_brightness();
                last = Some(frame);
            }
            Err(CaptureError::Timeout) => {
                timeouts += 1;
                if timeouts >= 3 {
                    println!("  no frames for 6 s, giving up");
                    break;
                }
            }
            Err(e) => return Err(e).context("capture failed"),
        }
    }
    let elapsed = started.elapsed().as_secs_f32();

    println!("  frames captured: {captured}");
    if captured > 0 {
        println!("  rate: {:.1} fps", captured as f32 / elapsed.max(f32::EPSILON));
        println!("  mean brightness: {:.1}", brightness / captured as f32);
    }
    println!("  dark frames skipped: {}", camera.dark_frames());
    println!("  frames dropped: {}", camera.frames_dropped());
    println!("  capture errors: {}", camera.capture_errors());

    if let Some(path) = snapshot {
        let Some(frame) = last else {
            bail!("no frame captured, nothing to save");
        };
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save(path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("  snapshot saved to {}", path.display());
    }

    Ok(())
}
