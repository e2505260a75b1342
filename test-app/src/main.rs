// avrlink test application -- CLI tool for exercising a Marantz receiver
// against real hardware or a mock transport.
//
// Usage:
//   avrlink-test-app --port /dev/ttyUSB0 power get
//   avrlink-test-app --port /dev/ttyUSB0 volume set -- -35.5
//   avrlink-test-app --config living-room.json source set 3
//   avrlink-test-app --port /dev/ttyUSB0 --persistent monitor --duration 60
//   avrlink-test-app --mock identify
//
// Logging is controlled with RUST_LOG (default: info), e.g.
//   RUST_LOG=avrlink_line_io=debug avrlink-test-app --mock power get

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use avrlink_core::types::ConnectionPolicy;
use avrlink_marantz::commands::{self, MAX_VOLUME_MAGNITUDE};
use avrlink_marantz::{DeviceConfig, MarantzBuilder, MarantzReceiver, VolumeStep};
use avrlink_test_harness::{MockHandle, MockTransport};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// avrlink test application -- controls a Marantz receiver from the command line.
#[derive(Parser)]
#[command(name = "avrlink-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    /// Required unless --mock or --config is used.
    #[arg(long)]
    port: Option<String>,

    /// Override the baud rate (default: 9600).
    #[arg(long)]
    baud: Option<u32>,

    /// JSON device configuration file. --port and --baud override it.
    #[arg(long)]
    config: Option<String>,

    /// Use a mock transport with scripted replies instead of a serial port.
    /// Useful for verifying CLI parsing and builder wiring without hardware.
    #[arg(long)]
    mock: bool,

    /// Keep the port open between commands instead of opening per command.
    #[arg(long)]
    persistent: bool,

    /// Reply timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Spacing between commands in milliseconds.
    #[arg(long)]
    delay_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Power operations.
    Power {
        #[command(subcommand)]
        action: SwitchAction,
    },

    /// Mute operations.
    Mute {
        #[command(subcommand)]
        action: SwitchAction,
    },

    /// Volume operations.
    Volume {
        #[command(subcommand)]
        action: VolumeAction,
    },

    /// Input source operations.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Toggle the test tone.
    Tone,

    /// Power on and beep twice.
    Identify,

    /// Send a raw command (e.g. "@MSP:?") and print the reply.
    Raw {
        /// Command body; a trailing carriage return is added.
        body: String,
    },

    /// Subscribe to receiver events and print them in real time.
    Monitor {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Stress test: rapid-fire status queries through the command queue.
    Stress {
        /// Number of query cycles.
        #[arg(long, default_value_t = 20)]
        count: u32,
    },
}

#[derive(Subcommand)]
enum SwitchAction {
    /// Read the current state.
    Get,
    /// Switch on.
    On,
    /// Switch off.
    Off,
}

#[derive(Subcommand)]
enum VolumeAction {
    /// Read the master volume.
    Get,
    /// Set the master volume in dB (e.g. -35.5).
    Set {
        #[arg(allow_hyphen_values = true)]
        db: f32,
    },
    /// Step the volume.
    Step {
        #[arg(value_enum)]
        direction: StepArg,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Read the selected source.
    Get,
    /// Select a source (0-23).
    Set { source: u8 },
}

#[derive(Clone, Copy, ValueEnum)]
enum StepArg {
    Up,
    Down,
    UpFast,
    DownFast,
}

impl From<StepArg> for VolumeStep {
    fn from(step: StepArg) -> Self {
        match step {
            StepArg::Up => VolumeStep::Up,
            StepArg::Down => VolumeStep::Down,
            StepArg::UpFast => VolumeStep::UpFast,
            StepArg::DownFast => VolumeStep::DownFast,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_db(db_tenths: i16) -> String {
    format!("{:+.1} dB", f32::from(db_tenths) / 10.0)
}

fn db_to_tenths(db: f32) -> Result<i16> {
    let tenths = (db * 10.0).round();
    if !tenths.is_finite() || tenths.abs() > f32::from(MAX_VOLUME_MAGNITUDE) {
        bail!("volume {db} dB is outside ±99.9 dB");
    }
    Ok(tenths as i16)
}

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

// ---------------------------------------------------------------------------
// Receiver construction
// ---------------------------------------------------------------------------

fn make_builder(cli: &Cli) -> Result<MarantzBuilder> {
    let mut builder = match &cli.config {
        Some(path) => {
            let config = DeviceConfig::load(path)
                .with_context(|| format!("failed to load device config {path}"))?;
            MarantzBuilder::from_config(&config).context("invalid device config")?
        }
        None => MarantzBuilder::new(),
    };

    if let Some(port) = &cli.port {
        builder = builder.serial_port(port);
    }
    if let Some(baud) = cli.baud {
        builder = builder.baud_rate(baud);
    }
    if let Some(ms) = cli.timeout_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = cli.delay_ms {
        builder = builder.inter_command_delay(Duration::from_millis(ms));
    }
    if cli.persistent {
        builder = builder.connection_policy(ConnectionPolicy::Persistent);
    }
    Ok(builder)
}

/// Load the mock with the replies a receiver would give for `command`.
fn script_mock(mock: &mut MockTransport, command: &Command) -> Result<()> {
    fn reply(mock: &mut MockTransport, cmd: &str, line: &str) {
        mock.expect(cmd.as_bytes(), format!("{line}\r").as_bytes());
    }
    fn tone(mock: &mut MockTransport) {
        mock.expect_no_reply(commands::cmd_toggle_test_tone().as_bytes());
        reply(mock, &commands::cmd_read_volume(), "@VOL:-350");
    }

    match command {
        Command::Power { action } => match action {
            SwitchAction::Get => reply(mock, &commands::cmd_read_power(), "@PWR:2"),
            SwitchAction::On => reply(mock, &commands::cmd_set_power(true), "@PWR:2"),
            SwitchAction::Off => reply(mock, &commands::cmd_set_power(false), "@PWR:1"),
        },
        Command::Mute { action } => match action {
            SwitchAction::Get => reply(mock, &commands::cmd_read_mute(), "@AMT:1"),
            SwitchAction::On => reply(mock, &commands::cmd_set_mute(true), "@AMT:2"),
            SwitchAction::Off => reply(mock, &commands::cmd_set_mute(false), "@AMT:1"),
        },
        Command::Volume { action } => match action {
            VolumeAction::Get => reply(mock, &commands::cmd_read_volume(), "@VOL:-350"),
            VolumeAction::Set { db } => {
                let tenths = db_to_tenths(*db)?;
                reply(
                    mock,
                    &commands::cmd_set_volume(tenths)?,
                    &format!("@VOL:{tenths:+}"),
                );
            }
            VolumeAction::Step { direction } => reply(
                mock,
                &commands::cmd_step_volume((*direction).into()),
                "@VOL:-345",
            ),
        },
        Command::Source { action } => match action {
            SourceAction::Get => reply(mock, &commands::cmd_read_source(), "@SRC:11"),
            SourceAction::Set { source } => {
                let c = commands::source_to_char(*source)?;
                reply(mock, &commands::cmd_set_source(*source)?, &format!("@SRC:{c}{c}"));
            }
        },
        Command::Tone => tone(mock),
        Command::Identify => {
            reply(mock, &commands::cmd_set_power(true), "@PWR:2");
            tone(mock);
            tone(mock);
        }
        Command::Raw { body } => {
            let key = avrlink_line_io::protocol::extract_key(body);
            reply(mock, &avrlink_line_io::protocol::frame(body), &format!("{key}:0"));
        }
        Command::Monitor { .. } => {}
        Command::Stress { count } => {
            for _ in 0..*count {
                reply(mock, &commands::cmd_read_power(), "@PWR:2");
                reply(mock, &commands::cmd_read_mute(), "@AMT:1");
                reply(mock, &commands::cmd_read_volume(), "@VOL:-350");
                reply(mock, &commands::cmd_read_source(), "@SRC:11");
            }
        }
    }
    Ok(())
}

async fn create_receiver(cli: &Cli) -> Result<(MarantzReceiver, Option<MockHandle>)> {
    let builder = make_builder(cli)?;

    if cli.mock {
        let mut mock = MockTransport::new();
        script_mock(&mut mock, &cli.command)?;
        let handle = mock.handle();
        // Mock replies arrive instantly, so there is no need to wait between commands.
        let builder = match cli.delay_ms {
            Some(_) => builder,
            None => builder.inter_command_delay(Duration::from_millis(10)),
        };
        let receiver = builder
            .build_with_transport(Box::new(mock))
            .await
            .context("failed to build receiver with mock transport")?;
        println!("Using mock transport -- {}", receiver.name());
        Ok((receiver, Some(handle)))
    } else {
        if cli.port.is_none() && cli.config.is_none() {
            bail!("--port or --config is required when not using --mock");
        }
        let receiver = builder.build().await.context("failed to build receiver")?;
        info!(receiver = receiver.name(), "receiver ready");
        Ok((receiver, None))
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_power(receiver: &MarantzReceiver, action: &SwitchAction) -> Result<()> {
    match action {
        SwitchAction::Get => println!("Power: {}", on_off(receiver.power().await?)),
        SwitchAction::On => {
            receiver.set_power(true).await?;
            println!("Power set to ON");
        }
        SwitchAction::Off => {
            receiver.set_power(false).await?;
            println!("Power set to OFF");
        }
    }
    Ok(())
}

async fn cmd_mute(receiver: &MarantzReceiver, action: &SwitchAction) -> Result<()> {
    match action {
        SwitchAction::Get => println!("Mute: {}", on_off(receiver.mute().await?)),
        SwitchAction::On => {
            receiver.set_mute(true).await?;
            println!("Mute set to ON");
        }
        SwitchAction::Off => {
            receiver.set_mute(false).await?;
            println!("Mute set to OFF");
        }
    }
    Ok(())
}

async fn cmd_volume(receiver: &MarantzReceiver, action: &VolumeAction) -> Result<()> {
    match action {
        VolumeAction::Get => {
            println!("Volume: {}", format_db(receiver.volume().await?));
        }
        VolumeAction::Set { db } => {
            let sent = receiver.set_volume(db_to_tenths(*db)?).await?;
            println!("Volume set to {}", format_db(sent));
        }
        VolumeAction::Step { direction } => {
            match receiver.step_volume((*direction).into()).await? {
                Some(level) => println!("Volume now {}", format_db(level)),
                None => println!("Volume stepped"),
            }
        }
    }
    Ok(())
}

async fn cmd_source(receiver: &MarantzReceiver, action: &SourceAction) -> Result<()> {
    match action {
        SourceAction::Get => println!("Source: {}", receiver.source().await?),
        SourceAction::Set { source } => {
            receiver.set_source(*source).await?;
            println!("Source set to {source}");
        }
    }
    Ok(())
}

async fn cmd_tone(receiver: &MarantzReceiver) -> Result<()> {
    receiver.toggle_test_tone().await?;
    println!("Test tone toggled");
    Ok(())
}

async fn cmd_identify(receiver: &MarantzReceiver) -> Result<()> {
    receiver.identify().await?;
    println!("Identify complete");
    Ok(())
}

async fn cmd_raw(receiver: &MarantzReceiver, body: &str) -> Result<()> {
    let line = receiver.raw_command(body).await?;
    println!("{line}");
    Ok(())
}

async fn cmd_monitor(
    receiver: &MarantzReceiver,
    mock: Option<&MockHandle>,
    duration_secs: u64,
) -> Result<()> {
    let mut event_rx = receiver.subscribe();
    receiver.connect().await.context("failed to open port")?;

    if let Some(handle) = mock {
        for line in ["@PWR:2", "@VOL:-300", "@AMT:2", "@SRC:33"] {
            handle.push_line(line);
        }
    }

    println!("Monitoring receiver events (Ctrl-C to stop)...");

    let deadline = if duration_secs > 0 {
        Some(Instant::now() + Duration::from_secs(duration_secs))
    } else {
        None
    };

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted.");
                break;
            }
            result = tokio::time::timeout(timeout, event_rx.recv()) => match result {
                Ok(Ok(event)) => {
                    println!("[event] {event:?}");
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                    println!("Event channel closed.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        println!("Monitor duration elapsed.");
                    }
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn cmd_stress(receiver: &MarantzReceiver, count: u32) -> Result<()> {
    println!("Stress test: {count} cycles of power/mute/volume/source queries");

    let mut success = 0u32;
    let mut failures = 0u32;
    let start = Instant::now();

    for i in 1..=count {
        let results = [
            receiver.power().await.map(|_| ()),
            receiver.mute().await.map(|_| ()),
            receiver.volume().await.map(|_| ()),
            receiver.source().await.map(|_| ()),
        ];
        for result in results {
            match result {
                Ok(()) => success += 1,
                Err(e) => {
                    eprintln!("[{i}/{count}] query failed: {e}");
                    failures += 1;
                }
            }
        }
    }

    let elapsed = start.elapsed();
    let total = success + failures;
    let rate = if elapsed.as_secs_f64() > 0.0 {
        f64::from(total) / elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!();
    println!("Results:");
    println!("  Total queries:  {total}");
    println!("  Successes:      {success}");
    println!("  Failures:       {failures}");
    println!("  Elapsed:        {:.3} s", elapsed.as_secs_f64());
    println!("  Rate:           {rate:.1} queries/sec");

    let snapshot = receiver.snapshot().await?;
    println!(
        "  Final state:    {} (queued {}, pending {:?})",
        snapshot.connection, snapshot.queued, snapshot.pending
    );

    if failures > 0 {
        bail!("{failures} out of {total} stress test queries failed");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (receiver, mock) = create_receiver(&cli).await?;

    let result = match &cli.command {
        Command::Power { action } => cmd_power(&receiver, action).await,
        Command::Mute { action } => cmd_mute(&receiver, action).await,
        Command::Volume { action } => cmd_volume(&receiver, action).await,
        Command::Source { action } => cmd_source(&receiver, action).await,
        Command::Tone => cmd_tone(&receiver).await,
        Command::Identify => cmd_identify(&receiver).await,
        Command::Raw { body } => cmd_raw(&receiver, body).await,
        Command::Monitor { duration } => cmd_monitor(&receiver, mock.as_ref(), *duration).await,
        Command::Stress { count } => cmd_stress(&receiver, *count).await,
    };

    receiver.shutdown().await.ok();
    result
}
