//! Screen-Mirror device engine: entry point.
//!
//! Starts the signaling server, wires the capture manager, the WebRTC
//! connector and the input backend together, and runs until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! mirror-device [OPTIONS]
//!
//! Options:
//!   --config <PATH>            TOML configuration file [default: mirror-device.toml]
//!   --bind <IP>                Signaling bind address
//!   --port <PORT>              Signaling port
//!   --device-name <NAME>       Name reported in device_info
//!   --device-id <ID>           Identifier reported in device_info
//!   --frame-rate <FPS>         Capture frame rate
//!   --attach-policy <POLICY>   fan-out | exclusive
//!   --input-backend <BACKEND>  shell | record
//!   --grant <TOKEN>            Submit a capture grant at startup
//! ```
//!
//! Flags override the configuration file; the file overrides built-in
//! defaults.
//!
//! # Environment variable overrides
//!
//! | Variable               | Flag               |
//! |------------------------|--------------------|
//! | `MIRROR_CONFIG`        | `--config`         |
//! | `MIRROR_BIND`          | `--bind`           |
//! | `MIRROR_PORT`          | `--port`           |
//! | `MIRROR_DEVICE_NAME`   | `--device-name`    |
//! | `MIRROR_DEVICE_ID`     | `--device-id`      |
//! | `MIRROR_FRAME_RATE`    | `--frame-rate`     |
//! | `MIRROR_ATTACH_POLICY` | `--attach-policy`  |
//! | `MIRROR_INPUT_BACKEND` | `--input-backend`  |
//! | `MIRROR_GRANT`         | `--grant`          |
//!
//! `RUST_LOG` takes precedence over the configured `log_level`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mirror_core::{AttachPolicy, CaptureGrant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mirror_device::application::{
    CaptureManager, CaptureSettings, ControlTranslator, DeviceInfo, InputInjector,
    SessionRegistry,
};
use mirror_device::domain::{DeviceConfig, InputBackend};
use mirror_device::infrastructure::capture_source::GRANT_OK;
use mirror_device::infrastructure::{
    load_config, RecordingInjector, ShellInjector, SignalingServer, SyntheticCapturer,
    WebRtcConnector,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Screen-Mirror device engine.
///
/// Serves signaling to controllers on the local network, streams the screen
/// over WebRTC, and injects the controller's touch and key input.
#[derive(Debug, Parser)]
#[command(
    name = "mirror-device",
    about = "Screen-Mirror target-device engine",
    version
)]
struct Cli {
    /// TOML configuration file.  A missing file means built-in defaults.
    #[arg(long, default_value = "mirror-device.toml", env = "MIRROR_CONFIG")]
    config: PathBuf,

    /// IP address for the signaling listener.
    #[arg(long, env = "MIRROR_BIND")]
    bind: Option<String>,

    /// TCP port for the signaling listener.
    #[arg(long, env = "MIRROR_PORT")]
    port: Option<u16>,

    #[arg(long, env = "MIRROR_DEVICE_NAME")]
    device_name: Option<String>,

    #[arg(long, env = "MIRROR_DEVICE_ID")]
    device_id: Option<String>,

    #[arg(long, env = "MIRROR_FRAME_RATE")]
    frame_rate: Option<u32>,

    /// How sessions share the capture stream.
    #[arg(long, env = "MIRROR_ATTACH_POLICY")]
    attach_policy: Option<AttachPolicy>,

    #[arg(long, env = "MIRROR_INPUT_BACKEND")]
    input_backend: Option<InputBackend>,

    /// Capture grant token to submit at startup, standing in for the
    /// platform permission prompt.
    #[arg(long, env = "MIRROR_GRANT")]
    grant: Option<String>,
}

impl Cli {
    /// Applies the flags that were given on top of `cfg` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged configuration is invalid.
    fn apply(&self, mut cfg: DeviceConfig) -> anyhow::Result<DeviceConfig> {
        if let Some(bind) = &self.bind {
            cfg.server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(name) = &self.device_name {
            cfg.device.name = name.clone();
        }
        if let Some(id) = &self.device_id {
            cfg.device.id = id.clone();
        }
        if let Some(rate) = self.frame_rate {
            cfg.capture.frame_rate = rate;
        }
        if let Some(policy) = self.attach_policy {
            cfg.capture.attach_policy = policy;
        }
        if let Some(backend) = self.input_backend {
            cfg.control.input_backend = backend;
        }
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file_config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let cfg = cli.apply(file_config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!(
        "Screen-Mirror device '{}' ({}) starting, signaling on {}:{}, {} policy",
        cfg.device.name,
        cfg.device.id,
        cfg.server.bind_address,
        cfg.server.port,
        cfg.capture.attach_policy
    );

    // ── Wiring ────────────────────────────────────────────────────────────────
    let capture = CaptureManager::new(
        Arc::new(SyntheticCapturer::new()),
        CaptureSettings {
            metrics: cfg.capture.metrics(),
            frame_rate: cfg.capture.frame_rate,
            bitrate_bps: cfg.capture.bitrate_bps,
        },
        cfg.capture.attach_policy,
        cfg.capture.drop_excess_frames,
    );

    let injector: Arc<dyn InputInjector> = match cfg.control.input_backend {
        InputBackend::Shell => Arc::new(ShellInjector::spawn(
            cfg.control.input_program.clone(),
            cfg.control.input_queue,
        )),
        InputBackend::Record => Arc::new(RecordingInjector::new()),
    };
    let translator = Arc::new(ControlTranslator::new(
        injector,
        cfg.control.gesture_timings(),
    ));

    let connector = Arc::new(
        WebRtcConnector::new(&cfg.webrtc, cfg.capture.frame_rate)
            .context("failed to initialise WebRTC")?,
    );

    let registry = Arc::new(SessionRegistry::new(
        connector,
        capture,
        translator,
        DeviceInfo {
            name: cfg.device.name.clone(),
            id: cfg.device.id.clone(),
        },
    ));

    let server = SignalingServer::new(&cfg.server, Arc::clone(&registry))?;
    server.start().await;

    if let Some(token) = &cli.grant {
        registry
            .submit_grant(CaptureGrant::new(GRANT_OK, token.clone()))
            .await
            .context("capture grant rejected")?;
    }

    // ── Run until Ctrl+C ──────────────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl+C signal: {e}");
    }
    info!("received Ctrl+C, shutting down");

    server.stop().await;
    registry.shutdown(cfg.server.shutdown_grace()).await;

    let counters = registry.capture().counters();
    info!(
        "Screen-Mirror device stopped ({} produced, {} forwarded, {} dropped)",
        counters.produced, counters.forwarded, counters.dropped
    );
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
