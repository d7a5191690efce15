//! keywarpd
//!
//! Reads raw key events from evdev keyboards, reinterprets them (alternative
//! layer, additional controls, Apple media overlay, chord toggles) and
//! synthesizes the results to the X server via XTest, keeping a status bar
//! updated over D-Bus along the way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use keywarp_daemon::bus::{self, Notifier, Notify};
use keywarp_daemon::device;
use keywarp_daemon::focus;
use keywarp_daemon::interpreter::Interpreter;
use keywarp_daemon::options::{Cli, Options};
use keywarp_daemon::state::State;
use keywarp_daemon::xserver::{XBackend, XServer};
use keywarp_keymap::Keymap;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        }))
        .init();

    let opts = Options::from(&cli);
    tracing::debug!("effective options: {:?}", opts);

    let keymap = Keymap::new();
    keymap.validate().context("key table is incomplete")?;

    let x = Arc::new(XServer::connect()?);
    x.set_xinput_devices_enabled(
        &cli.disable_xinput_device_name,
        &cli.disable_xinput_device_id,
        false,
    )?;

    let notifier = Arc::new(Notifier::new(cli.xmobar_pipe.as_deref()));

    let leds = x.leds().context("failed to read LED state")?;
    tracing::info!(
        "initial indicator state: caps={} num={}",
        leds.caps_lock,
        leds.num_lock
    );
    let state = Arc::new(Mutex::new(State::new(leds)));
    // A bar that was already running gets correct state right away.
    notifier.flush_all(leds.num_lock, leds.caps_lock, false);

    let interpreter = Arc::new(Interpreter::new(keymap, opts));

    let mut paths = cli.device_paths();
    if paths.is_empty() {
        paths = device::discover_keyboards()?;
    }
    if paths.is_empty() {
        bail!("no keyboard devices found; pass device paths on the command line");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())
        .context("failed to register SIGTERM handler")?;

    let x_backend: Arc<dyn XBackend> = x.clone();
    let notify: Arc<dyn Notify> = notifier.clone();

    for path in &paths {
        device::spawn_reader(
            path,
            interpreter.clone(),
            state.clone(),
            x_backend.clone(),
            notify.clone(),
            shutdown.clone(),
            failed.clone(),
        )?;
    }

    if opts.reset_by_window_focus {
        focus::spawn_focus_watcher(
            state.clone(),
            x_backend.clone(),
            notify.clone(),
            shutdown.clone(),
        )?;
    }

    bus::spawn_flush_listener(notifier.clone(), state.clone(), x_backend.clone())?;

    tracing::info!("keywarpd running on {} device(s)", paths.len());

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    if let Err(e) = x.set_xinput_devices_enabled(
        &cli.disable_xinput_device_name,
        &cli.disable_xinput_device_id,
        true,
    ) {
        tracing::warn!("failed to re-enable xinput devices: {:#}", e);
    }

    if failed.load(Ordering::Relaxed) {
        bail!("event pipeline failed; see the log above");
    }
    Ok(())
}
