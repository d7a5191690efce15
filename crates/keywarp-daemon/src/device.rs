//! evdev device discovery and reader threads.
//!
//! One blocking reader thread per device. Each thread owns its device handle
//! and file descriptor; it only takes the shared state lock once it has a
//! decoded event to apply, so a quiet keyboard costs nothing.
//!
//! Devices are not grabbed: X keeps seeing the hardware, and the
//! `--disable-xinput-device-*` flags exist to mute the originals inside the
//! server instead.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use evdev::{Device, EventType};
use parking_lot::Mutex;

use crate::bus::Notify;
use crate::effector::Effector;
use crate::interpreter::Interpreter;
use crate::state::State;
use crate::xserver::XBackend;

/// A device qualifies as a keyboard if it reports key events and has a
/// letter key.
pub fn is_keyboard(device: &Device) -> bool {
    device.supported_events().contains(EventType::KEY)
        && device
            .supported_keys()
            .map(|keys| keys.contains(evdev::Key::KEY_A))
            .unwrap_or(false)
}

/// Enumerate `/dev/input/event*` and keep the keyboards.
pub fn discover_keyboards() -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for entry in std::fs::read_dir("/dev/input").context("cannot read /dev/input")? {
        let entry = entry.context("cannot read /dev/input entry")?;
        let path = entry.path();

        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false)
        {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                if is_keyboard(&device) {
                    tracing::info!(
                        "using keyboard '{}' at {}",
                        device.name().unwrap_or("Unknown"),
                        path.display()
                    );
                    paths.push(path);
                } else {
                    tracing::debug!("skipping non-keyboard {}", path.display());
                }
            }
            Err(e) => {
                tracing::debug!("could not open {}: {}", path.display(), e);
            }
        }
    }

    Ok(paths)
}

/// Spawn the blocking reader for one device.
///
/// Opening the device happens before the thread starts so a bad path fails
/// the whole startup instead of dying quietly in the background. Inside the
/// thread, an X failure is fatal for the daemon: the thread raises both
/// flags and stops.
#[allow(clippy::too_many_arguments)]
pub fn spawn_reader(
    path: &Path,
    interpreter: Arc<Interpreter>,
    state: Arc<Mutex<State>>,
    x: Arc<dyn XBackend>,
    notify: Arc<dyn Notify>,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let mut device = Device::open(path)
        .with_context(|| format!("failed to open input device {}", path.display()))?;
    let name = device.name().unwrap_or("Unknown").to_string();
    tracing::info!("reading events from '{}' ({})", name, path.display());

    let path = path.to_path_buf();
    let thread_path = path.clone();
    let handle = std::thread::Builder::new()
        .name(format!("evdev-{}", path.display()))
        .spawn(move || {
            let path = thread_path;
            while !shutdown.load(Ordering::Relaxed) {
                let events = match device.fetch_events() {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(
                            "lost input device '{}' ({}): {}",
                            name,
                            path.display(),
                            e
                        );
                        break;
                    }
                };

                for event in events {
                    if event.event_type() != EventType::KEY {
                        continue;
                    }
                    // 0 = release, 1 = press; autorepeat (2) never reaches
                    // the interpreter.
                    let is_pressed = match event.value() {
                        0 => false,
                        1 => true,
                        _ => continue,
                    };
                    let Some(alias) = interpreter.keymap().alias_of(event.code()) else {
                        tracing::trace!("unknown evdev code {} dropped", event.code());
                        continue;
                    };

                    let mut st = state.lock();
                    let fx = Effector::new(x.as_ref(), notify.as_ref());
                    if let Err(e) = interpreter.handle_key_event(&mut st, &fx, alias, is_pressed)
                    {
                        tracing::error!(
                            "fatal error while handling {:?}: {:#}",
                            alias.name,
                            e
                        );
                        failed.store(true, Ordering::Relaxed);
                        shutdown.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
        })
        .with_context(|| format!("failed to spawn reader thread for {}", path.display()))?;

    Ok(handle)
}
