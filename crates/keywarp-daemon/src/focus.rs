//! Window-focus watcher.
//!
//! Runs on its own X connection so its blocking event wait never interferes
//! with the synthetic-event traffic. Whenever `_NET_ACTIVE_WINDOW` changes
//! on the root window, the watcher asks the mode coordinator to turn
//! Alternative mode off and reset the keyboard layout — deferred like any
//! other mode change if keys are still held. Caps Lock is left alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ChangeWindowAttributesAux, ConnectionExt as _, EventMask};
use x11rb::protocol::Event;

use crate::bus::Notify;
use crate::effector::Effector;
use crate::modes;
use crate::state::State;
use crate::xserver::XBackend;

pub fn spawn_focus_watcher(
    state: Arc<Mutex<State>>,
    x: Arc<dyn XBackend>,
    notify: Arc<dyn Notify>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let (conn, screen_num) =
        x11rb::connect(None).context("focus watcher failed to connect to the X server")?;
    let root = conn.setup().roots[screen_num].root;

    let net_active_window = conn
        .intern_atom(false, b"_NET_ACTIVE_WINDOW")
        .context("intern-atom request failed")?
        .reply()
        .context("intern-atom reply failed")?
        .atom;

    conn.change_window_attributes(
        root,
        &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
    )
    .context("failed to select property events on the root window")?;
    conn.flush().context("flush failed")?;

    let handle = std::thread::Builder::new()
        .name("focus-watcher".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let event = match conn.wait_for_event() {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("focus watcher lost its X connection: {}", e);
                        break;
                    }
                };
                let Event::PropertyNotify(notify_event) = event else {
                    continue;
                };
                if notify_event.atom != net_active_window {
                    continue;
                }

                tracing::debug!("focused window changed, requesting mode reset");
                let mut st = state.lock();
                let fx = Effector::new(x.as_ref(), notify.as_ref());
                if let Err(e) = modes::turn_alternative(&mut st, &fx, false)
                    .and_then(|_| modes::request_layout_reset(&mut st, &fx))
                {
                    tracing::warn!("focus-change reset failed: {:#}", e);
                }
            }
        })
        .context("failed to spawn the focus watcher thread")?;

    Ok(handle)
}
