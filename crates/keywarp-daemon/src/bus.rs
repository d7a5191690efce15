//! Status-bar IPC.
//!
//! Indicator state goes out as broadcast D-Bus signals on the session bus:
//! `numlock`, `capslock` and `alternative`, each carrying a single boolean,
//! on the `com.github.keywarp.Indicators` interface. A status bar that
//! (re)starts can ask for the current state by emitting a
//! `request_flush_all` signal on the `com.github.keywarp.Flush` interface;
//! the listener thread answers by re-emitting all three indicators.
//!
//! When `--xmobar-pipe` is given, the same transitions are also written as
//! `alternative:on`-style lines to the FIFO, for bars that read a pipe
//! instead of the bus.
//!
//! Nothing in here is allowed to take the daemon down: a missing session
//! bus, a bar that is not running, a full pipe — all of it degrades to log
//! warnings while the event pipeline keeps going.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::state::State;
use crate::xserver::XBackend;

pub const INDICATORS_PATH: &str = "/com/github/keywarp";
pub const INDICATORS_INTERFACE: &str = "com.github.keywarp.Indicators";
pub const FLUSH_PATH: &str = "/com/github/keywarp";
pub const FLUSH_INTERFACE: &str = "com.github.keywarp.Flush";
pub const FLUSH_MEMBER: &str = "request_flush_all";

/// Indicator sink the effector emits into. Implementations must swallow
/// their own failures.
pub trait Notify: Send + Sync {
    fn alternative(&self, on: bool);
    fn caps_lock(&self, on: bool);
    fn num_lock(&self, on: bool);
}

/// Production notifier: session-bus signals plus the optional xmobar FIFO.
pub struct Notifier {
    conn: Option<zbus::blocking::Connection>,
    pipe: Option<Mutex<File>>,
}

impl Notifier {
    /// Connecting to the bus or opening the pipe can fail without killing
    /// the daemon; the affected channel is simply disabled with a warning.
    pub fn new(xmobar_pipe: Option<&Path>) -> Self {
        let conn = match zbus::blocking::Connection::session() {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!("session bus unavailable, indicator signals disabled: {}", e);
                None
            }
        };

        let pipe = xmobar_pipe.and_then(|path| {
            // O_NONBLOCK so a FIFO without a reader neither hangs the open
            // nor the writes.
            match OpenOptions::new()
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    tracing::warn!(
                        "could not open xmobar pipe {}: {}",
                        path.display(),
                        e
                    );
                    None
                }
            }
        });

        Self { conn, pipe }
    }

    fn emit(&self, member: &str, on: bool) {
        if let Some(conn) = &self.conn {
            if let Err(e) = conn.emit_signal(
                Option::<&str>::None,
                INDICATORS_PATH,
                INDICATORS_INTERFACE,
                member,
                &(on,),
            ) {
                tracing::warn!("failed to emit {} signal: {}", member, e);
            }
        }
        if let Some(pipe) = &self.pipe {
            let line = format!("{}:{}\n", member, if on { "on" } else { "off" });
            if let Err(e) = pipe.lock().write_all(line.as_bytes()) {
                tracing::warn!("failed to write to xmobar pipe: {}", e);
            }
        }
    }

    /// Re-emit every indicator, for startup and flush requests.
    pub fn flush_all(&self, num_lock: bool, caps_lock: bool, alternative: bool) {
        self.num_lock(num_lock);
        self.caps_lock(caps_lock);
        self.alternative(alternative);
    }
}

impl Notify for Notifier {
    fn alternative(&self, on: bool) {
        tracing::debug!("indicator alternative:{}", if on { "on" } else { "off" });
        self.emit("alternative", on);
    }

    fn caps_lock(&self, on: bool) {
        self.emit("capslock", on);
    }

    fn num_lock(&self, on: bool) {
        self.emit("numlock", on);
    }
}

/// Spawn the `request_flush_all` listener.
///
/// Returns `None` when the session bus is unavailable (the daemon then runs
/// without a flush channel, matching the notifier's degraded mode).
pub fn spawn_flush_listener(
    notifier: Arc<Notifier>,
    state: Arc<Mutex<State>>,
    x: Arc<dyn XBackend>,
) -> Result<Option<JoinHandle<()>>> {
    let conn = match zbus::blocking::Connection::session() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!("session bus unavailable, flush listener disabled: {}", e);
            return Ok(None);
        }
    };

    let rule = zbus::MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .path(FLUSH_PATH)
        .context("bad flush object path")?
        .interface(FLUSH_INTERFACE)
        .context("bad flush interface name")?
        .member(FLUSH_MEMBER)
        .context("bad flush member name")?
        .build();

    let iter = zbus::blocking::MessageIterator::for_match_rule(rule, &conn, Some(8))
        .context("failed to subscribe to flush requests")?;

    let handle = std::thread::Builder::new()
        .name("flush-listener".into())
        .spawn(move || {
            for msg in iter {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("flush listener lost a message: {}", e);
                        continue;
                    }
                };
                // The request carries no arguments; anything else is some
                // other protocol and gets ignored.
                if !msg
                    .body()
                    .signature()
                    .map(|s| s.to_string())
                    .unwrap_or_default()
                    .is_empty()
                {
                    tracing::debug!("ignoring flush request with non-empty body");
                    continue;
                }

                let mut st = state.lock();
                match x.leds() {
                    Ok(leds) => st.leds = leds,
                    Err(e) => tracing::warn!("could not re-sample LEDs for flush: {}", e),
                }
                let (num, caps, alt) = (st.leds.num_lock, st.leds.caps_lock, st.alternative);
                drop(st);

                tracing::debug!("flushing indicator state on request");
                notifier.flush_all(num, caps, alt);
            }
        })
        .context("failed to spawn the flush listener thread")?;

    Ok(Some(handle))
}
