//! X server binding layer.
//!
//! The interpreter and the mode coordinator talk to X exclusively through the
//! [`XBackend`] trait: synthetic key events (XTest), LED state and keyboard
//! group (XKB). [`XServer`] is the production implementation over an x11rb
//! connection; tests substitute a recording fake.
//!
//! The xinput device muting used by `--disable-xinput-device-*` lives here
//! too, as plain methods on [`XServer`] — nothing else needs it.

use anyhow::{bail, Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::xinput::{self, ConnectionExt as _};
use x11rb::protocol::xkb::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, ConnectionExt as _, AtomEnum};
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

use keywarp_keymap::KeyCode;

use crate::state::Leds;

/// The X primitives the event pipeline needs.
pub trait XBackend: Send + Sync {
    /// Synthesize one key press or release.
    fn fake_key_event(&self, code: KeyCode, is_press: bool) -> Result<()>;

    /// Current lock-indicator state.
    fn leds(&self) -> Result<Leds>;

    /// Index of the currently active XKB group (layout).
    fn current_layout(&self) -> Result<u8>;

    /// Lock the given XKB group.
    fn lock_layout_group(&self, group: u8) -> Result<()>;
}

/// Production backend over a shared x11rb connection.
///
/// `RustConnection` is thread-safe; one `XServer` serves every event thread.
pub struct XServer {
    conn: RustConnection,
    root: xproto::Window,
}

impl XServer {
    /// Connect to the display and initialize the XTest and XKB extensions.
    /// Either extension missing is fatal: the daemon cannot do its job
    /// without them.
    pub fn connect() -> Result<Self> {
        let (conn, screen_num) =
            x11rb::connect(None).context("failed to connect to the X server")?;
        let root = conn.setup().roots[screen_num].root;

        conn.xtest_get_version(2, 2)
            .context("XTest version request failed")?
            .reply()
            .context("the X server does not support the XTest extension")?;

        let xkb = conn
            .xkb_use_extension(1, 0)
            .context("XKB version request failed")?
            .reply()
            .context("XKB use-extension request failed")?;
        if !xkb.supported {
            bail!("the X server does not support the XKB extension");
        }

        Ok(Self { conn, root })
    }

    fn xkb_state(&self) -> Result<xkb::GetStateReply> {
        self.conn
            .xkb_get_state(xkb::ID::USE_CORE_KBD.into())
            .context("XKB get-state request failed")?
            .reply()
            .context("XKB get-state reply failed")
    }

    /// Resolve xinput devices by name or id and flip their `Device Enabled`
    /// property. Unknown names/ids are fatal: they indicate a
    /// misconfiguration the user should notice immediately.
    pub fn set_xinput_devices_enabled(
        &self,
        names: &[String],
        ids: &[u8],
        enabled: bool,
    ) -> Result<()> {
        if names.is_empty() && ids.is_empty() {
            return Ok(());
        }

        let reply = self
            .conn
            .xinput_list_input_devices()
            .context("xinput list-devices request failed")?
            .reply()
            .context("xinput list-devices reply failed")?;

        let atom = self
            .conn
            .intern_atom(false, b"Device Enabled")
            .context("intern-atom request failed")?
            .reply()
            .context("intern-atom reply failed")?
            .atom;

        let mut targets: Vec<(u8, String)> = Vec::new();
        for (info, name) in reply.devices.iter().zip(reply.names.iter()) {
            let name = String::from_utf8_lossy(&name.name).into_owned();
            if names.contains(&name) || ids.contains(&info.device_id) {
                targets.push((info.device_id, name));
            }
        }

        for wanted in names {
            if !targets.iter().any(|(_, n)| n == wanted) {
                bail!("no xinput device named {:?}", wanted);
            }
        }
        for wanted in ids {
            if !targets.iter().any(|(id, _)| id == wanted) {
                bail!("no xinput device with id {}", wanted);
            }
        }

        for (device_id, name) in targets {
            tracing::info!(
                "{} xinput device '{}' (id {})",
                if enabled { "enabling" } else { "disabling" },
                name,
                device_id
            );
            self.conn
                .xinput_change_device_property(
                    atom,
                    AtomEnum::INTEGER.into(),
                    device_id,
                    xproto::PropMode::REPLACE,
                    1,
                    &xinput::ChangeDevicePropertyAux::Data8(vec![u8::from(enabled)]),
                )
                .with_context(|| format!("failed to toggle xinput device {}", device_id))?;
        }
        self.conn.flush().context("flush failed")?;
        Ok(())
    }
}

impl XBackend for XServer {
    fn fake_key_event(&self, code: KeyCode, is_press: bool) -> Result<()> {
        let kind = if is_press {
            xproto::KEY_PRESS_EVENT
        } else {
            xproto::KEY_RELEASE_EVENT
        };
        self.conn
            .xtest_fake_input(kind, code, x11rb::CURRENT_TIME, self.root, 0, 0, 0)
            .context("XTest fake-input request failed")?;
        self.conn.flush().context("flush failed")?;
        Ok(())
    }

    fn leds(&self) -> Result<Leds> {
        let state = self.xkb_state()?;
        let locked = u16::from(state.locked_mods);
        Ok(Leds {
            caps_lock: locked & u16::from(xproto::ModMask::LOCK) != 0,
            num_lock: locked & u16::from(xproto::ModMask::M2) != 0,
        })
    }

    fn current_layout(&self) -> Result<u8> {
        Ok(u8::from(self.xkb_state()?.group))
    }

    fn lock_layout_group(&self, group: u8) -> Result<()> {
        let zero = xproto::ModMask::from(0u16);
        self.conn
            .xkb_latch_lock_state(
                xkb::ID::USE_CORE_KBD.into(),
                zero,
                zero,
                true,
                xkb::Group::from(group),
                zero,
                false,
                0,
            )
            .context("XKB latch-lock-state request failed")?;
        self.conn.flush().context("flush failed")?;
        Ok(())
    }
}
