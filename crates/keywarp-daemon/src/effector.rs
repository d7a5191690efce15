//! Side-effect layer.
//!
//! [`Effector`] is the only thing the interpreter and the mode coordinator
//! call to touch the outside world: synthetic key events through the
//! [`XBackend`], indicator updates through the [`Notify`] sink, and log
//! noise. It holds no state of its own and is cheap to construct per thread.

use anyhow::Result;

use keywarp_keymap::KeyCode;

use crate::bus::Notify;
use crate::state::Leds;
use crate::xserver::XBackend;

pub struct Effector<'a> {
    x: &'a dyn XBackend,
    notify: &'a dyn Notify,
}

impl<'a> Effector<'a> {
    pub fn new(x: &'a dyn XBackend, notify: &'a dyn Notify) -> Self {
        Self { x, notify }
    }

    pub fn press(&self, code: KeyCode) -> Result<()> {
        tracing::trace!("press {}", code);
        self.x.fake_key_event(code, true)
    }

    pub fn release(&self, code: KeyCode) -> Result<()> {
        tracing::trace!("release {}", code);
        self.x.fake_key_event(code, false)
    }

    /// Press or release depending on the direction of the physical event.
    pub fn trigger(&self, code: KeyCode, is_press: bool) -> Result<()> {
        if is_press {
            self.press(code)
        } else {
            self.release(code)
        }
    }

    pub fn press_release(&self, code: KeyCode) -> Result<()> {
        self.press(code)?;
        self.release(code)
    }

    /// Tap the hardware Caps Lock code, flipping the server-side lock state.
    pub fn change_caps_lock(&self, code: KeyCode) -> Result<()> {
        self.press_release(code)
    }

    pub fn notify_alternative(&self, on: bool) {
        self.notify.alternative(on);
    }

    pub fn notify_caps_lock(&self, on: bool) {
        self.notify.caps_lock(on);
    }

    pub fn leds(&self) -> Result<Leds> {
        self.x.leds()
    }

    pub fn current_layout(&self) -> Result<u8> {
        self.x.current_layout()
    }

    pub fn lock_layout_group(&self, group: u8) -> Result<()> {
        self.x.lock_layout_group(group)
    }

    /// Chatter about what the pipeline is doing. Content is not part of any
    /// contract; it exists for `--verbose` runs.
    pub fn noise(&self, msg: impl std::fmt::Display) {
        tracing::debug!("{}", msg);
    }
}
