//! Shared daemon state.
//!
//! One [`State`] value exists per daemon run, owned behind a single
//! `parking_lot::Mutex`. Every thread that wants to mutate it (evdev readers,
//! the focus watcher, the flush listener) takes that lock for the duration of
//! exactly one event's worth of work, so nothing ever observes a partially
//! updated record.

use std::collections::HashSet;

use keywarp_keymap::KeyName;

/// LED state as last observed on the X server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leds {
    pub caps_lock: bool,
    pub num_lock: bool,
}

/// Substates of the combo machinery.
///
/// At most one of the additional-control substates is non-idle at a time:
/// `caps_lock_combo`/`pressed_before_caps_lock` on the Caps side and
/// `enter_combo`/`pressed_before_enter` on the Enter side never hold
/// simultaneously under normal key sequences.
#[derive(Debug, Clone, Default)]
pub struct ComboState {
    /// FN+media overlay is active.
    pub apple_media_pressed: bool,

    /// Caps Lock has been upgraded to a held Left Control.
    pub caps_lock_combo: bool,
    /// Enter has been upgraded to a held Right Control.
    pub enter_combo: bool,

    /// Keys already held when Caps Lock went down.
    pub pressed_before_caps_lock: HashSet<KeyName>,
    /// Keys already held when Enter went down.
    pub pressed_before_enter: HashSet<KeyName>,

    /// Enter was pressed with exactly these modifiers held and nothing else
    /// has happened since.
    pub enter_with_mods: Option<HashSet<KeyName>>,

    /// Pending deferred toggles, applied by the mode coordinator once the
    /// keyboard is idle.
    pub caps_lock_mode_change: Option<bool>,
    pub alternative_mode_change: Option<bool>,
    pub reset_kbd_layout: bool,
}

impl ComboState {
    /// Drop every transient combo substate (the pending mode-change slots are
    /// the coordinator's business and survive).
    pub fn reset_transient(&mut self) {
        self.apple_media_pressed = false;
        self.caps_lock_combo = false;
        self.enter_combo = false;
        self.pressed_before_caps_lock.clear();
        self.pressed_before_enter.clear();
        self.enter_with_mods = None;
    }
}

/// The daemon's single mutable record.
#[derive(Debug, Clone, Default)]
pub struct State {
    /// Every key with a press observed and no matching release yet.
    pub pressed: HashSet<KeyName>,
    /// Alternative mode is on.
    pub alternative: bool,
    pub leds: Leds,
    pub combo: ComboState,
}

impl State {
    pub fn new(leds: Leds) -> Self {
        Self {
            leds,
            ..Self::default()
        }
    }

    /// The keyboard is idle: nothing is physically held.
    pub fn is_idle(&self) -> bool {
        self.pressed.is_empty()
    }

    /// Everything held except `name`.
    pub fn other_pressed(&self, name: KeyName) -> HashSet<KeyName> {
        let mut other = self.pressed.clone();
        other.remove(&name);
        other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_idle_with_sampled_leds() {
        let st = State::new(Leds {
            caps_lock: true,
            num_lock: false,
        });
        assert!(st.is_idle());
        assert!(st.leds.caps_lock);
        assert!(!st.alternative);
        assert!(st.combo.enter_with_mods.is_none());
    }

    #[test]
    fn other_pressed_excludes_the_named_key() {
        let mut st = State::default();
        st.pressed.insert(KeyName::AKey);
        st.pressed.insert(KeyName::ShiftLeftKey);
        let other = st.other_pressed(KeyName::AKey);
        assert_eq!(other.len(), 1);
        assert!(other.contains(&KeyName::ShiftLeftKey));
    }

    #[test]
    fn reset_transient_keeps_pending_mode_changes() {
        let mut combo = ComboState {
            apple_media_pressed: true,
            caps_lock_combo: true,
            caps_lock_mode_change: Some(true),
            reset_kbd_layout: true,
            ..ComboState::default()
        };
        combo.pressed_before_enter.insert(KeyName::AKey);
        combo.reset_transient();
        assert!(!combo.apple_media_pressed);
        assert!(!combo.caps_lock_combo);
        assert!(combo.pressed_before_enter.is_empty());
        assert_eq!(combo.caps_lock_mode_change, Some(true));
        assert!(combo.reset_kbd_layout);
    }
}
