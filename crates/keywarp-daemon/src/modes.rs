//! Deferred mode coordinator.
//!
//! Caps Lock mode, Alternative mode and the keyboard-layout reset all follow
//! the same discipline: apply immediately if the keyboard is idle, otherwise
//! park the request in its `ComboState` slot and retry on every subsequent
//! event until the last physical key is released. Flipping a mode while keys
//! are held would make their release events arrive under the new mapping.
//!
//! ```text
//!  turn_*/toggle_* ──┬── keyboard idle ──────────> apply, clear slot
//!                    └── keys held ──> slot=Some ─┐
//!                                                 │ every event
//!  handle_*_mode_change <─────────────────────────┘
//!        ├── target already in effect ──> clear slot
//!        ├── keyboard idle ─────────────> apply, clear slot
//!        └── keys still held ───────────> leave slot, retry next event
//! ```

use anyhow::{Context, Result};
use keywarp_keymap::{KeyName, Keymap};

use crate::effector::Effector;
use crate::state::State;

/// What a mode request did, spelled out so call sites read like the table
/// above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// Handler ran, slot cleared.
    Applied,
    /// Keys are held; parked in the slot for the post-step to pick up.
    Pending,
    /// The target state is already in effect; nothing to do.
    Skipped,
}

// ---------------------------------------------------------------------------
// Caps Lock mode
// ---------------------------------------------------------------------------

fn apply_caps_lock(
    keymap: &Keymap,
    st: &mut State,
    fx: &Effector<'_>,
    target: bool,
) -> Result<()> {
    let code = keymap
        .real_key_code(KeyName::CapsLockKey)
        .context("caps lock key code missing from the keymap")?;
    fx.change_caps_lock(code)?;
    st.leds.caps_lock = target;
    fx.notify_caps_lock(target);
    Ok(())
}

/// Request Caps Lock on or off, skipping if it already is.
pub fn turn_caps_lock(
    keymap: &Keymap,
    st: &mut State,
    fx: &Effector<'_>,
    target: bool,
) -> Result<ModeChange> {
    if st.leds.caps_lock == target {
        st.combo.caps_lock_mode_change = None;
        return Ok(ModeChange::Skipped);
    }
    if st.is_idle() {
        fx.noise(format_args!(
            "turning caps lock {} now",
            if target { "on" } else { "off" }
        ));
        apply_caps_lock(keymap, st, fx, target)?;
        st.combo.caps_lock_mode_change = None;
        Ok(ModeChange::Applied)
    } else {
        fx.noise("deferring caps lock change until the keyboard is idle");
        st.combo.caps_lock_mode_change = Some(target);
        Ok(ModeChange::Pending)
    }
}

/// Unconditional Caps Lock toggle (the both-Controls chord).
pub fn toggle_caps_lock(keymap: &Keymap, st: &mut State, fx: &Effector<'_>) -> Result<ModeChange> {
    let target = !st.leds.caps_lock;
    if st.is_idle() {
        fx.noise(format_args!(
            "toggling caps lock {} now",
            if target { "on" } else { "off" }
        ));
        apply_caps_lock(keymap, st, fx, target)?;
        st.combo.caps_lock_mode_change = None;
        Ok(ModeChange::Applied)
    } else {
        fx.noise("deferring caps lock toggle until the keyboard is idle");
        st.combo.caps_lock_mode_change = Some(target);
        Ok(ModeChange::Pending)
    }
}

/// Post-step: apply a parked Caps Lock change once possible.
pub fn handle_caps_lock_mode_change(
    keymap: &Keymap,
    st: &mut State,
    fx: &Effector<'_>,
) -> Result<()> {
    let Some(target) = st.combo.caps_lock_mode_change else {
        return Ok(());
    };
    if st.leds.caps_lock == target {
        st.combo.caps_lock_mode_change = None;
    } else if st.is_idle() {
        fx.noise("applying deferred caps lock change");
        apply_caps_lock(keymap, st, fx, target)?;
        st.combo.caps_lock_mode_change = None;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Alternative mode
// ---------------------------------------------------------------------------

fn apply_alternative(st: &mut State, fx: &Effector<'_>, target: bool) {
    st.alternative = target;
    fx.notify_alternative(target);
}

/// Request Alternative mode on or off, skipping if it already is.
pub fn turn_alternative(st: &mut State, fx: &Effector<'_>, target: bool) -> Result<ModeChange> {
    if st.alternative == target {
        st.combo.alternative_mode_change = None;
        return Ok(ModeChange::Skipped);
    }
    if st.is_idle() {
        fx.noise(format_args!(
            "turning alternative mode {} now",
            if target { "on" } else { "off" }
        ));
        apply_alternative(st, fx, target);
        st.combo.alternative_mode_change = None;
        Ok(ModeChange::Applied)
    } else {
        fx.noise("deferring alternative mode change until the keyboard is idle");
        st.combo.alternative_mode_change = Some(target);
        Ok(ModeChange::Pending)
    }
}

/// Unconditional Alternative toggle (the both-Alts chord).
pub fn toggle_alternative(st: &mut State, fx: &Effector<'_>) -> Result<ModeChange> {
    let target = !st.alternative;
    if st.is_idle() {
        fx.noise(format_args!(
            "toggling alternative mode {} now",
            if target { "on" } else { "off" }
        ));
        apply_alternative(st, fx, target);
        st.combo.alternative_mode_change = None;
        Ok(ModeChange::Applied)
    } else {
        fx.noise("deferring alternative mode toggle until the keyboard is idle");
        st.combo.alternative_mode_change = Some(target);
        Ok(ModeChange::Pending)
    }
}

/// Post-step: apply a parked Alternative change once possible.
pub fn handle_alternative_mode_change(st: &mut State, fx: &Effector<'_>) -> Result<()> {
    let Some(target) = st.combo.alternative_mode_change else {
        return Ok(());
    };
    if st.alternative == target {
        st.combo.alternative_mode_change = None;
    } else if st.is_idle() {
        fx.noise("applying deferred alternative mode change");
        apply_alternative(st, fx, target);
        st.combo.alternative_mode_change = None;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Keyboard layout reset
// ---------------------------------------------------------------------------

fn apply_layout_reset(fx: &Effector<'_>) -> Result<()> {
    if fx.current_layout()? != 0 {
        fx.noise("resetting keyboard layout to group 0");
        fx.lock_layout_group(0)?;
    }
    Ok(())
}

/// Request a reset of the keyboard layout to the first group.
pub fn request_layout_reset(st: &mut State, fx: &Effector<'_>) -> Result<ModeChange> {
    if st.is_idle() {
        apply_layout_reset(fx)?;
        st.combo.reset_kbd_layout = false;
        Ok(ModeChange::Applied)
    } else {
        fx.noise("deferring layout reset until the keyboard is idle");
        st.combo.reset_kbd_layout = true;
        Ok(ModeChange::Pending)
    }
}

/// Post-step: apply a parked layout reset once possible.
pub fn handle_reset_kbd_layout(st: &mut State, fx: &Effector<'_>) -> Result<()> {
    if st.combo.reset_kbd_layout && st.is_idle() {
        apply_layout_reset(fx)?;
        st.combo.reset_kbd_layout = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Notify;
    use crate::state::Leds;
    use crate::xserver::XBackend;
    use keywarp_keymap::KeyCode;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeX {
        events: Mutex<Vec<(KeyCode, bool)>>,
        layout: Mutex<u8>,
        group_locks: Mutex<Vec<u8>>,
    }

    impl XBackend for FakeX {
        fn fake_key_event(&self, code: KeyCode, is_press: bool) -> anyhow::Result<()> {
            self.events.lock().push((code, is_press));
            Ok(())
        }
        fn leds(&self) -> anyhow::Result<Leds> {
            Ok(Leds::default())
        }
        fn current_layout(&self) -> anyhow::Result<u8> {
            Ok(*self.layout.lock())
        }
        fn lock_layout_group(&self, group: u8) -> anyhow::Result<()> {
            self.group_locks.lock().push(group);
            *self.layout.lock() = group;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeNotify {
        lines: Mutex<Vec<String>>,
    }

    impl Notify for FakeNotify {
        fn alternative(&self, on: bool) {
            self.lines.lock().push(format!("alternative:{}", on));
        }
        fn caps_lock(&self, on: bool) {
            self.lines.lock().push(format!("capslock:{}", on));
        }
        fn num_lock(&self, on: bool) {
            self.lines.lock().push(format!("numlock:{}", on));
        }
    }

    #[test]
    fn idle_caps_lock_request_applies_immediately() {
        let keymap = Keymap::new();
        let x = FakeX::default();
        let notify = FakeNotify::default();
        let fx = Effector::new(&x, &notify);
        let mut st = State::default();

        let result = turn_caps_lock(&keymap, &mut st, &fx, true).unwrap();
        assert_eq!(result, ModeChange::Applied);
        assert!(st.leds.caps_lock);
        assert!(st.combo.caps_lock_mode_change.is_none());
        // Tapped the hardware caps code once.
        assert_eq!(*x.events.lock(), vec![(66, true), (66, false)]);
        assert_eq!(*notify.lines.lock(), vec!["capslock:true".to_string()]);
    }

    #[test]
    fn caps_lock_request_is_idempotent() {
        let keymap = Keymap::new();
        let x = FakeX::default();
        let notify = FakeNotify::default();
        let fx = Effector::new(&x, &notify);
        let mut st = State::default();
        st.combo.caps_lock_mode_change = Some(false);

        let result = turn_caps_lock(&keymap, &mut st, &fx, false).unwrap();
        assert_eq!(result, ModeChange::Skipped);
        assert!(st.combo.caps_lock_mode_change.is_none(), "slot must be cleared");
        assert!(x.events.lock().is_empty(), "no X traffic for a no-op");
    }

    #[test]
    fn held_keys_defer_the_change_until_release() {
        let keymap = Keymap::new();
        let x = FakeX::default();
        let notify = FakeNotify::default();
        let fx = Effector::new(&x, &notify);
        let mut st = State::default();
        st.pressed.insert(KeyName::AKey);

        let result = turn_caps_lock(&keymap, &mut st, &fx, true).unwrap();
        assert_eq!(result, ModeChange::Pending);
        assert_eq!(st.combo.caps_lock_mode_change, Some(true));
        assert!(!st.leds.caps_lock);
        assert!(x.events.lock().is_empty());

        // Still held: the post-step must not fire.
        handle_caps_lock_mode_change(&keymap, &mut st, &fx).unwrap();
        assert_eq!(st.combo.caps_lock_mode_change, Some(true));

        // Released: the post-step applies and clears the slot.
        st.pressed.clear();
        handle_caps_lock_mode_change(&keymap, &mut st, &fx).unwrap();
        assert!(st.leds.caps_lock);
        assert!(st.combo.caps_lock_mode_change.is_none());
        assert_eq!(*x.events.lock(), vec![(66, true), (66, false)]);
    }

    #[test]
    fn alternative_toggle_flips_and_notifies() {
        let x = FakeX::default();
        let notify = FakeNotify::default();
        let fx = Effector::new(&x, &notify);
        let mut st = State::default();

        toggle_alternative(&mut st, &fx).unwrap();
        assert!(st.alternative);
        toggle_alternative(&mut st, &fx).unwrap();
        assert!(!st.alternative);
        assert_eq!(
            *notify.lines.lock(),
            vec!["alternative:true".to_string(), "alternative:false".to_string()]
        );
        assert!(x.events.lock().is_empty(), "alternative mode is a pure flag");
    }

    #[test]
    fn stale_pending_alternative_change_is_dropped() {
        let x = FakeX::default();
        let notify = FakeNotify::default();
        let fx = Effector::new(&x, &notify);
        let mut st = State::default();
        st.alternative = true;
        st.combo.alternative_mode_change = Some(true);

        handle_alternative_mode_change(&mut st, &fx).unwrap();
        assert!(st.combo.alternative_mode_change.is_none());
        assert!(notify.lines.lock().is_empty(), "already in effect, no re-notify");
    }

    #[test]
    fn layout_reset_only_locks_when_off_group_zero() {
        let x = FakeX::default();
        let notify = FakeNotify::default();
        let fx = Effector::new(&x, &notify);
        let mut st = State::default();

        // Already on group 0: nothing happens.
        request_layout_reset(&mut st, &fx).unwrap();
        assert!(x.group_locks.lock().is_empty());

        // On group 2: locked back to 0.
        *x.layout.lock() = 2;
        request_layout_reset(&mut st, &fx).unwrap();
        assert_eq!(*x.group_locks.lock(), vec![0]);
    }

    #[test]
    fn layout_reset_defers_while_keys_are_held() {
        let x = FakeX::default();
        let notify = FakeNotify::default();
        let fx = Effector::new(&x, &notify);
        let mut st = State::default();
        st.pressed.insert(KeyName::AKey);
        *x.layout.lock() = 1;

        let result = request_layout_reset(&mut st, &fx).unwrap();
        assert_eq!(result, ModeChange::Pending);
        assert!(st.combo.reset_kbd_layout);
        assert!(x.group_locks.lock().is_empty());

        st.pressed.clear();
        handle_reset_kbd_layout(&mut st, &fx).unwrap();
        assert!(!st.combo.reset_kbd_layout);
        assert_eq!(*x.group_locks.lock(), vec![0]);
    }
}
