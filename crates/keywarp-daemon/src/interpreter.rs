//! The per-event decision tree.
//!
//! Every decoded key event runs through [`Interpreter::handle_key_event`]
//! under the single state lock: duplicate suppression, pressed-set update,
//! the classifier, then the deferred-mode post-steps. The classifier picks
//! the first matching rule; a few rules rewrite state and replay the same
//! event, which is what the bounded loop below implements.
//!
//! The three small state machines living in `ComboState`:
//!
//! ```text
//! enter-with-modifiers        additional control (Caps/Enter)
//!
//!  ┌──────┐ Enter down,         ┌──────┐ control down
//!  │ Idle │ only mods held      │ Idle │ (snapshot held keys)
//!  └──┬───┘───────────┐         └──┬───┘──────────────┐
//!     ▲               ▼            ▲                   ▼
//!     │ Enter up   ┌───────┐       │ control up   ┌──────────┐
//!     │ (mods+     │ Armed │       │ (tap: Esc/   │ Snapshot │
//!     │  Enter)    └──┬────┘       │  Enter)      └───┬──────┘
//!     │               │ other      │                  │ fresh key down
//!     └───────────────┘ key:       │ control up   ┌───────────┐
//!       mod up: flush   downgrade  │ (Ctrl up)    │ Upgraded  │
//!       combo, replay   & replay   └──────────────│ (to Ctrl) │
//!                                                 └───────────┘
//!
//! media overlay: Idle ── FN held + media key ──> Active ── FN up ──> Idle
//! ```

use anyhow::Result;
use keywarp_keymap::{KeyAlias, KeyCode, KeyName, Keymap};

use crate::effector::Effector;
use crate::modes;
use crate::options::Options;
use crate::state::State;

/// Upper bound on classifier replays for one event. Two suffice in practice;
/// exceeding this means a rule loops on itself and is worth a warning.
const MAX_REPLAYS: usize = 4;

pub struct Interpreter {
    keymap: Keymap,
    opts: Options,
}

impl Interpreter {
    pub fn new(keymap: Keymap, opts: Options) -> Self {
        Self { keymap, opts }
    }

    pub fn keymap(&self) -> &Keymap {
        &self.keymap
    }

    /// Entry point for one decoded key event. Must be called with the state
    /// lock held; everything in here, including the X traffic, happens under
    /// that lock so the emitted sequence is deterministic.
    pub fn handle_key_event(
        &self,
        st: &mut State,
        fx: &Effector<'_>,
        alias: KeyAlias,
        is_pressed: bool,
    ) -> Result<()> {
        let name = alias.name;

        let was_pressed = st.pressed.contains(&name);
        if was_pressed == is_pressed {
            tracing::trace!(
                "dropping duplicate {:?} ({})",
                name,
                if is_pressed { "press" } else { "release" }
            );
            return Ok(());
        }
        if is_pressed {
            st.pressed.insert(name);
        } else {
            st.pressed.remove(&name);
        }

        self.classify(st, fx, name, alias.code, is_pressed)?;

        modes::handle_reset_kbd_layout(st, fx)?;
        modes::handle_caps_lock_mode_change(&self.keymap, st, fx)?;
        modes::handle_alternative_mode_change(st, fx)?;
        Ok(())
    }

    /// The alternative-layer-aware output code for a key.
    fn smart_code(&self, st: &State, name: KeyName, code: KeyCode) -> KeyCode {
        if self.opts.alternative_mode && st.alternative {
            if let Some((_, alt_code)) = self.keymap.alternative(name) {
                return alt_code;
            }
        }
        code
    }

    fn classify(
        &self,
        st: &mut State,
        fx: &Effector<'_>,
        name: KeyName,
        code: KeyCode,
        is_pressed: bool,
    ) -> Result<()> {
        use KeyName::*;

        let keymap = &self.keymap;

        for _ in 0..MAX_REPLAYS {
            let other_pressed = st.other_pressed(name);
            let trigger_code = self.smart_code(st, name, code);

            // An Enter-with-modifiers sequence is in progress and something
            // other than Enter happened. Three ways out; two of them clear
            // the slot and replay the event against the updated state.
            if name != EnterKey {
                if let Some(mods) = st.combo.enter_with_mods.clone() {
                    if !is_pressed && mods.contains(&name) {
                        // A combo modifier is going up before Enter did:
                        // deliver mods+Enter now, then replay so the
                        // modifier itself gets released at X.
                        if let Some(enter) = keymap.key_code(EnterKey) {
                            fx.press_release(enter)?;
                        }
                        fx.noise("enter-with-modifiers flushed by early modifier release");
                        st.combo.enter_with_mods = None;
                        st.pressed.remove(&EnterKey);
                        continue;
                    } else if is_pressed && keymap.all_modifier_keys().contains(&name) {
                        // Another modifier joins the pending combo. Its own
                        // press goes straight through; replaying the whole
                        // tree here would hand it to the upgrade rule below.
                        let mut mods = mods;
                        mods.insert(name);
                        st.combo.enter_with_mods = Some(mods);
                        fx.trigger(trigger_code, is_pressed)?;
                        return Ok(());
                    } else {
                        // Any other key: Enter stops pending and falls back
                        // to its additional-control role. Seed the
                        // bookkeeping its press would have left behind under
                        // that rule, so the snapshot logic below treats the
                        // armed modifiers as held-before-Enter.
                        fx.noise("enter-with-modifiers downgraded to additional control");
                        st.combo.enter_with_mods = None;
                        st.combo.pressed_before_enter = mods;
                        continue;
                    }
                }
            }

            // Both Alts pressed and nothing else: toggle Alternative mode.
            // Their earlier presses went through to X, so undo them.
            if self.opts.alternative_mode
                && (name == AltLeftKey || name == AltRightKey)
                && st.pressed.len() == 2
                && st.pressed.contains(&AltLeftKey)
                && st.pressed.contains(&AltRightKey)
            {
                for alt in [AltLeftKey, AltRightKey] {
                    if let Some(c) = keymap.key_code(alt) {
                        fx.release(c)?;
                    }
                }
                st.pressed.remove(&AltLeftKey);
                st.pressed.remove(&AltRightKey);
                fx.noise("both-alts chord: toggling alternative mode");
                modes::toggle_alternative(st, fx)?;
                return Ok(());
            }

            // FN: transparent modifier over media keys, Insert when tapped.
            if name == FNKey {
                if is_pressed {
                    fx.noise("FN held");
                    return Ok(());
                }
                if st.combo.apple_media_pressed {
                    self.abstract_release(st, fx, |k| keymap.is_media(k), |k| {
                        keymap.media_code(k)
                    })?;
                    st.combo.apple_media_pressed = false;
                    fx.noise("media overlay finished");
                } else {
                    let acts_as = keymap.as_name(FNKey);
                    if let Some(insert) = keymap.key_code(acts_as) {
                        fx.noise(format_args!("FN tapped: acting as {:?}", acts_as));
                        fx.press_release(insert)?;
                    }
                }
                return Ok(());
            }

            // Media key while FN is held: the overlay swallows FN and lets
            // the media code through.
            if st.pressed.contains(&FNKey) && keymap.is_media(name) {
                fx.trigger(trigger_code, is_pressed)?;
                st.combo.apple_media_pressed = true;
                return Ok(());
            }

            // Both Controls chord (or its Caps+Enter equivalent): toggle the
            // Caps Lock LED. Real Controls were pressed at X and must be
            // released there; Caps/Enter never were, so for them only the
            // bookkeeping is undone.
            let real_controls_chord = st.pressed.len() == 2
                && st.pressed.contains(&ControlLeftKey)
                && st.pressed.contains(&ControlRightKey);
            let caps_enter_chord = self.opts.additional_controls
                && st.pressed.len() == 2
                && st.pressed.contains(&CapsLockKey)
                && st.pressed.contains(&EnterKey);
            if real_controls_chord || caps_enter_chord {
                if real_controls_chord {
                    for ctrl in [ControlLeftKey, ControlRightKey] {
                        if let Some(c) = keymap.key_code(ctrl) {
                            fx.release(c)?;
                        }
                    }
                    st.pressed.remove(&ControlLeftKey);
                    st.pressed.remove(&ControlRightKey);
                } else {
                    st.pressed.remove(&CapsLockKey);
                    st.pressed.remove(&EnterKey);
                    st.combo.pressed_before_caps_lock.clear();
                    st.combo.pressed_before_enter.clear();
                }
                fx.noise("both-controls chord: toggling caps lock");
                modes::toggle_caps_lock(keymap, st, fx)?;
                return Ok(());
            }

            // Enter pressed while only modifiers are held: hold the combo
            // back until Enter is released, so the application sees
            // mods+Enter instead of mods+RightCtrl.
            if self.opts.additional_controls && name == EnterKey {
                if is_pressed
                    && !other_pressed.is_empty()
                    && other_pressed.is_subset(keymap.all_modifier_keys())
                {
                    fx.noise("enter pressed with modifiers only: arming");
                    st.combo.enter_with_mods = Some(other_pressed);
                    return Ok(());
                }
                if !is_pressed && st.combo.enter_with_mods.is_some() {
                    st.combo.enter_with_mods = None;
                    if let Some(enter) = keymap.key_code(EnterKey) {
                        fx.press_release(enter)?;
                    }
                    fx.noise("enter-with-modifiers combo delivered");
                    return Ok(());
                }
            }

            // Caps Lock / Enter on their own: swallow the press, decide on
            // release whether this was a tap (Escape / Enter) or the tail of
            // a combo (drop the held Control).
            if self.opts.additional_controls
                && (name == CapsLockKey || name == EnterKey)
                && !(name == EnterKey && st.combo.enter_with_mods.is_some())
            {
                if is_pressed {
                    fx.noise(format_args!(
                        "{:?} down with {} key(s) already held",
                        name,
                        other_pressed.len()
                    ));
                    if name == CapsLockKey {
                        st.combo.pressed_before_caps_lock = other_pressed;
                    } else {
                        st.combo.pressed_before_enter = other_pressed;
                    }
                    return Ok(());
                }

                let combo_flag = if name == CapsLockKey {
                    st.combo.caps_lock_combo
                } else {
                    st.combo.enter_combo
                };
                let control = if name == CapsLockKey {
                    ControlLeftKey
                } else {
                    ControlRightKey
                };
                if combo_flag {
                    if let Some(c) = keymap.key_code(control) {
                        fx.release(c)?;
                    }
                    fx.noise(format_args!("{:?} released: dropping held {:?}", name, control));
                    if name == CapsLockKey {
                        st.combo.caps_lock_combo = false;
                        st.combo.pressed_before_caps_lock.clear();
                    } else {
                        st.combo.enter_combo = false;
                        st.combo.pressed_before_enter.clear();
                    }
                    return Ok(());
                }

                // Plain tap.
                if name == CapsLockKey {
                    st.combo.pressed_before_caps_lock.clear();
                    if self.opts.real_caps_lock {
                        fx.press_release(code)?;
                        // The server just flipped the lock; track it.
                        st.leds = fx.leds()?;
                    } else {
                        let acts_as = keymap.as_name(CapsLockKey);
                        if let Some(c) = keymap.key_code(acts_as) {
                            fx.noise(format_args!("caps lock tapped as {:?}", acts_as));
                            fx.press_release(c)?;
                        }
                    }
                    if self.opts.reset_by_escape_on_caps_lock {
                        self.reset_all(st, fx)?;
                    }
                } else {
                    st.combo.pressed_before_enter.clear();
                    if let Some(c) = keymap.key_code(EnterKey) {
                        fx.press_release(c)?;
                    }
                }
                return Ok(());
            }

            // Some other key while Caps Lock or Enter is held: this is what
            // upgrades the held key to its Control.
            if self.opts.additional_controls
                && (st.pressed.contains(&CapsLockKey) || st.pressed.contains(&EnterKey))
            {
                let held = if st.pressed.contains(&CapsLockKey) {
                    CapsLockKey
                } else {
                    EnterKey
                };
                let control = if held == CapsLockKey {
                    ControlLeftKey
                } else {
                    ControlRightKey
                };

                let in_snapshot = if held == CapsLockKey {
                    st.combo.pressed_before_caps_lock.contains(&name)
                } else {
                    st.combo.pressed_before_enter.contains(&name)
                };
                if !is_pressed && in_snapshot {
                    // Held since before the control went down, so not part
                    // of the combo: release it as itself.
                    if held == CapsLockKey {
                        st.combo.pressed_before_caps_lock.remove(&name);
                    } else {
                        st.combo.pressed_before_enter.remove(&name);
                    }
                    fx.trigger(trigger_code, is_pressed)?;
                    return Ok(());
                }

                let combo_flag = if held == CapsLockKey {
                    st.combo.caps_lock_combo
                } else {
                    st.combo.enter_combo
                };
                if !combo_flag {
                    if let Some(c) = keymap.key_code(control) {
                        fx.press(c)?;
                    }
                    fx.noise(format_args!("{:?} upgraded to {:?}", held, control));
                    if held == CapsLockKey {
                        st.combo.caps_lock_combo = true;
                    } else {
                        st.combo.enter_combo = true;
                    }
                }
                fx.trigger(trigger_code, is_pressed)?;
                return Ok(());
            }

            // Caps Lock without additional controls: a plain Escape key.
            if name == CapsLockKey && !self.opts.real_caps_lock {
                let acts_as = keymap.as_name(CapsLockKey);
                if let Some(c) = keymap.key_code(acts_as) {
                    fx.trigger(c, is_pressed)?;
                }
                if !is_pressed && self.opts.reset_by_escape_on_caps_lock {
                    self.reset_all(st, fx)?;
                }
                return Ok(());
            }

            // Default: forward through the alternative layer.
            fx.trigger(trigger_code, is_pressed)?;
            return Ok(());
        }

        tracing::warn!("classifier replay bound exceeded for {:?}", name);
        Ok(())
    }

    /// Release every held key matching `predicate` (deterministic order) and
    /// drop it from the pressed set.
    fn abstract_release(
        &self,
        st: &mut State,
        fx: &Effector<'_>,
        predicate: impl Fn(KeyName) -> bool,
        code_of: impl Fn(KeyName) -> Option<KeyCode>,
    ) -> Result<()> {
        let mut matching: Vec<KeyName> =
            st.pressed.iter().copied().filter(|&k| predicate(k)).collect();
        matching.sort();
        for k in matching {
            if let Some(c) = code_of(k) {
                fx.release(c)?;
            }
            st.pressed.remove(&k);
        }
        Ok(())
    }

    /// Drop everything: release all held keys, clear the combo substates and
    /// request Caps Lock off, Alternative off and a layout reset through the
    /// coordinator.
    pub fn reset_all(&self, st: &mut State, fx: &Effector<'_>) -> Result<()> {
        fx.noise("resetting keyboard state");
        let mut held: Vec<KeyName> = st.pressed.iter().copied().collect();
        held.sort();
        for k in held {
            if let Some(c) = self.keymap.key_code(k) {
                fx.release(c)?;
            }
        }
        st.pressed.clear();
        st.combo.reset_transient();
        modes::turn_caps_lock(&self.keymap, st, fx, false)?;
        modes::turn_alternative(st, fx, false)?;
        modes::request_layout_reset(st, fx)?;
        Ok(())
    }
}
