//! Key lookup tables for the keywarp daemon.
//!
//! Everything in here is pure and read-only after construction: the daemon
//! builds one [`Keymap`] at startup, validates it, and shares it across the
//! event threads. The table answers five questions:
//!
//! - which [`KeyName`] does a raw evdev code decode to ([`Keymap::alias_of`])
//! - which X key code does a name synthesize as ([`Keymap::key_code`],
//!   [`Keymap::real_key_code`])
//! - what does a name become under the alternative layer
//!   ([`Keymap::alternative`])
//! - is a name a media key, and with which code ([`Keymap::is_media`],
//!   [`Keymap::media_code`])
//! - which names count as aliases of a modifier ([`Keymap::extra_keys`],
//!   [`Keymap::all_modifier_keys`])
//!
//! X key codes are the evdev code plus 8, the standard X.Org evdev offset.
//! `FNKey` is the one exception: its evdev code (464) is outside the X key
//! code range, so it has no X code and is never synthesized directly.

use std::collections::{HashMap, HashSet};

use evdev::Key;
use thiserror::Error;

/// An X key code as accepted by XTest (`detail` byte of a key event).
pub type KeyCode = u8;

/// Offset between kernel evdev codes and X.Org key codes.
const X_KEYCODE_OFFSET: u16 = 8;

/// Symbolic identifier for every key the daemon recognizes.
///
/// The discriminant order is meaningful: when the interpreter has to release
/// a whole set of held keys it does so in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyName {
    EscapeKey,
    F1Key,
    F2Key,
    F3Key,
    F4Key,
    F5Key,
    F6Key,
    F7Key,
    F8Key,
    F9Key,
    F10Key,
    F11Key,
    F12Key,

    GraveKey,
    N1Key,
    N2Key,
    N3Key,
    N4Key,
    N5Key,
    N6Key,
    N7Key,
    N8Key,
    N9Key,
    N0Key,
    MinusKey,
    EqualKey,
    BackspaceKey,

    TabKey,
    QKey,
    WKey,
    EKey,
    RKey,
    TKey,
    YKey,
    UKey,
    IKey,
    OKey,
    PKey,
    LeftBracketKey,
    RightBracketKey,
    BackslashKey,

    CapsLockKey,
    AKey,
    SKey,
    DKey,
    FKey,
    GKey,
    HKey,
    JKey,
    KKey,
    LKey,
    SemicolonKey,
    ApostropheKey,
    EnterKey,

    ShiftLeftKey,
    ZKey,
    XKey,
    CKey,
    VKey,
    BKey,
    NKey,
    MKey,
    CommaKey,
    DotKey,
    SlashKey,
    ShiftRightKey,

    ControlLeftKey,
    SuperLeftKey,
    AltLeftKey,
    SpaceKey,
    AltRightKey,
    SuperRightKey,
    MenuKey,
    ControlRightKey,

    InsertKey,
    DeleteKey,
    HomeKey,
    EndKey,
    PageUpKey,
    PageDownKey,
    UpKey,
    DownKey,
    LeftKey,
    RightKey,

    NumLockKey,
    KP0Key,
    KP1Key,
    KP2Key,
    KP3Key,
    KP4Key,
    KP5Key,
    KP6Key,
    KP7Key,
    KP8Key,
    KP9Key,
    KPDotKey,
    KPEnterKey,
    KPPlusKey,
    KPMinusKey,
    KPAsteriskKey,
    KPSlashKey,

    AudioPrevKey,
    AudioPlayKey,
    AudioNextKey,
    AudioMuteKey,
    AudioLowerVolumeKey,
    AudioRaiseVolumeKey,
    MonBrightnessDownKey,
    MonBrightnessUpKey,
    EjectKey,

    /// Apple keyboards report this as `KEY_FN`. It has no X key code; the
    /// interpreter taps it as Insert or consumes it as the media overlay
    /// modifier.
    FNKey,

    /// Output-only name for the hardware Caps Lock key code. It has no evdev
    /// alias; toggling the Caps Lock LED synthesizes this code.
    RealCapsLockKey,
}

/// The eight physical modifier keys.
pub const MODIFIER_KEYS: [KeyName; 8] = [
    KeyName::ControlLeftKey,
    KeyName::ControlRightKey,
    KeyName::ShiftLeftKey,
    KeyName::ShiftRightKey,
    KeyName::AltLeftKey,
    KeyName::AltRightKey,
    KeyName::SuperLeftKey,
    KeyName::SuperRightKey,
];

/// A decoded evdev key: the symbolic name, the raw kernel code it came from,
/// and the X key code it synthesizes as.
///
/// `code` is 0 for `FNKey`, which carries no X key code and is never
/// forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAlias {
    pub name: KeyName,
    pub evdev_code: u16,
    pub code: KeyCode,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeymapError {
    #[error("key {0:?} has no X key code in the table")]
    MissingKeyCode(KeyName),
    #[error("{0:?} remaps to {1:?}, which has no X key code")]
    DanglingTarget(KeyName, KeyName),
}

/// Immutable key table. Build once with [`Keymap::new`], check with
/// [`Keymap::validate`], then share freely.
#[derive(Debug, Clone)]
pub struct Keymap {
    by_evdev: HashMap<u16, KeyName>,
    codes: HashMap<KeyName, KeyCode>,
    alternatives: HashMap<KeyName, KeyName>,
    as_names: HashMap<KeyName, KeyName>,
    media: HashSet<KeyName>,
    extras: HashMap<KeyName, HashSet<KeyName>>,
    all_modifiers: HashSet<KeyName>,
}

impl Default for Keymap {
    fn default() -> Self {
        Self::new()
    }
}

impl Keymap {
    pub fn new() -> Self {
        use KeyName::*;

        let entries: &[(KeyName, Key)] = &[
            (EscapeKey, Key::KEY_ESC),
            (F1Key, Key::KEY_F1),
            (F2Key, Key::KEY_F2),
            (F3Key, Key::KEY_F3),
            (F4Key, Key::KEY_F4),
            (F5Key, Key::KEY_F5),
            (F6Key, Key::KEY_F6),
            (F7Key, Key::KEY_F7),
            (F8Key, Key::KEY_F8),
            (F9Key, Key::KEY_F9),
            (F10Key, Key::KEY_F10),
            (F11Key, Key::KEY_F11),
            (F12Key, Key::KEY_F12),
            (GraveKey, Key::KEY_GRAVE),
            (N1Key, Key::KEY_1),
            (N2Key, Key::KEY_2),
            (N3Key, Key::KEY_3),
            (N4Key, Key::KEY_4),
            (N5Key, Key::KEY_5),
            (N6Key, Key::KEY_6),
            (N7Key, Key::KEY_7),
            (N8Key, Key::KEY_8),
            (N9Key, Key::KEY_9),
            (N0Key, Key::KEY_0),
            (MinusKey, Key::KEY_MINUS),
            (EqualKey, Key::KEY_EQUAL),
            (BackspaceKey, Key::KEY_BACKSPACE),
            (TabKey, Key::KEY_TAB),
            (QKey, Key::KEY_Q),
            (WKey, Key::KEY_W),
            (EKey, Key::KEY_E),
            (RKey, Key::KEY_R),
            (TKey, Key::KEY_T),
            (YKey, Key::KEY_Y),
            (UKey, Key::KEY_U),
            (IKey, Key::KEY_I),
            (OKey, Key::KEY_O),
            (PKey, Key::KEY_P),
            (LeftBracketKey, Key::KEY_LEFTBRACE),
            (RightBracketKey, Key::KEY_RIGHTBRACE),
            (BackslashKey, Key::KEY_BACKSLASH),
            (CapsLockKey, Key::KEY_CAPSLOCK),
            (AKey, Key::KEY_A),
            (SKey, Key::KEY_S),
            (DKey, Key::KEY_D),
            (FKey, Key::KEY_F),
            (GKey, Key::KEY_G),
            (HKey, Key::KEY_H),
            (JKey, Key::KEY_J),
            (KKey, Key::KEY_K),
            (LKey, Key::KEY_L),
            (SemicolonKey, Key::KEY_SEMICOLON),
            (ApostropheKey, Key::KEY_APOSTROPHE),
            (EnterKey, Key::KEY_ENTER),
            (ShiftLeftKey, Key::KEY_LEFTSHIFT),
            (ZKey, Key::KEY_Z),
            (XKey, Key::KEY_X),
            (CKey, Key::KEY_C),
            (VKey, Key::KEY_V),
            (BKey, Key::KEY_B),
            (NKey, Key::KEY_N),
            (MKey, Key::KEY_M),
            (CommaKey, Key::KEY_COMMA),
            (DotKey, Key::KEY_DOT),
            (SlashKey, Key::KEY_SLASH),
            (ShiftRightKey, Key::KEY_RIGHTSHIFT),
            (ControlLeftKey, Key::KEY_LEFTCTRL),
            (SuperLeftKey, Key::KEY_LEFTMETA),
            (AltLeftKey, Key::KEY_LEFTALT),
            (SpaceKey, Key::KEY_SPACE),
            (AltRightKey, Key::KEY_RIGHTALT),
            (SuperRightKey, Key::KEY_RIGHTMETA),
            (MenuKey, Key::KEY_COMPOSE),
            (ControlRightKey, Key::KEY_RIGHTCTRL),
            (InsertKey, Key::KEY_INSERT),
            (DeleteKey, Key::KEY_DELETE),
            (HomeKey, Key::KEY_HOME),
            (EndKey, Key::KEY_END),
            (PageUpKey, Key::KEY_PAGEUP),
            (PageDownKey, Key::KEY_PAGEDOWN),
            (UpKey, Key::KEY_UP),
            (DownKey, Key::KEY_DOWN),
            (LeftKey, Key::KEY_LEFT),
            (RightKey, Key::KEY_RIGHT),
            (NumLockKey, Key::KEY_NUMLOCK),
            (KP0Key, Key::KEY_KP0),
            (KP1Key, Key::KEY_KP1),
            (KP2Key, Key::KEY_KP2),
            (KP3Key, Key::KEY_KP3),
            (KP4Key, Key::KEY_KP4),
            (KP5Key, Key::KEY_KP5),
            (KP6Key, Key::KEY_KP6),
            (KP7Key, Key::KEY_KP7),
            (KP8Key, Key::KEY_KP8),
            (KP9Key, Key::KEY_KP9),
            (KPDotKey, Key::KEY_KPDOT),
            (KPEnterKey, Key::KEY_KPENTER),
            (KPPlusKey, Key::KEY_KPPLUS),
            (KPMinusKey, Key::KEY_KPMINUS),
            (KPAsteriskKey, Key::KEY_KPASTERISK),
            (KPSlashKey, Key::KEY_KPSLASH),
            (AudioPrevKey, Key::KEY_PREVIOUSSONG),
            (AudioPlayKey, Key::KEY_PLAYPAUSE),
            (AudioNextKey, Key::KEY_NEXTSONG),
            (AudioMuteKey, Key::KEY_MUTE),
            (AudioLowerVolumeKey, Key::KEY_VOLUMEDOWN),
            (AudioRaiseVolumeKey, Key::KEY_VOLUMEUP),
            (MonBrightnessDownKey, Key::KEY_BRIGHTNESSDOWN),
            (MonBrightnessUpKey, Key::KEY_BRIGHTNESSUP),
            (EjectKey, Key::KEY_EJECTCD),
        ];

        let mut by_evdev = HashMap::new();
        let mut codes = HashMap::new();
        for &(name, key) in entries {
            by_evdev.insert(key.code(), name);
            codes.insert(name, (key.code() + X_KEYCODE_OFFSET) as KeyCode);
        }

        // KEY_FN decodes but never synthesizes: its evdev code is outside
        // the X key code range.
        by_evdev.insert(Key::KEY_FN.code(), FNKey);

        // The hardware Caps Lock code, used only for toggling the lock state.
        codes.insert(
            RealCapsLockKey,
            (Key::KEY_CAPSLOCK.code() + X_KEYCODE_OFFSET) as KeyCode,
        );

        let alternatives: HashMap<KeyName, KeyName> = [
            (HKey, LeftKey),
            (JKey, DownKey),
            (KKey, UpKey),
            (LKey, RightKey),
            (YKey, HomeKey),
            (UKey, PageDownKey),
            (IKey, PageUpKey),
            (OKey, EndKey),
            (N1Key, F1Key),
            (N2Key, F2Key),
            (N3Key, F3Key),
            (N4Key, F4Key),
            (N5Key, F5Key),
            (N6Key, F6Key),
            (N7Key, F7Key),
            (N8Key, F8Key),
            (N9Key, F9Key),
            (N0Key, F10Key),
            (MinusKey, F11Key),
            (EqualKey, F12Key),
            (BackspaceKey, DeleteKey),
        ]
        .into_iter()
        .collect();

        let as_names: HashMap<KeyName, KeyName> =
            [(CapsLockKey, EscapeKey), (FNKey, InsertKey)].into_iter().collect();

        let media: HashSet<KeyName> = [
            AudioPrevKey,
            AudioPlayKey,
            AudioNextKey,
            AudioMuteKey,
            AudioLowerVolumeKey,
            AudioRaiseVolumeKey,
            MonBrightnessDownKey,
            MonBrightnessUpKey,
            EjectKey,
        ]
        .into_iter()
        .collect();

        // Keyboards where Menu is bound as a Super key at the X level.
        let mut extras: HashMap<KeyName, HashSet<KeyName>> = HashMap::new();
        extras.insert(SuperRightKey, [MenuKey].into_iter().collect());

        let mut all_modifiers: HashSet<KeyName> = MODIFIER_KEYS.into_iter().collect();
        for m in MODIFIER_KEYS {
            if let Some(extra) = extras.get(&m) {
                all_modifiers.extend(extra.iter().copied());
            }
        }

        Self {
            by_evdev,
            codes,
            alternatives,
            as_names,
            media,
            extras,
            all_modifiers,
        }
    }

    /// Decode a raw evdev code.
    pub fn alias_of(&self, evdev_code: u16) -> Option<KeyAlias> {
        let name = *self.by_evdev.get(&evdev_code)?;
        Some(KeyAlias {
            name,
            evdev_code,
            code: self.key_code(name).unwrap_or(0),
        })
    }

    /// The X key code a name synthesizes as. `None` only for [`KeyName::FNKey`].
    pub fn key_code(&self, name: KeyName) -> Option<KeyCode> {
        self.codes.get(&name).copied()
    }

    /// The hardware key code behind a name, before any remap of its tapped
    /// behavior. Differs from [`Keymap::key_code`] only for Caps Lock.
    pub fn real_key_code(&self, name: KeyName) -> Option<KeyCode> {
        match name {
            KeyName::CapsLockKey => self.key_code(KeyName::RealCapsLockKey),
            other => self.key_code(other),
        }
    }

    /// The alternative-layer mapping of a name, with the target's key code.
    pub fn alternative(&self, name: KeyName) -> Option<(KeyName, KeyCode)> {
        let target = *self.alternatives.get(&name)?;
        Some((target, self.key_code(target)?))
    }

    pub fn is_media(&self, name: KeyName) -> bool {
        self.media.contains(&name)
    }

    /// The X code a media key emits. Identical to [`Keymap::key_code`] for
    /// media names, `None` for everything else.
    pub fn media_code(&self, name: KeyName) -> Option<KeyCode> {
        if self.is_media(name) {
            self.key_code(name)
        } else {
            None
        }
    }

    /// The name a key acts as when tapped (Caps Lock -> Escape, FN -> Insert).
    /// Identity for unremapped keys.
    pub fn as_name(&self, name: KeyName) -> KeyName {
        self.as_names.get(&name).copied().unwrap_or(name)
    }

    /// Names bound to `name` by an upstream layer, which therefore count as
    /// `name` when computing the modifier set.
    pub fn extra_keys(&self, name: KeyName) -> HashSet<KeyName> {
        self.extras.get(&name).cloned().unwrap_or_default()
    }

    /// The eight modifiers plus all of their extra keys.
    pub fn all_modifier_keys(&self) -> &HashSet<KeyName> {
        &self.all_modifiers
    }

    /// Startup sanity check: every decodable name except FN must resolve to
    /// an X key code, and every remap target must too. A failure here is a
    /// table bug and fatal.
    pub fn validate(&self) -> Result<(), KeymapError> {
        for &name in self.by_evdev.values() {
            if name != KeyName::FNKey && self.key_code(name).is_none() {
                return Err(KeymapError::MissingKeyCode(name));
            }
        }
        for (&from, &to) in &self.alternatives {
            if self.key_code(to).is_none() {
                return Err(KeymapError::DanglingTarget(from, to));
            }
        }
        for (&from, &to) in &self.as_names {
            if self.key_code(to).is_none() {
                return Err(KeymapError::DanglingTarget(from, to));
            }
        }
        Ok(())
    }
}
