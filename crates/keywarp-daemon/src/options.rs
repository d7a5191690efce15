//! Command line interface and the runtime feature flags derived from it.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "keywarpd")]
#[command(about = "Keyboard remapping daemon for X11")]
#[command(version)]
pub struct Cli {
    /// Chatty logging (debug level)
    #[arg(short, long)]
    pub verbose: bool,

    /// Keep Caps Lock as a real Caps Lock key (also disables the
    /// reset-by-Escape behavior)
    #[arg(long = "real-capslock")]
    pub real_capslock: bool,

    /// Turn off the alternative layer and the both-Alts toggle
    #[arg(long = "no-alternative-mode")]
    pub no_alternative_mode: bool,

    /// Turn off Caps Lock and Enter acting as Control keys in chords
    #[arg(long = "no-additional-controls")]
    pub no_additional_controls: bool,

    /// Do not reset modes and layout when Caps Lock is tapped as Escape
    #[arg(long = "disable-reset-by-escape-on-capslock")]
    pub disable_reset_by_escape_on_capslock: bool,

    /// Do not reset modes and layout when the focused window changes
    #[arg(long = "disable-reset-by-window-focus-event")]
    pub disable_reset_by_window_focus_event: bool,

    /// Disable this xinput device by name at startup (repeatable)
    #[arg(long = "disable-xinput-device-name", value_name = "NAME")]
    pub disable_xinput_device_name: Vec<String>,

    /// Disable this xinput device by id at startup (repeatable)
    #[arg(long = "disable-xinput-device-id", value_name = "ID")]
    pub disable_xinput_device_id: Vec<u8>,

    /// Additional evdev device node to read events from (repeatable)
    #[arg(long = "device-fd-path", value_name = "FDPATH")]
    pub device_fd_path: Vec<PathBuf>,

    /// FIFO to write xmobar indicator lines to
    #[arg(long = "xmobar-pipe", value_name = "FILE")]
    pub xmobar_pipe: Option<PathBuf>,

    /// evdev device nodes to read events from; auto-detected when empty
    #[arg(value_name = "DEVICE")]
    pub devices: Vec<PathBuf>,
}

impl Cli {
    /// Positional paths plus the `--device-fd-path` ones, in that order.
    pub fn device_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.devices.clone();
        paths.extend(self.device_fd_path.iter().cloned());
        paths
    }
}

/// The feature switches the interpreter consults on every event.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub real_caps_lock: bool,
    pub alternative_mode: bool,
    pub additional_controls: bool,
    pub reset_by_escape_on_caps_lock: bool,
    pub reset_by_window_focus: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            real_caps_lock: false,
            alternative_mode: true,
            additional_controls: true,
            reset_by_escape_on_caps_lock: true,
            reset_by_window_focus: true,
        }
    }
}

impl From<&Cli> for Options {
    fn from(cli: &Cli) -> Self {
        Self {
            real_caps_lock: cli.real_capslock,
            alternative_mode: !cli.no_alternative_mode,
            additional_controls: !cli.no_additional_controls,
            // A real Caps Lock key has no Escape tap to hang a reset off.
            reset_by_escape_on_caps_lock: !cli.disable_reset_by_escape_on_capslock
                && !cli.real_capslock,
            reset_by_window_focus: !cli.disable_reset_by_window_focus_event,
        }
    }
}
