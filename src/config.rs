//! Backend configuration
//!
//! Loaded once from a JSON document at platform init. Every key is optional;
//! a missing document means all defaults.
//!
//! ```json
//! {
//!   "device": "/dev/dri/card1",
//!   "seat": "seat0",
//!   "hwcursor": true,
//!   "separateScreens": false,
//!   "outputs": [
//!     { "name": "HDMI1", "mode": "1920x1080" },
//!     { "name": "eDP1", "mode": "off" }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use serde::Deserialize;
use tracing::{debug, info};

/// Environment variable naming the configuration document.
pub const CONFIG_ENV: &str = "EGLFS_KMS_CONFIG";

/// Environment variable naming the cursor atlas manifest.
pub const CURSOR_ATLAS_ENV: &str = "EGLFS_KMS_CURSOR";

const DEFAULT_FLIP_TIMEOUT_MS: u64 = 1000;

const DEFAULT_SEAT: &str = "seat0";

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualDesktopLayout {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub hwcursor: bool,
    pub pbuffers: bool,
    pub device: Option<PathBuf>,
    /// udev seat searched for a GPU when no `device` is given.
    pub seat: String,
    pub separate_screens: bool,
    pub virtual_desktop_layout: VirtualDesktopLayout,
    /// Apply the mode even when the CRTC already scans it out.
    pub always_set_mode: bool,
    /// `0` waits for flip completion without a bound.
    pub flip_timeout_ms: u64,
    pub cursor_atlas: Option<PathBuf>,
    pub outputs: Vec<OutputConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hwcursor: true,
            pbuffers: false,
            device: None,
            seat: DEFAULT_SEAT.to_owned(),
            separate_screens: false,
            virtual_desktop_layout: VirtualDesktopLayout::default(),
            always_set_mode: false,
            flip_timeout_ms: DEFAULT_FLIP_TIMEOUT_MS,
            cursor_atlas: None,
            outputs: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("error reading config {path:?}"))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("error parsing config {path:?}"))?;
        info!("Loaded config from {:?}", path);
        debug!("{config:?}");
        Ok(config)
    }

    /// Load from `$EGLFS_KMS_CONFIG`, or defaults when it is unset.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => {
                debug!("{CONFIG_ENV} not set, using default config");
                Ok(Self::default())
            }
        }
    }

    pub fn output(&self, name: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn flip_timeout(&self) -> Option<Duration> {
        (self.flip_timeout_ms != 0).then(|| Duration::from_millis(self.flip_timeout_ms))
    }

    /// Atlas manifest from the config, else from `$EGLFS_KMS_CURSOR`.
    pub fn cursor_atlas_path(&self) -> Option<PathBuf> {
        self.cursor_atlas
            .clone()
            .or_else(|| std::env::var_os(CURSOR_ATLAS_ENV).map(PathBuf::from))
    }
}

/// Per-output overrides, matched by derived connector name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub name: String,
    pub mode: Option<String>,
    pub physical_width: Option<u32>,
    pub physical_height: Option<u32>,
    pub virtual_index: Option<i32>,
    pub virtual_pos: Option<String>,
    pub primary: bool,
}

impl OutputConfig {
    /// `"x, y"` position in the virtual desktop, if given and well formed.
    pub fn virtual_pos(&self) -> Option<(i32, i32)> {
        let pos = self.virtual_pos.as_deref()?;
        let (x, y) = pos.split_once(',')?;
        Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
    }
}

/// What to do with an output, from its `mode` string.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeSetting {
    /// Blank the CRTC and create no screen.
    Off,
    Preferred,
    /// Keep whatever the CRTC currently shows.
    Current,
    /// Leave the connector alone entirely.
    Skip,
    Size {
        width: u16,
        height: u16,
        refresh: Option<u32>,
    },
    Modeline(Modeline),
}

impl FromStr for ModeSetting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "off" => return Ok(Self::Off),
            "preferred" => return Ok(Self::Preferred),
            "current" => return Ok(Self::Current),
            "skip" => return Ok(Self::Skip),
            _ => (),
        }

        if let Some((width, rest)) = s.split_once('x') {
            let (height, refresh) = match rest.split_once('@') {
                Some((height, refresh)) => (height, Some(refresh)),
                None => (rest, None),
            };
            if let (Ok(width), Ok(height)) = (width.parse(), height.parse()) {
                let refresh = refresh
                    .map(|r| r.parse().context("invalid refresh rate"))
                    .transpose()?;
                return Ok(Self::Size {
                    width,
                    height,
                    refresh,
                });
            }
        }

        Ok(Self::Modeline(s.parse()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolarity {
    Positive,
    Negative,
}

/// An X11-style modeline: `clock hdisp hsyncstart hsyncend htotal vdisp
/// vsyncstart vsyncend vtotal ±hsync ±vsync`, clock in MHz.
#[derive(Debug, Clone, PartialEq)]
pub struct Modeline {
    pub clock: f64,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub hsync_polarity: SyncPolarity,
    pub vsync_polarity: SyncPolarity,
}

fn parse_polarity(s: &str, axis: &str) -> anyhow::Result<SyncPolarity> {
    match s.strip_suffix(axis) {
        Some("+") => Ok(SyncPolarity::Positive),
        Some("-") => Ok(SyncPolarity::Negative),
        _ => bail!("expected +{axis} or -{axis}, got {s:?}"),
    }
}

impl FromStr for Modeline {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        ensure!(
            fields.len() == 11,
            "modeline needs 11 fields, got {}",
            fields.len()
        );

        let clock: f64 = fields[0].parse().context("invalid clock")?;
        ensure!(
            clock.is_finite() && clock > 0.,
            "clock must be positive, got {clock}"
        );

        let mut timings = [0u16; 8];
        for (value, field) in timings.iter_mut().zip(&fields[1..9]) {
            *value = field
                .parse()
                .with_context(|| format!("invalid timing {field:?}"))?;
        }
        let [hdisplay, hsync_start, hsync_end, htotal, vdisplay, vsync_start, vsync_end, vtotal] =
            timings;

        ensure!(
            hdisplay < hsync_start && hsync_start < hsync_end && hsync_end < htotal,
            "horizontal timings must satisfy display < sync start < sync end < total"
        );
        ensure!(
            vdisplay < vsync_start && vsync_start < vsync_end && vsync_end < vtotal,
            "vertical timings must satisfy display < sync start < sync end < total"
        );

        Ok(Self {
            clock,
            hdisplay,
            hsync_start,
            hsync_end,
            htotal,
            vdisplay,
            vsync_start,
            vsync_end,
            vtotal,
            hsync_polarity: parse_polarity(fields[9], "hsync")?,
            vsync_polarity: parse_polarity(fields[10], "vsync")?,
        })
    }
}
