//! Pure helper functions for the KMS backend.
//!
//! Nothing here touches the device. Mode selection lives here so it can be
//! tested against plain mode lists.

use super::types::{ConnectorKind, ModeFlags, ModeInfo, ModeTypeFlags};
use crate::config::{ModeSetting, Modeline, SyncPolarity};

/// Assumed when a connector reports no physical size.
pub const DEFAULT_DPI: f64 = 100.;

// =============================================================================
// Naming
// =============================================================================

/// Output name such as `HDMI1` or `eDP1`.
pub fn connector_name(kind: ConnectorKind, kind_index: u32) -> String {
    format!("{}{}", kind.name_prefix(), kind_index)
}

// =============================================================================
// Mode calculations
// =============================================================================

/// Build a user-defined mode from a validated modeline.
pub fn mode_from_modeline(modeline: &Modeline) -> ModeInfo {
    let pixel_clock_kilo_hertz = modeline.clock * 1000.0;
    let vrefresh_hertz = (pixel_clock_kilo_hertz * 1000.0)
        / (modeline.htotal as u64 * modeline.vtotal as u64) as f64;

    let flags = match modeline.hsync_polarity {
        SyncPolarity::Positive => ModeFlags::PHSYNC,
        SyncPolarity::Negative => ModeFlags::NHSYNC,
    } | match modeline.vsync_polarity {
        SyncPolarity::Positive => ModeFlags::PVSYNC,
        SyncPolarity::Negative => ModeFlags::NVSYNC,
    };

    ModeInfo {
        name: format!(
            "{}x{}@{:.2}",
            modeline.hdisplay, modeline.vdisplay, vrefresh_hertz
        ),
        clock: pixel_clock_kilo_hertz.round() as u32,
        hdisplay: modeline.hdisplay,
        hsync_start: modeline.hsync_start,
        hsync_end: modeline.hsync_end,
        htotal: modeline.htotal,
        hskew: 0,
        vdisplay: modeline.vdisplay,
        vsync_start: modeline.vsync_start,
        vsync_end: modeline.vsync_end,
        vtotal: modeline.vtotal,
        vscan: 0,
        vrefresh: vrefresh_hertz.round() as u32,
        flags,
        mode_type: ModeTypeFlags::USERDEF,
    }
}

/// Outcome of resolving a connector's mode list against its setting.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeSelection {
    /// Advertised modes plus any synthetic modeline/live-CRTC entries.
    pub modes: Vec<ModeInfo>,
    pub selected: Option<usize>,
    pub preferred: Option<usize>,
    pub current: Option<usize>,
}

/// Pick a mode: configured, then driver-preferred, then the live CRTC mode,
/// then the first advertised one.
///
/// Modes are scanned from the end, so when several match, the lowest index
/// wins. `crtc_mode` is what the CRTC scans out right now, if anything.
pub fn select_mode(
    advertised: &[ModeInfo],
    crtc_mode: Option<&ModeInfo>,
    setting: &ModeSetting,
) -> ModeSelection {
    let mut modes = advertised.to_vec();

    let mut configured = None;
    let mut preferred = None;
    let mut current = None;
    let mut best = None;

    for (i, mode) in modes.iter().enumerate().rev() {
        if let ModeSetting::Size {
            width,
            height,
            refresh,
        } = setting
        {
            if mode.size() == (*width, *height) && refresh.map_or(true, |r| mode.vrefresh == r) {
                configured = Some(i);
            }
        }

        if crtc_mode == Some(mode) {
            current = Some(i);
        }

        if mode.is_preferred() {
            preferred = Some(i);
        }

        best = Some(i);
    }

    if let ModeSetting::Modeline(modeline) = setting {
        modes.push(mode_from_modeline(modeline));
        configured = Some(modes.len() - 1);
    }

    // A zero clock means the CRTC is not really driving anything.
    if current.is_none() {
        if let Some(live) = crtc_mode.filter(|mode| mode.clock != 0) {
            modes.push(live.clone());
            current = Some(modes.len() - 1);
        }
    }

    if *setting == ModeSetting::Current {
        configured = current;
    }

    ModeSelection {
        modes,
        selected: configured.or(preferred).or(current).or(best),
        preferred,
        current,
    }
}

/// Physical size in millimeters, estimated at [`DEFAULT_DPI`] when the
/// reported size is empty.
pub fn physical_size_mm(size: (u16, u16), reported: (u32, u32)) -> (f64, f64) {
    if reported.0 == 0 || reported.1 == 0 {
        (
            size.0 as f64 * 25.4 / DEFAULT_DPI,
            size.1 as f64 * 25.4 / DEFAULT_DPI,
        )
    } else {
        (reported.0 as f64, reported.1 as f64)
    }
}

pub fn logical_dpi(size: (u16, u16), physical_mm: (f64, f64)) -> (f64, f64) {
    if size.0 == 0 || size.1 == 0 || physical_mm.0 <= 0. || physical_mm.1 <= 0. {
        return (DEFAULT_DPI, DEFAULT_DPI);
    }
    (
        25.4 * size.0 as f64 / physical_mm.0,
        25.4 * size.1 as f64 / physical_mm.1,
    )
}
