//! Plain data describing DRM objects
//!
//! The resolver and screen logic only ever see these values. The real card
//! converts from the `drm` crate's types at the boundary, the mock card in
//! `crate::testing` builds them directly.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EncoderId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CrtcId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyId(pub u32);

/// Identity of a locked scanout buffer, stable for the buffer's lifetime.
///
/// For GBM this is the address of the `gbm_bo`, which the surface recycles
/// through its swap chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub usize);

bitflags! {
    /// `DRM_MODE_TYPE_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeTypeFlags: u32 {
        const BUILTIN = 1 << 0;
        const CLOCK_C = 1 << 1;
        const CRTC_C = 1 << 2;
        const PREFERRED = 1 << 3;
        const DEFAULT = 1 << 4;
        const USERDEF = 1 << 5;
        const DRIVER = 1 << 6;
    }
}

bitflags! {
    /// `DRM_MODE_FLAG_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeFlags: u32 {
        const PHSYNC = 1 << 0;
        const NHSYNC = 1 << 1;
        const PVSYNC = 1 << 2;
        const NVSYNC = 1 << 3;
        const INTERLACE = 1 << 4;
        const DBLSCAN = 1 << 5;
        const CSYNC = 1 << 6;
        const PCSYNC = 1 << 7;
        const NCSYNC = 1 << 8;
        const HSKEW = 1 << 9;
        const DBLCLK = 1 << 12;
        const CLKDIV2 = 1 << 13;
    }
}

/// A display timing, field for field what `drm_mode_modeinfo` carries.
///
/// Equality compares every field including the name, so a live CRTC mode
/// only matches an advertised mode when the driver reports them identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    pub name: String,
    /// Pixel clock in kHz.
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: ModeFlags,
    pub mode_type: ModeTypeFlags,
}

impl ModeInfo {
    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type.contains(ModeTypeFlags::PREFERRED)
    }
}

impl fmt::Display for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.hdisplay, self.vdisplay, self.vrefresh)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Connected,
    Disconnected,
    Unknown,
}

/// `DRM_MODE_CONNECTOR_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Unknown,
    Vga,
    DviI,
    DviD,
    DviA,
    Composite,
    SVideo,
    Lvds,
    Component,
    NinePinDin,
    DisplayPort,
    HdmiA,
    HdmiB,
    Tv,
    EmbeddedDisplayPort,
    Virtual,
    Dsi,
    Dpi,
    Writeback,
    Spi,
    Usb,
}

impl ConnectorKind {
    /// Prefix used when naming outputs, e.g. `HDMI` in `HDMI1`.
    pub fn name_prefix(self) -> &'static str {
        match self {
            ConnectorKind::Unknown => "None",
            ConnectorKind::Vga => "VGA",
            ConnectorKind::DviI | ConnectorKind::DviD | ConnectorKind::DviA => "DVI",
            ConnectorKind::Composite => "Composite",
            ConnectorKind::SVideo | ConnectorKind::Tv => "TV",
            ConnectorKind::Lvds => "LVDS",
            ConnectorKind::Component => "CTV",
            ConnectorKind::NinePinDin => "DIN",
            ConnectorKind::DisplayPort => "DP",
            ConnectorKind::HdmiA | ConnectorKind::HdmiB => "HDMI",
            ConnectorKind::EmbeddedDisplayPort => "eDP",
            ConnectorKind::Virtual => "Virtual",
            ConnectorKind::Dsi => "DSI",
            ConnectorKind::Dpi => "DPI",
            ConnectorKind::Writeback => "Writeback",
            ConnectorKind::Spi => "SPI",
            ConnectorKind::Usb => "USB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Subpixel {
    #[default]
    Unknown,
    HorizontalRgb,
    HorizontalBgr,
    VerticalRgb,
    VerticalBgr,
    None,
}

/// DPMS levels, valued as the kernel's `DRM_MODE_DPMS_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PowerState {
    #[default]
    On = 0,
    Standby = 1,
    Suspend = 2,
    Off = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    pub kind: ConnectorKind,
    /// Per-kind index assigned by the kernel, starting at 1.
    pub kind_index: u32,
    pub state: ConnectorState,
    pub physical_size_mm: (u32, u32),
    pub subpixel: Subpixel,
    pub modes: Vec<ModeInfo>,
    pub encoders: Vec<EncoderId>,
    pub current_encoder: Option<EncoderId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: EncoderId,
    pub crtc: Option<CrtcId>,
    /// Bit `i` set means the `i`-th CRTC of the card's resources can drive
    /// this encoder.
    pub possible_crtcs: u32,
}

/// CRTC configuration as read back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcState {
    pub id: CrtcId,
    pub position: (u32, u32),
    pub framebuffer: Option<FramebufferId>,
    /// `None` when the kernel reports no valid mode.
    pub mode: Option<ModeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub connectors: Vec<ConnectorId>,
    pub crtcs: Vec<CrtcId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardEvent {
    PageFlip {
        crtc: CrtcId,
        frame: u32,
        time: Duration,
    },
    Vblank {
        crtc: CrtcId,
        frame: u32,
    },
    Other,
}
