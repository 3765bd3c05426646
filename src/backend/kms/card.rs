//! Kernel and buffer-manager seam
//!
//! [`Card`] is every DRM ioctl and GBM call the backend issues, expressed over
//! the plain types in [`super::types`]. [`super::drm_card::DrmCard`] is the
//! real implementation; `crate::testing::MockCard` records calls instead.
//!
//! # Design Invariants
//!
//! 1. **Buffers release on drop**: a locked scanout buffer goes back to its
//!    surface's pool when the value is dropped. Nothing else releases it.
//!
//! 2. **Framebuffers are explicit**: `add_framebuffer` and
//!    `remove_framebuffer` are never tied to buffer lifetime here. The
//!    screen keeps the side table that pairs them.

use std::ffi::c_void;
use std::io;
use std::path::Path;
use std::time::Duration;

use super::types::{
    BufferId, CardEvent, ConnectorId, ConnectorInfo, CrtcId, CrtcState, EncoderId, EncoderInfo,
    FramebufferId, ModeInfo, PropertyId, Resources,
};

/// Handle EGL renders into, `EGLNativeWindowType` on GBM platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeWindow(pub *mut c_void);

impl NativeWindow {
    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }
}

/// A rendering surface whose buffers can be scanned out.
pub trait ScanoutSurface {
    type Buffer;

    /// Take the buffer EGL most recently swapped to.
    fn lock_front_buffer(&self) -> io::Result<Self::Buffer>;

    fn buffer_id(buffer: &Self::Buffer) -> BufferId;

    fn native_window(&self) -> NativeWindow;
}

/// An open DRM device together with its GBM buffer manager.
pub trait Card: Sized {
    type Surface: ScanoutSurface;
    type CursorBuffer;

    /// Open the node read/write and create the buffer manager on it.
    ///
    /// Either both succeed or the node is closed again before returning.
    fn open(path: &Path) -> anyhow::Result<Self>;

    fn resources(&self) -> io::Result<Resources>;
    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo>;
    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo>;
    fn crtc(&self, id: CrtcId) -> io::Result<CrtcState>;

    /// Look a connector property up by name, `None` if the driver lacks it.
    fn connector_property(&self, connector: ConnectorId, name: &str) -> Option<PropertyId>;
    fn set_connector_property(
        &self,
        connector: ConnectorId,
        property: PropertyId,
        value: u64,
    ) -> io::Result<()>;

    /// Legacy modeset. Passing no framebuffer, connectors or mode blanks the
    /// CRTC.
    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()>;

    fn add_framebuffer(
        &self,
        buffer: &<Self::Surface as ScanoutSurface>::Buffer,
    ) -> io::Result<FramebufferId>;
    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> io::Result<()>;

    /// Queue a flip with `DRM_MODE_PAGE_FLIP_EVENT`; completion shows up in
    /// [`Card::receive_events`].
    fn page_flip(&self, crtc: CrtcId, framebuffer: FramebufferId) -> io::Result<()>;

    /// Block until the fd is readable. `Ok(false)` means the timeout expired.
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool>;
    fn receive_events(&self) -> io::Result<Vec<CardEvent>>;

    /// `DRM_CAP_CURSOR_WIDTH`/`DRM_CAP_CURSOR_HEIGHT`.
    fn cursor_plane_size(&self) -> io::Result<(u32, u32)>;

    fn create_surface(&self, width: u32, height: u32) -> io::Result<Self::Surface>;

    fn create_cursor_buffer(&self, width: u32, height: u32) -> io::Result<Self::CursorBuffer>;
    fn write_cursor_buffer(&self, buffer: &mut Self::CursorBuffer, pixels: &[u8])
        -> io::Result<()>;

    /// Install (or with `None`, hide) the hardware cursor on a CRTC.
    fn set_cursor(
        &self,
        crtc: CrtcId,
        buffer: Option<&Self::CursorBuffer>,
        hotspot: (i32, i32),
    ) -> io::Result<()>;
    /// The plain cursor ioctl, for drivers without hotspot support.
    fn set_cursor_without_hotspot(
        &self,
        crtc: CrtcId,
        buffer: Option<&Self::CursorBuffer>,
    ) -> io::Result<()>;
    fn move_cursor(&self, crtc: CrtcId, position: (i32, i32)) -> io::Result<()>;
}
