//! [`Card`] over a real `/dev/dri/card*` node
//!
//! DRM ioctls go through the `drm` crate and buffer management through `gbm`,
//! both as re-exported by smithay. The GBM device owns the file, so dropping
//! a [`DrmCard`] destroys the buffer manager first and then closes the fd.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::iter::zip;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use drm_ffi::drm_mode_modeinfo;
use smithay::reexports::calloop::generic::Generic;
use smithay::reexports::calloop::{EventLoop, Interest, Mode as CalloopMode, PostAction};
use smithay::reexports::drm::control::{
    self, connector, crtc, encoder, framebuffer, Device as ControlDevice, PageFlipFlags,
    RawResourceHandle,
};
use smithay::reexports::drm::{self, Device as BasicDevice, DriverCapability};
use smithay::reexports::gbm::{self, AsRaw, BufferObject, BufferObjectFlags, Format};
use tracing::{debug, trace};

use super::card::{Card, NativeWindow, ScanoutSurface};
use super::types::{
    BufferId, CardEvent, ConnectorId, ConnectorInfo, ConnectorKind, ConnectorState, CrtcId,
    CrtcState, EncoderId, EncoderInfo, FramebufferId, ModeFlags, ModeInfo, ModeTypeFlags,
    PropertyId, Resources, Subpixel,
};

/// The opened device node.
#[derive(Debug)]
pub struct CardFd(File);

impl AsFd for CardFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for CardFd {}
impl ControlDevice for CardFd {}

pub struct DrmCard {
    path: PathBuf,
    gbm: gbm::Device<CardFd>,
    events: RefCell<ReadableWaiter>,
}

impl std::fmt::Debug for DrmCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmCard").field("path", &self.path).finish()
    }
}

impl DrmCard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Waits for an fd to become readable on a private event loop.
///
/// The loop's data is set when the source fires during one dispatch.
pub struct ReadableWaiter {
    event_loop: EventLoop<'static, bool>,
}

impl ReadableWaiter {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let event_loop: EventLoop<'static, bool> =
            EventLoop::try_new().map_err(io::Error::other)?;
        event_loop
            .handle()
            .insert_source(
                Generic::new(fd, Interest::READ, CalloopMode::Level),
                |_, _, readable| {
                    *readable = true;
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| io::Error::other(err.error))?;
        Ok(Self { event_loop })
    }

    /// `false` when `timeout` passed without the fd becoming readable.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut readable = false;
        self.event_loop
            .dispatch(timeout, &mut readable)
            .map_err(io::Error::other)?;
        Ok(readable)
    }
}

/// GBM surface EGL renders into.
pub struct GbmScanoutSurface {
    surface: gbm::Surface<()>,
}

impl ScanoutSurface for GbmScanoutSurface {
    type Buffer = BufferObject<()>;

    #[allow(unused_unsafe)]
    fn lock_front_buffer(&self) -> io::Result<Self::Buffer> {
        // SAFETY: only called after EGL swapped into this surface, and the
        // returned buffer is dropped before the surface.
        let buffer = unsafe { self.surface.lock_front_buffer() };
        buffer.map_err(|err| io::Error::other(format!("{err:?}")))
    }

    fn buffer_id(buffer: &Self::Buffer) -> BufferId {
        BufferId(buffer.as_raw() as usize)
    }

    fn native_window(&self) -> NativeWindow {
        NativeWindow(self.surface.as_raw() as *mut _)
    }
}

fn handle<T: From<RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero DRM object id"))
}

fn connector_kind(interface: connector::Interface) -> ConnectorKind {
    match interface {
        connector::Interface::VGA => ConnectorKind::Vga,
        connector::Interface::DVII => ConnectorKind::DviI,
        connector::Interface::DVID => ConnectorKind::DviD,
        connector::Interface::DVIA => ConnectorKind::DviA,
        connector::Interface::Composite => ConnectorKind::Composite,
        connector::Interface::SVideo => ConnectorKind::SVideo,
        connector::Interface::LVDS => ConnectorKind::Lvds,
        connector::Interface::Component => ConnectorKind::Component,
        connector::Interface::NinePinDIN => ConnectorKind::NinePinDin,
        connector::Interface::DisplayPort => ConnectorKind::DisplayPort,
        connector::Interface::HDMIA => ConnectorKind::HdmiA,
        connector::Interface::HDMIB => ConnectorKind::HdmiB,
        connector::Interface::TV => ConnectorKind::Tv,
        connector::Interface::EmbeddedDisplayPort => ConnectorKind::EmbeddedDisplayPort,
        connector::Interface::Virtual => ConnectorKind::Virtual,
        connector::Interface::DSI => ConnectorKind::Dsi,
        connector::Interface::DPI => ConnectorKind::Dpi,
        connector::Interface::Writeback => ConnectorKind::Writeback,
        connector::Interface::SPI => ConnectorKind::Spi,
        connector::Interface::USB => ConnectorKind::Usb,
        _ => ConnectorKind::Unknown,
    }
}

fn subpixel(subpixel: connector::SubPixel) -> Subpixel {
    match subpixel {
        connector::SubPixel::HorizontalRgb => Subpixel::HorizontalRgb,
        connector::SubPixel::HorizontalBgr => Subpixel::HorizontalBgr,
        connector::SubPixel::VerticalRgb => Subpixel::VerticalRgb,
        connector::SubPixel::VerticalBgr => Subpixel::VerticalBgr,
        connector::SubPixel::None => Subpixel::None,
        _ => Subpixel::Unknown,
    }
}

fn mode_info(mode: &control::Mode) -> ModeInfo {
    let (hdisplay, vdisplay) = mode.size();
    let (hsync_start, hsync_end, htotal) = mode.hsync();
    let (vsync_start, vsync_end, vtotal) = mode.vsync();
    ModeInfo {
        name: mode.name().to_string_lossy().into_owned(),
        clock: mode.clock(),
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        hskew: mode.hskew(),
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        vscan: mode.vscan(),
        vrefresh: mode.vrefresh(),
        flags: ModeFlags::from_bits_retain(mode.flags().bits()),
        mode_type: ModeTypeFlags::from_bits_retain(mode.mode_type().bits()),
    }
}

fn drm_mode(mode: &ModeInfo) -> control::Mode {
    // Room for the trailing NUL.
    let mut name: [core::ffi::c_char; 32] = [0; 32];
    for (a, b) in zip(&mut name[..31], mode.name.as_bytes()) {
        *a = *b as _;
    }

    control::Mode::from(drm_mode_modeinfo {
        clock: mode.clock,
        hdisplay: mode.hdisplay,
        hsync_start: mode.hsync_start,
        hsync_end: mode.hsync_end,
        htotal: mode.htotal,
        hskew: mode.hskew,
        vdisplay: mode.vdisplay,
        vsync_start: mode.vsync_start,
        vsync_end: mode.vsync_end,
        vtotal: mode.vtotal,
        vscan: mode.vscan,
        vrefresh: mode.vrefresh,
        flags: mode.flags.bits(),
        type_: mode.mode_type.bits(),
        name,
    })
}

impl Card for DrmCard {
    type Surface = GbmScanoutSurface;
    type CursorBuffer = BufferObject<()>;

    fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("error opening {path:?}"))?;
        debug!("opened {path:?} as fd {}", file.as_raw_fd());

        // On failure the fd moved into the GBM constructor is dropped, and
        // with it closed.
        let gbm = gbm::Device::new(CardFd(file))
            .with_context(|| format!("error creating GBM device for {path:?}"))?;

        let events = gbm
            .as_fd()
            .try_clone_to_owned()
            .and_then(ReadableWaiter::new)
            .with_context(|| format!("error watching {path:?} for events"))?;

        Ok(Self {
            path: path.to_owned(),
            gbm,
            events: RefCell::new(events),
        })
    }

    fn resources(&self) -> io::Result<Resources> {
        let res = self.gbm.resource_handles()?;
        Ok(Resources {
            connectors: res
                .connectors()
                .iter()
                .map(|c| ConnectorId(u32::from(*c)))
                .collect(),
            crtcs: res.crtcs().iter().map(|c| CrtcId(u32::from(*c))).collect(),
        })
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        let info = self.gbm.get_connector(handle::<connector::Handle>(id.0)?, false)?;
        Ok(ConnectorInfo {
            id,
            kind: connector_kind(info.interface()),
            kind_index: info.interface_id(),
            state: match info.state() {
                connector::State::Connected => ConnectorState::Connected,
                connector::State::Disconnected => ConnectorState::Disconnected,
                _ => ConnectorState::Unknown,
            },
            physical_size_mm: info.size().unwrap_or((0, 0)),
            subpixel: subpixel(info.subpixel()),
            modes: info.modes().iter().map(mode_info).collect(),
            encoders: info
                .encoders()
                .iter()
                .map(|e| EncoderId(u32::from(*e)))
                .collect(),
            current_encoder: info.current_encoder().map(|e| EncoderId(u32::from(e))),
        })
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        let info = self.gbm.get_encoder(handle::<encoder::Handle>(id.0)?)?;

        // The kernel's mask indexes the resource CRTC list; rebuild it from
        // the filtered handles since the raw bits are not exposed.
        let res = self.gbm.resource_handles()?;
        let possible = res.filter_crtcs(info.possible_crtcs());
        let possible_crtcs = res
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| possible.contains(*crtc))
            .fold(0u32, |mask, (i, _)| mask | (1 << i));

        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(|c| CrtcId(u32::from(c))),
            possible_crtcs,
        })
    }

    fn crtc(&self, id: CrtcId) -> io::Result<CrtcState> {
        let info = self.gbm.get_crtc(handle::<crtc::Handle>(id.0)?)?;
        Ok(CrtcState {
            id,
            position: info.position(),
            framebuffer: info.framebuffer().map(|fb| FramebufferId(u32::from(fb))),
            mode: info.mode().as_ref().map(mode_info),
        })
    }

    fn connector_property(&self, connector: ConnectorId, name: &str) -> Option<PropertyId> {
        let connector = handle::<connector::Handle>(connector.0).ok()?;
        let props = self.gbm.get_properties(connector).ok()?;
        props.into_iter().find_map(|(prop, _)| {
            let info = self.gbm.get_property(prop).ok()?;
            let n = info.name().to_str().ok()?;
            (n == name).then(|| PropertyId(u32::from(prop)))
        })
    }

    fn set_connector_property(
        &self,
        connector: ConnectorId,
        property: PropertyId,
        value: u64,
    ) -> io::Result<()> {
        self.gbm.set_property(
            handle::<connector::Handle>(connector.0)?,
            handle(property.0)?,
            value,
        )
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        let framebuffer = framebuffer
            .map(|fb| handle::<framebuffer::Handle>(fb.0))
            .transpose()?;
        let connectors = connectors
            .iter()
            .map(|c| handle::<connector::Handle>(c.0))
            .collect::<io::Result<Vec<_>>>()?;
        self.gbm.set_crtc(
            handle(crtc.0)?,
            framebuffer,
            position,
            &connectors,
            mode.map(drm_mode),
        )
    }

    fn add_framebuffer(&self, buffer: &BufferObject<()>) -> io::Result<FramebufferId> {
        // XRGB8888: 24 bits of colour in 32 bits per pixel.
        let fb = self.gbm.add_framebuffer(buffer, 24, 32)?;
        Ok(FramebufferId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> io::Result<()> {
        self.gbm
            .destroy_framebuffer(handle::<framebuffer::Handle>(framebuffer.0)?)
    }

    fn page_flip(&self, crtc: CrtcId, framebuffer: FramebufferId) -> io::Result<()> {
        self.gbm.page_flip(
            handle(crtc.0)?,
            handle(framebuffer.0)?,
            PageFlipFlags::EVENT,
            None,
        )
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.events.borrow_mut().wait(timeout)
    }

    fn receive_events(&self) -> io::Result<Vec<CardEvent>> {
        let events = self.gbm.receive_events()?;
        Ok(events
            .map(|event| match event {
                control::Event::PageFlip(event) => CardEvent::PageFlip {
                    crtc: CrtcId(u32::from(event.crtc)),
                    frame: event.frame,
                    time: event.duration,
                },
                control::Event::Vblank(event) => CardEvent::Vblank {
                    crtc: CrtcId(u32::from(event.crtc)),
                    frame: event.frame,
                },
                _ => CardEvent::Other,
            })
            .collect())
    }

    fn cursor_plane_size(&self) -> io::Result<(u32, u32)> {
        let width = self.gbm.get_driver_capability(DriverCapability::CursorWidth)?;
        let height = self.gbm.get_driver_capability(DriverCapability::CursorHeight)?;
        Ok((width as u32, height as u32))
    }

    fn create_surface(&self, width: u32, height: u32) -> io::Result<GbmScanoutSurface> {
        let surface = self.gbm.create_surface::<()>(
            width,
            height,
            Format::Xrgb8888,
            BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
        )?;
        Ok(GbmScanoutSurface { surface })
    }

    fn create_cursor_buffer(&self, width: u32, height: u32) -> io::Result<BufferObject<()>> {
        self.gbm.create_buffer_object::<()>(
            width,
            height,
            Format::Argb8888,
            BufferObjectFlags::CURSOR | BufferObjectFlags::WRITE,
        )
    }

    fn write_cursor_buffer(&self, buffer: &mut BufferObject<()>, pixels: &[u8]) -> io::Result<()> {
        trace!("writing {} bytes to cursor buffer", pixels.len());
        buffer.write(pixels)
    }

    #[allow(deprecated)]
    fn set_cursor(
        &self,
        crtc: CrtcId,
        buffer: Option<&BufferObject<()>>,
        hotspot: (i32, i32),
    ) -> io::Result<()> {
        self.gbm.set_cursor2(handle::<crtc::Handle>(crtc.0)?, buffer, hotspot)
    }

    #[allow(deprecated)]
    fn set_cursor_without_hotspot(
        &self,
        crtc: CrtcId,
        buffer: Option<&BufferObject<()>>,
    ) -> io::Result<()> {
        self.gbm.set_cursor(handle::<crtc::Handle>(crtc.0)?, buffer)
    }

    #[allow(deprecated)]
    fn move_cursor(&self, crtc: CrtcId, position: (i32, i32)) -> io::Result<()> {
        self.gbm.move_cursor(handle::<crtc::Handle>(crtc.0)?, position)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn test_readable_waiter() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let mut waiter = ReadableWaiter::new(OwnedFd::from(reader)).unwrap();

        assert!(!waiter.wait(Some(Duration::from_millis(5))).unwrap());

        writer.write_all(b"x").unwrap();
        assert!(waiter.wait(Some(Duration::from_millis(1000))).unwrap());
        // Level triggered: still readable until drained.
        assert!(waiter.wait(Some(Duration::ZERO)).unwrap());
    }
}
