//! One display's rendering surface and page-flip pipeline
//!
//! A screen moves through `NoSurface` → `SurfaceCreated` → `ModeSet`, then
//! alternates between `FlipPending` and `Idle` for every frame.
//!
//! # Design Invariants
//!
//! 1. **One flip in flight**: `next` holds the buffer the kernel has been
//!    asked to show. `current` is what is on screen and goes back to the
//!    surface only after the flip to `next` completed.
//!
//! 2. **Framebuffers live as long as the surface**: the side table maps each
//!    swap-chain buffer to its kernel framebuffer. Entries are only removed
//!    when the surface, and with it every buffer, is destroyed.
//!
//! 3. **Field order for Drop**: buffers are declared before the surface they
//!    were locked from so they are released first.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::card::{Card, NativeWindow, ScanoutSurface};
use super::cursor::CursorOverlay;
use super::device::KmsDevice;
use super::helpers::{logical_dpi, physical_size_mm};
use super::outputs::OutputDescriptor;
use super::types::{
    BufferId, ConnectorId, CrtcId, FramebufferId, ModeInfo, PowerState, Subpixel,
};
use crate::tracy::VBlankFrameTracker;
use crate::{tracy_frame_mark, tracy_plot, tracy_span};

type ScanoutBuffer<C> = <<C as Card>::Surface as ScanoutSurface>::Buffer;

/// Refresh rate reported when the mode carries none.
const FALLBACK_REFRESH_RATE: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScreenState {
    NoSurface,
    SurfaceCreated,
    ModeSet,
    FlipPending,
    Idle,
}

/// Position and size in the virtual desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

pub struct KmsScreen<C: Card> {
    next: Option<ScanoutBuffer<C>>,
    current: Option<ScanoutBuffer<C>>,
    surface: Option<C::Surface>,
    framebuffers: HashMap<BufferId, FramebufferId>,
    output: OutputDescriptor,
    position: (i32, i32),
    primary: bool,
    mode_set: bool,
    always_set_mode: bool,
    power_state: PowerState,
    /// Only used when screens are kept separate.
    cursor: Option<CursorOverlay<C>>,
    vblank_tracker: VBlankFrameTracker,
}

impl<C: Card> KmsScreen<C> {
    pub fn new(
        output: OutputDescriptor,
        position: (i32, i32),
        primary: bool,
        always_set_mode: bool,
    ) -> Self {
        let vblank_tracker = VBlankFrameTracker::new(&output.name);
        Self {
            next: None,
            current: None,
            surface: None,
            framebuffers: HashMap::new(),
            output,
            position,
            primary,
            mode_set: false,
            always_set_mode,
            power_state: PowerState::On,
            cursor: None,
            vblank_tracker,
        }
    }

    pub fn name(&self) -> &str {
        &self.output.name
    }

    pub fn output(&self) -> &OutputDescriptor {
        &self.output
    }

    pub fn crtc(&self) -> CrtcId {
        self.output.crtc_id
    }

    pub fn connector(&self) -> ConnectorId {
        self.output.connector_id
    }

    pub fn mode(&self) -> &ModeInfo {
        self.output.selected_mode()
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn geometry(&self) -> Geometry {
        let (width, height) = self.mode().size();
        Geometry {
            x: self.position.0,
            y: self.position.1,
            width: width as u32,
            height: height as u32,
        }
    }

    pub fn physical_size_mm(&self) -> (f64, f64) {
        physical_size_mm(self.mode().size(), self.output.physical_size_mm)
    }

    pub fn logical_dpi(&self) -> (f64, f64) {
        logical_dpi(self.mode().size(), self.physical_size_mm())
    }

    pub fn refresh_rate(&self) -> u32 {
        match self.mode().vrefresh {
            0 => FALLBACK_REFRESH_RATE,
            refresh => refresh,
        }
    }

    pub fn depth(&self) -> u32 {
        32
    }

    pub fn subpixel(&self) -> Subpixel {
        self.output.subpixel
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    pub fn is_mode_set(&self) -> bool {
        self.mode_set
    }

    pub fn is_flip_pending(&self) -> bool {
        self.next.is_some()
    }

    pub fn state(&self) -> ScreenState {
        if self.surface.is_none() {
            ScreenState::NoSurface
        } else if !self.mode_set {
            ScreenState::SurfaceCreated
        } else if self.next.is_some() {
            ScreenState::FlipPending
        } else if self.current.is_some() {
            ScreenState::Idle
        } else {
            ScreenState::ModeSet
        }
    }

    /// Buffer currently scanned out.
    pub fn current_buffer(&self) -> Option<BufferId> {
        self.current.as_ref().map(<C::Surface as ScanoutSurface>::buffer_id)
    }

    /// Buffer waiting for its flip to complete.
    pub fn next_buffer(&self) -> Option<BufferId> {
        self.next.as_ref().map(<C::Surface as ScanoutSurface>::buffer_id)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn cursor(&self) -> Option<&CursorOverlay<C>> {
        self.cursor.as_ref()
    }

    pub(super) fn cursor_mut(&mut self) -> Option<&mut CursorOverlay<C>> {
        self.cursor.as_mut()
    }

    pub(super) fn set_cursor(&mut self, cursor: CursorOverlay<C>) {
        self.cursor = Some(cursor);
    }

    pub(super) fn take_cursor(&mut self) -> Option<CursorOverlay<C>> {
        self.cursor.take()
    }

    /// The GBM surface sized to the selected mode, created on first use.
    pub fn create_surface(&mut self, card: &C) -> anyhow::Result<NativeWindow> {
        if let Some(surface) = &self.surface {
            return Ok(surface.native_window());
        }

        let (width, height) = self.mode().size();
        debug!("Creating gbm_surface for screen {} ({width}x{height})", self.name());
        let surface = card
            .create_surface(width as u32, height as u32)
            .with_context(|| format!("{}: error creating GBM surface", self.name()))?;

        let window = surface.native_window();
        self.surface = Some(surface);
        Ok(window)
    }

    /// Release both buffers, remove every framebuffer, drop the surface.
    ///
    /// The CRTC goes back to its saved state first, since removing the
    /// framebuffer it scans out disables it. A later surface sets the mode
    /// again on its first flip.
    pub fn destroy_surface(&mut self, card: &C) {
        if self.surface.is_none() {
            return;
        }

        self.restore_mode(card);

        self.next = None;
        self.current = None;

        for (buffer, framebuffer) in self.framebuffers.drain() {
            trace!("{}: removing {framebuffer:?} for {buffer:?}", self.output.name);
            if let Err(err) = card.remove_framebuffer(framebuffer) {
                warn!(
                    "{}: failed to remove framebuffer {framebuffer:?}: {err:?}",
                    self.output.name
                );
            }
        }

        self.surface = None;
        debug!("Destroyed gbm_surface for screen {}", self.name());
    }

    fn framebuffer_for(&mut self, card: &C, buffer: &ScanoutBuffer<C>) -> io::Result<FramebufferId> {
        let id = <C::Surface as ScanoutSurface>::buffer_id(buffer);
        if let Some(framebuffer) = self.framebuffers.get(&id) {
            return Ok(*framebuffer);
        }

        let framebuffer = card.add_framebuffer(buffer)?;
        trace!("{}: added {framebuffer:?} for {id:?}", self.name());
        self.framebuffers.insert(id, framebuffer);
        tracy_plot!("scanout framebuffers", self.framebuffers.len());
        Ok(framebuffer)
    }

    /// Apply the selected mode the first time a frame is shown.
    fn ensure_mode_set(&mut self, card: &C, framebuffer: FramebufferId) {
        if self.mode_set {
            return;
        }
        self.mode_set = true;

        let mode = self.output.selected_mode();
        if !self.always_set_mode {
            let live = card.crtc(self.output.crtc_id).ok().and_then(|crtc| crtc.mode);
            if live.as_ref() == Some(mode) {
                debug!("Mode already set, skipping modesetting for screen {}", self.name());
                return;
            }
        }

        info!("Setting mode {} for screen {}", mode, self.name());
        let result = card.set_crtc(
            self.output.crtc_id,
            Some(framebuffer),
            (0, 0),
            &[self.output.connector_id],
            Some(mode),
        );
        match result {
            Ok(()) => self.set_power_state(card, PowerState::On),
            Err(err) => warn!("{}: could not set DRM mode: {err:?}", self.name()),
        }
    }

    /// Queue the buffer EGL just swapped to.
    ///
    /// Only a failure to lock the front buffer is an error; anything else
    /// drops the frame with a warning.
    pub fn flip(&mut self, card: &C) -> anyhow::Result<()> {
        tracy_span!("KmsScreen::flip");

        let Some(surface) = &self.surface else {
            warn!("{}: cannot flip before a surface exists", self.name());
            return Ok(());
        };

        if self.next.is_some() {
            warn!("{}: flip already pending, dropping frame", self.name());
            return Ok(());
        }

        let buffer = surface
            .lock_front_buffer()
            .with_context(|| format!("{}: could not lock GBM surface front buffer", self.name()))?;

        let framebuffer = match self.framebuffer_for(card, &buffer) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                warn!("{}: failed to add framebuffer: {err:?}", self.name());
                return Ok(());
            }
        };

        self.ensure_mode_set(card, framebuffer);

        if let Err(err) = card.page_flip(self.output.crtc_id, framebuffer) {
            // `buffer` goes back to the surface here.
            warn!("{}: could not queue DRM page flip: {err:?}", self.name());
            return Ok(());
        }

        self.next = Some(buffer);
        self.vblank_tracker.begin_frame();
        Ok(())
    }

    /// The kernel now scans out `next`; release the old `current`.
    pub fn flip_finished(&mut self) {
        let Some(next) = self.next.take() else {
            debug!("{}: flip completion without a pending flip", self.name());
            return;
        };

        self.current = Some(next);
        self.vblank_tracker.end_frame();
        tracy_frame_mark!("vblank");
    }

    /// Put back the CRTC configuration found before takeover.
    pub fn restore_mode(&mut self, card: &C) {
        if !self.mode_set {
            return;
        }
        self.mode_set = false;

        let Some(saved) = &self.output.saved_crtc else {
            return;
        };

        info!("Restoring original mode for screen {}", self.name());
        let result = match &saved.mode {
            Some(mode) => card.set_crtc(
                saved.id,
                saved.framebuffer,
                saved.position,
                &[self.output.connector_id],
                Some(mode),
            ),
            None => card.set_crtc(saved.id, None, (0, 0), &[], None),
        };
        if let Err(err) = result {
            warn!("{}: failed to restore mode: {err:?}", self.name());
        }
    }

    /// Write DPMS, a no-op when the connector has no such property.
    pub fn set_power_state(&mut self, card: &C, state: PowerState) {
        let Some(property) = self.output.dpms_property else {
            trace!("{}: no DPMS property, ignoring {state:?}", self.name());
            return;
        };

        match card.set_connector_property(self.output.connector_id, property, state as u64) {
            Ok(()) => self.power_state = state,
            Err(err) => warn!("{}: failed to set power state {state:?}: {err:?}", self.name()),
        }
    }
}

/// Block until the flip pending on `screens[index]` completes.
///
/// Returns at once when nothing is pending. Completions for other screens
/// that arrive meanwhile are delivered to them. `timeout` bounds the whole
/// wait; on expiry the flip stays pending and an error is returned.
pub fn wait_for_flip<C: Card>(
    device: &KmsDevice<C>,
    screens: &mut [KmsScreen<C>],
    index: usize,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let Some(screen) = screens.get(index) else {
        bail!("no screen at index {index}");
    };
    if !screen.is_flip_pending() {
        return Ok(());
    }

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    while screens[index].is_flip_pending() {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if !device.handle_drm_event(screens, remaining)? {
            bail!("{}: timed out waiting for page flip", screens[index].name());
        }
    }

    Ok(())
}
