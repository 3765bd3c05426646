//! KMS/GBM device integration
//!
//! Takes a DRM device over without any display server: picks a CRTC and a
//! mode for every connected display, gives EGL one GBM surface per screen
//! and scans out what it renders with legacy page flips.
//!
//! - `device`: the opened node and CRTC/connector bookkeeping
//! - `outputs`: connector resolution and virtual desktop layout
//! - `screen`: per-display surface, framebuffers and flips
//! - `cursor`: hardware cursor plane
//! - `card`/`drm_card`: the ioctl seam and its real implementation
//!
//! # Design Invariants
//!
//! 1. **Restore before release**: teardown puts each CRTC back the way it
//!    was found before removing the framebuffers that were on screen.
//!
//! 2. **Cursor ownership follows topology**: with a merged desktop the
//!    device owns one overlay mirrored on all screens; with separate screens
//!    each screen owns its own, created on first use.

pub mod card;
pub mod cursor;
pub mod device;
pub mod drm_card;
pub mod helpers;
pub mod outputs;
pub mod screen;
pub mod types;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use smithay::backend::udev;
use tracing::{debug, info, warn};

use self::card::{Card, NativeWindow};
use self::cursor::{CursorImage, CursorOverlay, CursorTarget};
use self::device::KmsDevice;
use self::drm_card::DrmCard;
use self::outputs::{create_screens, CursorTopology};
use self::screen::{wait_for_flip, KmsScreen};
use self::types::PowerState;
use super::{Capability, CursorId, DeviceIntegration, ScreenId};
use crate::config::Config;

pub struct KmsIntegration<C: Card = DrmCard> {
    config: Config,
    screens: Vec<KmsScreen<C>>,
    topology: CursorTopology,
    device: Option<KmsDevice<C>>,
}

impl<C: Card> KmsIntegration<C> {
    pub fn new(config: Config) -> Self {
        let topology = if config.separate_screens {
            CursorTopology::IndependentCursorPerOutput
        } else {
            CursorTopology::SharedCursorAcrossOutputs
        };

        Self {
            config,
            screens: Vec::new(),
            topology,
            device: None,
        }
    }

    /// Use an already constructed device instead of opening one in
    /// `platform_init`.
    pub fn with_device(config: Config, device: KmsDevice<C>) -> Self {
        let mut integration = Self::new(config);
        integration.device = Some(device);
        integration
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> Option<&KmsDevice<C>> {
        self.device.as_ref()
    }

    pub fn topology(&self) -> CursorTopology {
        self.topology
    }

    pub fn screens(&self) -> &[KmsScreen<C>] {
        &self.screens
    }

    pub fn screen(&self, id: ScreenId) -> Option<&KmsScreen<C>> {
        self.screens.get(id.0)
    }

    pub fn primary_screen(&self) -> Option<ScreenId> {
        if self.screens.is_empty() {
            return None;
        }
        let index = self.screens.iter().position(|s| s.is_primary()).unwrap_or(0);
        Some(ScreenId(index))
    }

    /// DPMS for one screen. Connectors without the property ignore this.
    pub fn set_power_state(&mut self, id: ScreenId, state: PowerState) -> anyhow::Result<()> {
        let (card, screen) = self.screen_parts(id)?;
        screen.set_power_state(card, state);
        Ok(())
    }

    /// The global cursor, if one was created.
    pub fn global_cursor(&self) -> Option<&CursorOverlay<C>> {
        self.device.as_ref()?.global_cursor()
    }

    fn device_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.config.device {
            info!("Using DRM device {path:?} specified in config file");
            return Ok(path.clone());
        }

        let seat = &self.config.seat;
        let path = match udev::primary_gpu(seat).context("error getting the primary GPU")? {
            Some(path) => path,
            None => {
                debug!("No boot GPU on {seat}, taking the first one");
                udev::all_gpus(seat)
                    .context("error enumerating GPUs")?
                    .into_iter()
                    .next()
                    .with_context(|| format!("Could not find DRM device on {seat}"))?
            }
        };
        info!("Found DRM device {path:?}");
        Ok(path)
    }

    fn screen_parts(&mut self, id: ScreenId) -> anyhow::Result<(&C, &mut KmsScreen<C>)> {
        let device = self.device.as_ref().context("DRM device is not initialized")?;
        let screen = self
            .screens
            .get_mut(id.0)
            .with_context(|| format!("no screen with id {}", id.0))?;
        Ok((device.card()?, screen))
    }

    /// Wait out pending flips so no buffer is in use by the kernel.
    fn drain_flips(&mut self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        let timeout = self.config.flip_timeout();
        for index in 0..self.screens.len() {
            if let Err(err) = wait_for_flip(device, &mut self.screens, index, timeout) {
                warn!("{err:#}");
            }
        }
    }

    fn cursor_targets(screens: &[KmsScreen<C>]) -> Vec<CursorTarget> {
        screens
            .iter()
            .map(|screen| {
                let geometry = screen.geometry();
                CursorTarget::new(
                    screen.crtc(),
                    screen.name(),
                    screen.position(),
                    (geometry.width, geometry.height),
                )
            })
            .collect()
    }

    fn with_cursor(&mut self, id: CursorId, f: impl FnOnce(&C, &mut CursorOverlay<C>)) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        match id {
            CursorId::Global => {
                if let Some((card, cursor)) = device.global_cursor_mut() {
                    f(card, cursor);
                }
            }
            CursorId::Screen(screen) => {
                let Ok(card) = device.card() else {
                    return;
                };
                if let Some(cursor) = self.screens.get_mut(screen.0).and_then(|s| s.cursor_mut()) {
                    f(card, cursor);
                }
            }
        }
    }
}

impl<C: Card> DeviceIntegration for KmsIntegration<C> {
    fn platform_init(&mut self) -> anyhow::Result<()> {
        if self.device.is_none() {
            let path = self.device_path()?;
            self.device = Some(KmsDevice::new(path));
        }

        let Some(device) = self.device.as_mut() else {
            bail!("DRM device is not initialized");
        };
        let path = device.path().to_owned();
        device
            .open()
            .with_context(|| format!("Could not open DRM device {path:?}"))
    }

    fn screen_init(&mut self) -> anyhow::Result<()> {
        let device = self.device.as_mut().context("DRM device is not initialized")?;
        let layout = create_screens(device, &self.config)?;
        if layout.screens.is_empty() {
            warn!("No usable outputs found");
        }

        info!(
            "Created {} screens, {:?}",
            layout.screens.len(),
            layout.topology
        );
        self.screens = layout.screens;
        self.topology = layout.topology;
        Ok(())
    }

    fn platform_destroy(&mut self) {
        if self.device.is_none() {
            return;
        }

        self.drain_flips();

        if let Some(device) = self.device.as_mut() {
            if let Ok(card) = device.card() {
                for screen in &mut self.screens {
                    screen.restore_mode(card);
                    if let Some(cursor) = screen.take_cursor() {
                        cursor.destroy(card);
                    }
                    screen.destroy_surface(card);
                }
            }
            device.close();
        }

        self.screens.clear();
        self.device = None;
        debug!("KMS integration destroyed");
    }

    fn screen_count(&self) -> usize {
        self.screens.len()
    }

    fn create_native_window(&mut self, screen: ScreenId) -> anyhow::Result<NativeWindow> {
        let (card, screen) = self.screen_parts(screen)?;
        screen.create_surface(card)
    }

    fn destroy_native_window(&mut self, screen: ScreenId) {
        self.wait_for_vsync(screen);
        match self.screen_parts(screen) {
            Ok((card, screen)) => screen.destroy_surface(card),
            Err(err) => warn!("{err:#}"),
        }
    }

    fn present_buffer(&mut self, screen: ScreenId) -> anyhow::Result<()> {
        let (card, screen) = self.screen_parts(screen)?;
        screen.flip(card)
    }

    fn wait_for_vsync(&mut self, screen: ScreenId) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        let timeout = self.config.flip_timeout();
        if let Err(err) = wait_for_flip(device, &mut self.screens, screen.0, timeout) {
            warn!("{err:#}");
        }
    }

    fn dispatch_events(&mut self, timeout: Option<Duration>) -> anyhow::Result<bool> {
        let device = self.device.as_ref().context("DRM device is not initialized")?;
        device.handle_drm_event(&mut self.screens, timeout)
    }

    fn create_cursor(&mut self, screen: ScreenId) -> Option<CursorId> {
        if !self.config.hwcursor {
            return None;
        }
        if screen.0 >= self.screens.len() {
            warn!("no screen with id {}", screen.0);
            return None;
        }

        let atlas = self.config.cursor_atlas_path();
        let device = self.device.as_mut()?;

        match self.topology {
            CursorTopology::SharedCursorAcrossOutputs => {
                if device.global_cursor().is_none() {
                    let targets = Self::cursor_targets(&self.screens);
                    let cursor = CursorOverlay::new(device.card().ok()?, targets, atlas.as_deref());
                    device.set_global_cursor(cursor);
                }
                Some(CursorId::Global)
            }
            CursorTopology::IndependentCursorPerOutput => {
                let card = device.card().ok()?;
                let targets = Self::cursor_targets(&self.screens[screen.0..=screen.0]);
                let kms_screen = &mut self.screens[screen.0];
                if kms_screen.cursor().is_none() {
                    kms_screen.set_cursor(CursorOverlay::new(card, targets, atlas.as_deref()));
                }
                Some(CursorId::Screen(screen))
            }
        }
    }

    fn change_cursor(&mut self, cursor: CursorId, image: &CursorImage) {
        self.with_cursor(cursor, |card, cursor| cursor.change_cursor(card, image));
    }

    fn set_cursor_pos(&mut self, cursor: CursorId, pos: (i32, i32)) {
        self.with_cursor(cursor, |card, cursor| cursor.set_pos(card, pos));
    }

    fn set_cursor_visible(&mut self, cursor: CursorId, visible: bool) {
        self.with_cursor(cursor, |card, cursor| cursor.set_visible(card, visible));
    }

    fn has_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::HardwareCursor => self.config.hwcursor,
            Capability::PBuffers => self.config.pbuffers,
            Capability::SeparateScreens => self.config.separate_screens,
        }
    }

    fn suspend(&mut self) {
        info!("Suspending KMS integration");
        self.drain_flips();

        let Some(device) = self.device.as_ref() else {
            return;
        };
        let Ok(card) = device.card() else {
            return;
        };
        for screen in &mut self.screens {
            screen.restore_mode(card);
        }
    }

    fn resume(&mut self) {
        // restore_mode cleared the mode-set flag, the next flip sets it again.
        info!("Resuming KMS integration");
    }
}

impl<C: Card> Drop for KmsIntegration<C> {
    fn drop(&mut self) {
        self.platform_destroy();
    }
}
