//! The opened DRM device
//!
//! # Design Invariants
//!
//! 1. **Open is all or nothing**: after a failed `open` there is no card, so
//!    no fd and no GBM device.
//!
//! 2. **Allocations only grow**: CRTC and connector bits are set during the
//!    one enumeration pass and never cleared while screens exist.
//!
//! 3. **Events go to the CRTC that flipped**: page-flip completions carry the
//!    CRTC id; the screen driving that CRTC receives `flip_finished`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, trace, warn};

use super::card::Card;
use super::cursor::CursorOverlay;
use super::screen::KmsScreen;
use super::types::{CardEvent, ConnectorInfo, Resources};
use crate::tracy_span;

pub struct KmsDevice<C: Card> {
    path: PathBuf,
    /// Cursor shared by all screens of a merged virtual desktop.
    global_cursor: Option<CursorOverlay<C>>,
    card: Option<C>,
    /// Bit per index into the resource CRTC list.
    crtc_allocator: u32,
    /// Bit per index into the resource connector list.
    connector_allocator: u64,
}

impl<C: Card> KmsDevice<C> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            global_cursor: None,
            card: None,
            crtc_allocator: 0,
            connector_allocator: 0,
        }
    }

    /// Wrap a card that is already open.
    pub fn with_card(path: impl Into<PathBuf>, card: C) -> Self {
        let mut device = Self::new(path);
        device.card = Some(card);
        device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&mut self) -> anyhow::Result<()> {
        if self.card.is_some() {
            return Ok(());
        }

        info!("Opening DRM device {:?}", self.path);
        let card = C::open(&self.path)?;
        self.card = Some(card);
        Ok(())
    }

    /// Tear down the shared cursor, then drop the buffer manager and fd.
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(card) = self.card.take() else {
            return;
        };

        if let Some(cursor) = self.global_cursor.take() {
            cursor.destroy(&card);
        }

        drop(card);
        info!("Closed DRM device {:?}", self.path);
    }

    pub fn is_open(&self) -> bool {
        self.card.is_some()
    }

    pub fn card(&self) -> anyhow::Result<&C> {
        self.card.as_ref().context("DRM device is not open")
    }

    pub fn global_cursor(&self) -> Option<&CursorOverlay<C>> {
        self.global_cursor.as_ref()
    }

    pub(super) fn set_global_cursor(&mut self, cursor: CursorOverlay<C>) {
        self.global_cursor = Some(cursor);
    }

    /// The shared cursor together with the card it drives.
    pub(super) fn global_cursor_mut(&mut self) -> Option<(&C, &mut CursorOverlay<C>)> {
        Some((self.card.as_ref()?, self.global_cursor.as_mut()?))
    }

    /// Index into `resources.crtcs` of a free CRTC that can drive `connector`.
    ///
    /// An existing encoder→CRTC routing is kept when that CRTC is free,
    /// otherwise the first possible free CRTC wins.
    pub fn crtc_for_connector(
        &self,
        resources: &Resources,
        connector: &ConnectorInfo,
    ) -> Option<usize> {
        let card = self.card.as_ref()?;
        let mut candidate = None;

        for &encoder_id in &connector.encoders {
            let encoder = match card.encoder(encoder_id) {
                Ok(encoder) => encoder,
                Err(err) => {
                    warn!("Failed to get encoder {encoder_id:?}: {err:?}");
                    continue;
                }
            };

            for (i, &crtc) in resources.crtcs.iter().enumerate().take(32) {
                let possible = encoder.possible_crtcs & (1 << i) != 0;
                if !possible || self.is_crtc_allocated(i) {
                    continue;
                }

                let routed = connector.current_encoder == Some(encoder_id)
                    && encoder.crtc == Some(crtc);
                if routed {
                    return Some(i);
                }
                candidate.get_or_insert(i);
            }
        }

        candidate
    }

    pub fn is_crtc_allocated(&self, index: usize) -> bool {
        index < 32 && self.crtc_allocator & (1 << index) != 0
    }

    pub fn is_connector_allocated(&self, index: usize) -> bool {
        index < 64 && self.connector_allocator & (1 << index) != 0
    }

    pub(super) fn reserve(&mut self, crtc_index: usize, connector_index: usize) {
        debug_assert!(crtc_index < 32);
        self.crtc_allocator |= 1 << crtc_index;
        if connector_index < 64 {
            self.connector_allocator |= 1 << connector_index;
        }
    }

    /// Read one batch of kernel events and route page-flip completions.
    ///
    /// Blocks up to `timeout` (forever with `None`) for the fd to become
    /// readable. Returns `Ok(false)` if nothing arrived in time.
    pub fn handle_drm_event(
        &self,
        screens: &mut [KmsScreen<C>],
        timeout: Option<Duration>,
    ) -> anyhow::Result<bool> {
        tracy_span!("KmsDevice::handle_drm_event");

        let card = self.card()?;
        if !card
            .wait_readable(timeout)
            .context("error polling DRM device")?
        {
            return Ok(false);
        }

        let events = card
            .receive_events()
            .context("error reading DRM events")?;
        for event in events {
            match event {
                CardEvent::PageFlip { crtc, frame, time } => {
                    trace!("page flip on {crtc:?}, frame {frame} at {time:?}");
                    match screens.iter_mut().find(|screen| screen.crtc() == crtc) {
                        Some(screen) => screen.flip_finished(),
                        None => debug!("page flip for unowned {crtc:?}"),
                    }
                }
                other => trace!("ignoring DRM event {other:?}"),
            }
        }

        Ok(true)
    }
}

impl<C: Card> Drop for KmsDevice<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::drm_card::DrmCard;
    use crate::backend::kms::types::{ConnectorKind, ConnectorState, CrtcId};
    use crate::testing::MockCard;

    /// A missing node fails before any buffer manager exists
    #[test]
    fn test_open_nonexistent_path() {
        let mut device = KmsDevice::<DrmCard>::new("/nonexistent/dri/card0");
        let err = device.open().unwrap_err();
        assert!(format!("{err:#}").contains("error opening"));
        assert!(!device.is_open());
        assert!(device.card().is_err());

        // Closing a device that never opened is fine, as is closing twice.
        device.close();
        device.close();
    }

    #[test]
    fn test_first_free_crtc() {
        let card = MockCard::new();
        let crtc_a = card.add_crtc();
        let crtc_b = card.add_crtc();
        let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b11);
        let dp = card.add_connector(ConnectorKind::DisplayPort, 1, ConnectorState::Connected, 0b11);

        let mut device = KmsDevice::with_card("/dev/dri/card0", card.clone());
        let resources = card.resources_now();

        let hdmi = card.connector_now(hdmi);
        assert_eq!(device.crtc_for_connector(&resources, &hdmi), Some(0));
        device.reserve(0, 0);
        assert!(device.is_crtc_allocated(0));
        assert!(device.is_connector_allocated(0));

        let dp = card.connector_now(dp);
        assert_eq!(device.crtc_for_connector(&resources, &dp), Some(1));
        device.reserve(1, 1);

        // Both taken: nothing left for a third pass.
        assert_eq!(device.crtc_for_connector(&resources, &dp), None);
        assert_eq!(resources.crtcs, [crtc_a, crtc_b]);
    }

    /// An existing routing is kept even when a lower CRTC is free
    #[test]
    fn test_existing_routing_preferred() {
        let card = MockCard::new();
        card.add_crtc();
        let crtc_b = card.add_crtc();
        let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b11);
        card.route(hdmi, crtc_b, None);

        let device = KmsDevice::with_card("/dev/dri/card0", card.clone());
        let resources = card.resources_now();
        let hdmi = card.connector_now(hdmi);
        assert_eq!(device.crtc_for_connector(&resources, &hdmi), Some(1));
        assert_eq!(resources.crtcs[1], crtc_b);
    }

    #[test]
    fn test_impossible_crtc_skipped() {
        let card = MockCard::new();
        card.add_crtc();
        card.add_crtc();
        let lvds = card.add_connector(ConnectorKind::Lvds, 1, ConnectorState::Connected, 0b10);

        let device = KmsDevice::with_card("/dev/dri/card0", card.clone());
        let resources = card.resources_now();
        let lvds = card.connector_now(lvds);
        assert_eq!(device.crtc_for_connector(&resources, &lvds), Some(1));
    }

    #[test]
    fn test_events_without_screens() {
        let card = MockCard::new();
        card.push_event(CardEvent::PageFlip {
            crtc: CrtcId(99),
            frame: 1,
            time: Duration::ZERO,
        });

        let device = KmsDevice::with_card("/dev/dri/card0", card.clone());
        assert!(device.handle_drm_event(&mut [], None).unwrap());
        // Queue drained, the next read times out.
        assert!(!device.handle_drm_event(&mut [], Some(Duration::ZERO)).unwrap());
    }
}
