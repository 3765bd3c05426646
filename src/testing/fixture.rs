//! Test fixture for integration testing
//!
//! Wraps a [`KmsIntegration`] over a [`MockCard`] and keeps a second handle
//! on the card for assertions.

use tracing::info;

use super::card::MockCard;
use crate::backend::kms::device::KmsDevice;
use crate::backend::kms::screen::KmsScreen;
use crate::backend::{DeviceIntegration, KmsIntegration, ScreenId};
use crate::config::Config;

pub struct Fixture {
    pub card: MockCard,
    pub kms: KmsIntegration<MockCard>,
}

impl Fixture {
    /// The device is considered open from the start; `init` only resolves
    /// screens.
    pub fn new(card: MockCard, config: Config) -> Self {
        let device = KmsDevice::with_card("/dev/dri/card0", card.clone());
        Self {
            card,
            kms: KmsIntegration::with_device(config, device),
        }
    }

    /// Build from a JSON configuration document.
    pub fn with_json(card: MockCard, json: &str) -> anyhow::Result<Self> {
        let config = serde_json::from_str(json)?;
        Ok(Self::new(card, config))
    }

    pub fn init(&mut self) -> anyhow::Result<()> {
        self.kms.platform_init()?;
        self.kms.screen_init()?;
        info!("Test fixture initialized with {} screens", self.screen_count());
        Ok(())
    }

    pub fn screen_count(&self) -> usize {
        self.kms.screen_count()
    }

    pub fn screen(&self, index: usize) -> &KmsScreen<MockCard> {
        &self.kms.screens()[index]
    }

    pub fn screen_names(&self) -> Vec<String> {
        self.kms
            .screens()
            .iter()
            .map(|s| s.name().to_owned())
            .collect()
    }

    /// Create the screen's surface and queue its first frame.
    pub fn present(&mut self, index: usize) -> anyhow::Result<()> {
        self.kms.create_native_window(ScreenId(index))?;
        self.kms.present_buffer(ScreenId(index))
    }

    /// Deliver the completion for the flip pending on a screen.
    pub fn complete_flip(&mut self, index: usize) {
        let crtc = self.screen(index).crtc();
        self.card.complete_flip(crtc);
        self.kms.dispatch_events(None).ok();
    }
}
