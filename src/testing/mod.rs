//! Testing infrastructure for the KMS backend
//!
//! Everything runs against [`MockCard`], an in-memory stand-in for a DRM
//! node plus its GBM device, so tests need no hardware or privileges.
//!
//! 1. **MockCard**: a configurable card model that applies modesets and
//!    records every kernel and buffer-manager call in order.
//!
//! 2. **Fixture**: a [`crate::KmsIntegration`] wired to a mock card, with
//!    helpers for presenting frames and completing flips.
//!
//! # Example
//!
//! ```ignore
//! use eglfs_kms::testing::{mode, Fixture, MockCard};
//!
//! let card = MockCard::new();
//! let crtc = card.add_crtc();
//! let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b1);
//! card.add_mode(hdmi, mode(1920, 1080, 60));
//!
//! let mut fixture = Fixture::new(card, Config::default());
//! fixture.init().unwrap();
//! assert_eq!(fixture.screen_count(), 1);
//! ```

mod card;
mod fixture;

pub use card::{mode, preferred_mode, Call, MockBuffer, MockCard, MockSurface, SWAP_CHAIN_LEN};
pub use fixture::Fixture;
