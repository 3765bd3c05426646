//! Device integration layer
//!
//! [`DeviceIntegration`] is the capability interface the windowing layer
//! talks to: bring the device up, build screens, hand out native windows
//! for EGL, present and pace frames, drive the hardware cursor. One
//! implementation is constructed at startup and passed to whoever needs it.
//!
//! - **KMS/GBM** (`kms`): direct DRM modesetting with GBM scanout surfaces
//!   and legacy page flips.
//!
//! # Design Invariants
//!
//! 1. **Init before use**: `platform_init` then `screen_init` run once,
//!    before any per-screen call. Screen ids index the screens created by
//!    `screen_init` and stay valid until `platform_destroy`.
//!
//! 2. **Single thread**: every call happens on the thread that owns the
//!    render loop. Nothing here is `Send`.

pub mod kms;

pub use kms::card::NativeWindow;
pub use kms::cursor::{CursorImage, CursorShape};
pub use kms::KmsIntegration;

use std::time::Duration;

/// Index of a screen in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScreenId(pub usize);

/// Which cursor overlay a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorId {
    /// Shared by every screen of the virtual desktop.
    Global,
    /// Owned by one separate screen.
    Screen(ScreenId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    HardwareCursor,
    PBuffers,
    SeparateScreens,
}

pub trait DeviceIntegration {
    /// Open the device. Failure is fatal for the process.
    fn platform_init(&mut self) -> anyhow::Result<()>;

    /// Enumerate outputs and create one screen per usable display.
    fn screen_init(&mut self) -> anyhow::Result<()>;

    /// Restore the console configuration and release the device.
    fn platform_destroy(&mut self);

    fn screen_count(&self) -> usize;

    /// Window handle to create the EGL surface for `screen` from.
    fn create_native_window(&mut self, screen: ScreenId) -> anyhow::Result<NativeWindow>;
    fn destroy_native_window(&mut self, screen: ScreenId);

    /// Show what was just swapped to on `screen`.
    fn present_buffer(&mut self, screen: ScreenId) -> anyhow::Result<()>;

    /// Block until the last flip on `screen` completed.
    fn wait_for_vsync(&mut self, screen: ScreenId);

    /// Read pending device events, waiting up to `timeout`. Returns whether
    /// anything arrived.
    fn dispatch_events(&mut self, timeout: Option<Duration>) -> anyhow::Result<bool>;

    /// `None` when hardware cursors are turned off.
    fn create_cursor(&mut self, screen: ScreenId) -> Option<CursorId>;
    fn change_cursor(&mut self, cursor: CursorId, image: &CursorImage);
    fn set_cursor_pos(&mut self, cursor: CursorId, pos: (i32, i32));
    fn set_cursor_visible(&mut self, cursor: CursorId, visible: bool);

    fn has_capability(&self, capability: Capability) -> bool;

    /// Give the displays back, e.g. on VT switch away.
    fn suspend(&mut self);
    fn resume(&mut self);
}
