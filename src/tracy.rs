//! Tracy profiling hooks
//!
//! All macros compile to nothing unless the `profile-with-tracy` feature is
//! enabled.
//!
//! ```ignore
//! fn flip(&mut self) {
//!     tracy_span!("KmsScreen::flip");
//!     // ...
//! }
//! ```
//!
//! Page-flip completions call `tracy_frame_mark!`, and each screen keeps a
//! [`VBlankFrameTracker`] so flip-to-completion intervals show up as a
//! separate frame series per output.

/// Tracy span covering the rest of the current scope.
#[macro_export]
#[cfg(feature = "profile-with-tracy")]
macro_rules! tracy_span {
    ($name:expr) => {
        let _span = tracy_client::span!($name);
    };
}

#[macro_export]
#[cfg(not(feature = "profile-with-tracy"))]
macro_rules! tracy_span {
    ($name:expr) => {};
}

/// Frame boundary in Tracy's frame view.
#[macro_export]
#[cfg(feature = "profile-with-tracy")]
macro_rules! tracy_frame_mark {
    ($name:expr) => {
        if let Some(client) = tracy_client::Client::running() {
            client.secondary_frame_mark(tracy_client::frame_name!($name));
        }
    };
}

#[macro_export]
#[cfg(not(feature = "profile-with-tracy"))]
macro_rules! tracy_frame_mark {
    ($name:expr) => {};
}

/// Plot a value over time.
#[macro_export]
#[cfg(feature = "profile-with-tracy")]
macro_rules! tracy_plot {
    ($name:expr, $value:expr) => {{
        static PLOT: std::sync::OnceLock<tracy_client::PlotName> = std::sync::OnceLock::new();
        let name = PLOT.get_or_init(|| tracy_client::plot_name!($name));
        tracy_client::Client::running().map(|c| c.plot(*name, $value as f64));
    }};
}

#[macro_export]
#[cfg(not(feature = "profile-with-tracy"))]
macro_rules! tracy_plot {
    ($name:expr, $value:expr) => {};
}

/// Non-continuous Tracy frames, one series per screen, spanning the time
/// from queueing a page flip to its completion event.
#[cfg(feature = "profile-with-tracy")]
pub struct VBlankFrameTracker {
    frame: Option<tracy_client::Frame>,
    frame_name: tracy_client::FrameName,
}

#[cfg(feature = "profile-with-tracy")]
impl VBlankFrameTracker {
    pub fn new(screen_name: &str) -> Self {
        // frame_name! wants a literal, screen names are only known at runtime.
        let frame_name = tracy_client::FrameName::new_leak(format!("flip-{screen_name}"));
        Self {
            frame: None,
            frame_name,
        }
    }

    /// Call after a page flip was queued.
    pub fn begin_frame(&mut self) {
        if let Some(client) = tracy_client::Client::running() {
            self.frame.take();
            self.frame = Some(client.non_continuous_frame(self.frame_name));
        }
    }

    /// Call when the flip completed. Dropping the frame ends it.
    pub fn end_frame(&mut self) {
        self.frame.take();
    }
}

#[cfg(not(feature = "profile-with-tracy"))]
pub struct VBlankFrameTracker;

#[cfg(not(feature = "profile-with-tracy"))]
impl VBlankFrameTracker {
    #[inline(always)]
    pub fn new(_screen_name: &str) -> Self {
        Self
    }

    #[inline(always)]
    pub fn begin_frame(&mut self) {}

    #[inline(always)]
    pub fn end_frame(&mut self) {}
}
