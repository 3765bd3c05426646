//! eglfs-kms - KMS/GBM display backend
//!
//! Full-screen EGL rendering straight on DRM/KMS: device takeover, output
//! and mode resolution, GBM scanout surfaces, page flipping and the
//! hardware cursor plane.
pub mod backend;
pub mod config;
pub mod testing;
pub mod tracy;

pub use backend::{Capability, CursorId, DeviceIntegration, KmsIntegration, ScreenId};
pub use config::Config;
