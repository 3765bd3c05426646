//! Hardware cursor overlay
//!
//! The pointer image lives in a small dedicated buffer shown through the
//! CRTC cursor plane, so moving the pointer never needs a page flip. Shapes
//! come from a sprite-sheet atlas described by a JSON manifest:
//!
//! ```json
//! { "image": "cursor-atlas.png", "cursorsPerRow": 8, "hotSpots": [[7, 2], ...] }
//! ```
//!
//! One overlay either serves every screen of a merged virtual desktop
//! (one [`CursorTarget`] per screen) or a single separate screen.
//!
//! # Design Invariants
//!
//! 1. **Disabled means inert**: if the buffer or the atlas cannot be set up
//!    the overlay turns itself off and every later call returns at once.
//!
//! 2. **Plane-sized uploads**: every upload is exactly plane width × height
//!    × 4 bytes; smaller images are padded with transparency, larger ones
//!    clipped.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{ensure, Context};
use image::{imageops, RgbaImage};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::card::Card;
use super::types::CrtcId;

pub const CURSOR_SHAPE_COUNT: usize = 22;

/// Plane size used when the driver does not report one.
const DEFAULT_PLANE_SIZE: (u32, u32) = (64, 64);

/// Standard pointer shapes, in atlas order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorShape {
    Arrow,
    UpArrow,
    Cross,
    Wait,
    IBeam,
    SizeVer,
    SizeHor,
    SizeBDiag,
    SizeFDiag,
    SizeAll,
    Blank,
    SplitV,
    SplitH,
    PointingHand,
    Forbidden,
    WhatsThis,
    Busy,
    OpenHand,
    ClosedHand,
    DragCopy,
    DragMove,
    DragLink,
}

impl CursorShape {
    pub const ALL: [CursorShape; CURSOR_SHAPE_COUNT] = [
        CursorShape::Arrow,
        CursorShape::UpArrow,
        CursorShape::Cross,
        CursorShape::Wait,
        CursorShape::IBeam,
        CursorShape::SizeVer,
        CursorShape::SizeHor,
        CursorShape::SizeBDiag,
        CursorShape::SizeFDiag,
        CursorShape::SizeAll,
        CursorShape::Blank,
        CursorShape::SplitV,
        CursorShape::SplitH,
        CursorShape::PointingHand,
        CursorShape::Forbidden,
        CursorShape::WhatsThis,
        CursorShape::Busy,
        CursorShape::OpenHand,
        CursorShape::ClosedHand,
        CursorShape::DragCopy,
        CursorShape::DragMove,
        CursorShape::DragLink,
    ];

    /// Position in the atlas, row-major.
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone)]
pub enum CursorImage {
    Shape(CursorShape),
    /// Caller-supplied pixels, hotspot relative to the image's top left.
    Bitmap { image: RgbaImage, hotspot: (i32, i32) },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtlasManifest {
    image: String,
    cursors_per_row: u32,
    hot_spots: Vec<[i32; 2]>,
}

/// Sprite sheet with one cell per [`CursorShape`].
#[derive(Debug, Clone)]
pub struct CursorAtlas {
    image: RgbaImage,
    cursors_per_row: u32,
    cell_size: (u32, u32),
    hotspots: Vec<(i32, i32)>,
}

impl CursorAtlas {
    /// Read a manifest and the image it names. A relative image path is
    /// resolved against the manifest's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("error reading cursor atlas {path:?}"))?;
        let manifest: AtlasManifest = serde_json::from_slice(&data)
            .with_context(|| format!("error parsing cursor atlas {path:?}"))?;

        let hotspots = manifest
            .hot_spots
            .iter()
            .map(|&[x, y]| (x, y))
            .collect::<Vec<_>>();
        // Cheap checks first, before decoding the image.
        validate(manifest.cursors_per_row, &hotspots)?;

        let image_path = match path.parent() {
            Some(dir) => dir.join(&manifest.image),
            None => manifest.image.clone().into(),
        };
        let image = image::open(&image_path)
            .with_context(|| format!("error loading cursor image {image_path:?}"))?
            .into_rgba8();

        debug!(
            "Loaded cursor atlas {image_path:?}: {}x{}, {} per row",
            image.width(),
            image.height(),
            manifest.cursors_per_row
        );
        Self::new(image, manifest.cursors_per_row, hotspots)
    }

    pub fn new(
        image: RgbaImage,
        cursors_per_row: u32,
        hotspots: Vec<(i32, i32)>,
    ) -> anyhow::Result<Self> {
        validate(cursors_per_row, &hotspots)?;

        let rows = (CURSOR_SHAPE_COUNT as u32).div_ceil(cursors_per_row);
        let cell_size = (image.width() / cursors_per_row, image.height() / rows);
        ensure!(
            cell_size.0 > 0 && cell_size.1 > 0,
            "cursor atlas image {}x{} too small for {cursors_per_row} per row",
            image.width(),
            image.height()
        );

        Ok(Self {
            image,
            cursors_per_row,
            cell_size,
            hotspots,
        })
    }

    pub fn cell_size(&self) -> (u32, u32) {
        self.cell_size
    }

    pub fn hotspot(&self, shape: CursorShape) -> (i32, i32) {
        self.hotspots[shape.index()]
    }

    /// The shape's cell, cut out of the sheet.
    pub fn crop(&self, shape: CursorShape) -> RgbaImage {
        let index = shape.index() as u32;
        let (width, height) = self.cell_size;
        let x = (index % self.cursors_per_row) * width;
        let y = (index / self.cursors_per_row) * height;
        imageops::crop_imm(&self.image, x, y, width, height).to_image()
    }
}

fn validate(cursors_per_row: u32, hotspots: &[(i32, i32)]) -> anyhow::Result<()> {
    ensure!(cursors_per_row > 0, "cursorsPerRow must be positive");
    ensure!(
        hotspots.len() == CURSOR_SHAPE_COUNT,
        "cursor atlas has {} hot spots, expected {CURSOR_SHAPE_COUNT}",
        hotspots.len()
    );
    Ok(())
}

/// A CRTC the overlay mirrors onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorTarget {
    pub crtc: CrtcId,
    pub name: String,
    /// Screen origin in the virtual desktop.
    pub origin: (i32, i32),
    pub size: (u32, u32),
    /// The pointer is outside this screen and the plane is hidden there.
    pub out_of_range: bool,
}

impl CursorTarget {
    pub fn new(crtc: CrtcId, name: impl Into<String>, origin: (i32, i32), size: (u32, u32)) -> Self {
        Self {
            crtc,
            name: name.into(),
            origin,
            size,
            out_of_range: false,
        }
    }

    fn local(&self, pos: (i32, i32)) -> Option<(i32, i32)> {
        let local = (pos.0 - self.origin.0, pos.1 - self.origin.1);
        let inside = local.0 >= 0
            && local.1 >= 0
            && (local.0 as u32) < self.size.0
            && (local.1 as u32) < self.size.1;
        inside.then_some(local)
    }
}

/// Show `buffer` on the plane of `crtc`, or hide it with `None`.
///
/// Drivers that reject the hotspot variant get the plain ioctl.
fn set_plane<C: Card>(
    card: &C,
    crtc: CrtcId,
    buffer: Option<&C::CursorBuffer>,
    hotspot: (i32, i32),
) -> io::Result<()> {
    card.set_cursor(crtc, buffer, hotspot).or_else(|err| {
        debug!("Cursor hotspot not supported on {crtc:?} ({err}), retrying without");
        card.set_cursor_without_hotspot(crtc, buffer)
    })
}

pub struct CursorOverlay<C: Card> {
    buffer: Option<C::CursorBuffer>,
    atlas: Option<CursorAtlas>,
    plane_size: (u32, u32),
    targets: Vec<CursorTarget>,
    pos: (i32, i32),
    hotspot: (i32, i32),
    visible: bool,
    enabled: bool,
}

impl<C: Card> CursorOverlay<C> {
    /// Allocate the cursor buffer, load the atlas and show the arrow at the
    /// origin. Never fails; problems leave a disabled overlay behind.
    pub fn new(card: &C, targets: Vec<CursorTarget>, atlas_path: Option<&Path>) -> Self {
        let plane_size = match card.cursor_plane_size() {
            Ok((width, height)) if width > 0 && height > 0 => (width, height),
            Ok(_) => DEFAULT_PLANE_SIZE,
            Err(err) => {
                debug!("Cursor plane size unavailable, using default: {err:?}");
                DEFAULT_PLANE_SIZE
            }
        };

        let mut overlay = Self {
            buffer: None,
            atlas: None,
            plane_size,
            targets,
            pos: (0, 0),
            hotspot: (0, 0),
            visible: true,
            enabled: false,
        };

        let (width, height) = plane_size;
        match card.create_cursor_buffer(width, height) {
            Ok(buffer) => overlay.buffer = Some(buffer),
            Err(err) => {
                warn!("Could not create {width}x{height} cursor buffer: {err:?}");
                return overlay;
            }
        }

        let atlas = match atlas_path {
            Some(path) => CursorAtlas::load(path),
            None => Err(anyhow::anyhow!("no cursor atlas configured")),
        };
        match atlas {
            Ok(atlas) => overlay.atlas = Some(atlas),
            Err(err) => {
                warn!("Hardware cursor disabled: {err:#}");
                overlay.clear_targets(card);
                return overlay;
            }
        }

        info!("Hardware cursor enabled, plane {width}x{height}");
        overlay.enabled = true;
        overlay.change_cursor(card, &CursorImage::Shape(CursorShape::Arrow));
        overlay.set_pos(card, (0, 0));
        overlay
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn pos(&self) -> (i32, i32) {
        self.pos
    }

    pub fn plane_size(&self) -> (u32, u32) {
        self.plane_size
    }

    pub fn hotspot(&self) -> (i32, i32) {
        self.hotspot
    }

    pub fn targets(&self) -> &[CursorTarget] {
        &self.targets
    }

    /// Render `image` into the cursor buffer and install it on every target
    /// the pointer is on.
    pub fn change_cursor(&mut self, card: &C, image: &CursorImage) {
        if !self.enabled {
            return;
        }

        let (source, hotspot) = match image {
            CursorImage::Shape(shape) => match &self.atlas {
                Some(atlas) => (atlas.crop(*shape), atlas.hotspot(*shape)),
                None => return,
            },
            CursorImage::Bitmap { image, hotspot } => (image.clone(), *hotspot),
        };

        let (width, height) = self.plane_size;
        if source.width() > width || source.height() > height {
            warn!("Cursor larger than {width}x{height}, cursor will be clipped");
        }

        let mut canvas = RgbaImage::new(width, height);
        imageops::replace(&mut canvas, &source, 0, 0);

        // ARGB8888 is stored little-endian: B, G, R, A.
        let pixels = canvas
            .pixels()
            .flat_map(|p| [p[2], p[1], p[0], p[3]])
            .collect::<Vec<u8>>();

        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };
        if let Err(err) = card.write_cursor_buffer(buffer, &pixels) {
            warn!("Could not write cursor buffer: {err:?}");
            return;
        }
        self.hotspot = hotspot;

        if !self.visible {
            return;
        }
        for target in self.targets.iter().filter(|t| !t.out_of_range) {
            if let Err(err) = set_plane(card, target.crtc, Some(&*buffer), hotspot) {
                warn!("Could not set cursor on screen {}: {err:?}", target.name);
            }
        }
    }

    /// Move the pointer to `pos` in virtual desktop coordinates.
    pub fn set_pos(&mut self, card: &C, pos: (i32, i32)) {
        if !self.enabled {
            return;
        }
        self.pos = pos;
        if !self.visible {
            return;
        }

        for target in &mut self.targets {
            let Some(local) = target.local(pos) else {
                if !target.out_of_range {
                    target.out_of_range = true;
                    if let Err(err) = set_plane(card, target.crtc, None, (0, 0)) {
                        warn!("Could not hide cursor on screen {}: {err:?}", target.name);
                    }
                }
                continue;
            };

            if target.out_of_range {
                target.out_of_range = false;
                if let Err(err) = set_plane(card, target.crtc, self.buffer.as_ref(), self.hotspot) {
                    warn!("Could not set cursor on screen {}: {err:?}", target.name);
                }
            }

            let top_left = (local.0 - self.hotspot.0, local.1 - self.hotspot.1);
            if let Err(err) = card.move_cursor(target.crtc, top_left) {
                warn!("Could not move cursor on screen {}: {err:?}", target.name);
            }
        }
    }

    pub fn set_visible(&mut self, card: &C, visible: bool) {
        if !self.enabled || self.visible == visible {
            return;
        }
        self.visible = visible;

        if visible {
            // Re-evaluates which targets the pointer is on.
            for target in &mut self.targets {
                target.out_of_range = true;
            }
            self.set_pos(card, self.pos);
        } else {
            for target in &self.targets {
                if let Err(err) = set_plane(card, target.crtc, None, (0, 0)) {
                    warn!("Could not hide cursor on screen {}: {err:?}", target.name);
                }
            }
        }
    }

    fn clear_targets(&self, card: &C) {
        for target in &self.targets {
            if let Err(err) = set_plane(card, target.crtc, None, (0, 0)) {
                warn!("Could not clear cursor on screen {}: {err:?}", target.name);
            }
            if let Err(err) = card.move_cursor(target.crtc, (0, 0)) {
                warn!("Could not reset cursor on screen {}: {err:?}", target.name);
            }
        }
    }

    /// Hide and re-home the plane on every target, then free the buffer.
    pub fn destroy(mut self, card: &C) {
        if self.buffer.is_none() {
            return;
        }
        self.clear_targets(card);
        self.buffer = None;
        debug!("Destroyed hardware cursor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn atlas_image(per_row: u32, cell: u32) -> RgbaImage {
        let rows = (CURSOR_SHAPE_COUNT as u32).div_ceil(per_row);
        // Each cell is filled with its own index in the red channel.
        RgbaImage::from_fn(per_row * cell, rows * cell, |x, y| {
            let index = (y / cell) * per_row + x / cell;
            Rgba([index as u8, 0, 0, 255])
        })
    }

    fn hotspots(n: usize) -> Vec<(i32, i32)> {
        (0..n).map(|i| (i as i32, 0)).collect()
    }

    #[test]
    fn test_shape_order() {
        assert_eq!(CursorShape::ALL.len(), CURSOR_SHAPE_COUNT);
        for (i, shape) in CursorShape::ALL.iter().enumerate() {
            assert_eq!(shape.index(), i);
        }
        assert_eq!(CursorShape::Blank.index(), 10);
        assert_eq!(CursorShape::DragLink.index(), 21);
    }

    /// 22 shapes at 8 per row need 3 rows
    #[test]
    fn test_cell_size() {
        let atlas = CursorAtlas::new(atlas_image(8, 16), 8, hotspots(22)).unwrap();
        assert_eq!(atlas.cell_size(), (16, 16));

        let cell = atlas.crop(CursorShape::PointingHand);
        assert_eq!(cell.dimensions(), (16, 16));
        assert_eq!(cell.get_pixel(0, 0)[0], 13);
        assert_eq!(cell.get_pixel(15, 15)[0], 13);
        assert_eq!(atlas.hotspot(CursorShape::PointingHand), (13, 0));
    }

    #[test]
    fn test_hotspot_count_mismatch() {
        let err = CursorAtlas::new(atlas_image(8, 16), 8, hotspots(21)).unwrap_err();
        assert_eq!(err.to_string(), "cursor atlas has 21 hot spots, expected 22");

        assert!(CursorAtlas::new(atlas_image(8, 16), 8, hotspots(23)).is_err());
        assert!(CursorAtlas::new(atlas_image(8, 16), 0, hotspots(22)).is_err());
    }

    #[test]
    fn test_load_manifest() {
        let dir = std::env::temp_dir().join(format!("eglfs-kms-atlas-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        atlas_image(11, 8).save(dir.join("atlas.png")).unwrap();

        let spots = hotspots(22)
            .iter()
            .map(|&(x, y)| format!("[{x}, {y}]"))
            .collect::<Vec<_>>()
            .join(", ");
        let manifest = dir.join("atlas.json");
        fs::write(
            &manifest,
            format!(r#"{{"image": "atlas.png", "cursorsPerRow": 11, "hotSpots": [{spots}]}}"#),
        )
        .unwrap();

        let atlas = CursorAtlas::load(&manifest).unwrap();
        assert_eq!(atlas.cell_size(), (8, 8));
        assert_eq!(atlas.crop(CursorShape::SplitV).get_pixel(3, 3)[0], 11);

        let missing = CursorAtlas::load(&dir.join("nope.json")).unwrap_err();
        assert!(format!("{missing:#}").contains("error reading cursor atlas"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_target_local() {
        let target = CursorTarget::new(CrtcId(1), "HDMI1", (1920, 0), (1280, 1024));
        assert_eq!(target.local((1920, 0)), Some((0, 0)));
        assert_eq!(target.local((2000, 500)), Some((80, 500)));
        assert_eq!(target.local((1919, 0)), None);
        assert_eq!(target.local((3200, 0)), None);
        assert_eq!(target.local((2000, 1024)), None);
    }
}
