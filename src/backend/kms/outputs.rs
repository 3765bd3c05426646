//! Connector resolution
//!
//! Walks the card's connectors once, applies per-output configuration,
//! picks a CRTC and a mode for each usable display and lays the resulting
//! screens out in a virtual desktop.

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::card::Card;
use super::device::KmsDevice;
use super::helpers::{connector_name, select_mode};
use super::screen::KmsScreen;
use super::types::{
    ConnectorId, ConnectorInfo, ConnectorState, CrtcId, CrtcState, ModeInfo, PropertyId,
    Resources, Subpixel,
};
use crate::config::{Config, ModeSetting, VirtualDesktopLayout};

/// Everything resolved about one display. Never changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDescriptor {
    pub name: String,
    pub connector_id: ConnectorId,
    pub crtc_id: CrtcId,
    /// Index into the card's CRTC list.
    pub crtc_index: usize,
    pub physical_size_mm: (u32, u32),
    /// Index of the selected mode in `modes`.
    pub mode: usize,
    pub preferred_mode: usize,
    pub modes: Vec<ModeInfo>,
    /// CRTC state before takeover, put back on teardown.
    pub saved_crtc: Option<CrtcState>,
    pub subpixel: Subpixel,
    pub dpms_property: Option<PropertyId>,
}

impl OutputDescriptor {
    pub fn selected_mode(&self) -> &ModeInfo {
        &self.modes[self.mode]
    }
}

/// Who owns the hardware cursor once screens exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CursorTopology {
    /// One overlay mirrored on every screen of the virtual desktop.
    SharedCursorAcrossOutputs,
    /// Each screen gets its own overlay on first use.
    IndependentCursorPerOutput,
}

/// Output plus the layout hints from its configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOutput {
    pub descriptor: OutputDescriptor,
    /// Sort key; unconfigured outputs keep connector order at the end.
    pub virtual_index: i32,
    pub virtual_pos: Option<(i32, i32)>,
    pub primary: bool,
}

pub struct ScreenLayout<C: Card> {
    pub screens: Vec<KmsScreen<C>>,
    pub topology: CursorTopology,
}

/// Resolve one connector, reserving its CRTC on success.
///
/// `None` means the connector gets no screen: it is off, skipped,
/// disconnected, has no free CRTC or has no usable mode.
pub fn screen_for_connector<C: Card>(
    device: &mut KmsDevice<C>,
    config: &Config,
    resources: &Resources,
    connector_index: usize,
    connector: &ConnectorInfo,
) -> Option<ResolvedOutput> {
    let name = connector_name(connector.kind, connector.kind_index);

    let Some(crtc_index) = device.crtc_for_connector(resources, connector) else {
        warn!("No usable crtc/encoder pair for connector {name}");
        return None;
    };
    let crtc_id = resources.crtcs[crtc_index];

    let output_config = config.output(&name);
    let setting = match output_config.and_then(|o| o.mode.as_deref()) {
        None => ModeSetting::Preferred,
        Some(mode) => mode.parse().unwrap_or_else(|err| {
            warn!("Invalid mode {mode:?} for output {name}: {err:#}");
            ModeSetting::Preferred
        }),
    };

    let card = device.card().ok()?;
    match setting {
        ModeSetting::Off => {
            debug!("Turning off output {name}");
            if let Err(err) = card.set_crtc(crtc_id, None, (0, 0), &[], None) {
                warn!("{name}: failed to turn off {crtc_id:?}: {err:?}");
            }
            return None;
        }
        ModeSetting::Skip => {
            debug!("Skipping output {name}");
            return None;
        }
        ModeSetting::Preferred if connector.state == ConnectorState::Disconnected => {
            debug!("Skipping disconnected output {name}");
            return None;
        }
        _ => (),
    }

    // What the connector shows right now, through whatever CRTC drives it.
    let live_mode = connector
        .current_encoder
        .and_then(|encoder| card.encoder(encoder).ok())
        .and_then(|encoder| encoder.crtc)
        .and_then(|crtc| card.crtc(crtc).ok())
        .and_then(|crtc| crtc.mode);

    debug!(
        "{name}: {} modes, crtc index {crtc_index}, {crtc_id:?}",
        connector.modes.len()
    );
    for (i, mode) in connector.modes.iter().enumerate() {
        debug!("{name}: mode {i} {mode}");
    }

    let selection = select_mode(&connector.modes, live_mode.as_ref(), &setting);
    let Some(selected) = selection.selected else {
        warn!("No modes available for output {name}");
        return None;
    };
    info!(
        "Selected mode {selected}: {} for output {name}",
        selection.modes[selected]
    );

    let saved_crtc = match card.crtc(crtc_id) {
        Ok(crtc) => Some(crtc),
        Err(err) => {
            warn!("{name}: failed to read {crtc_id:?}: {err:?}");
            None
        }
    };

    let physical_size_mm = match output_config {
        Some(o) => (
            o.physical_width.unwrap_or(connector.physical_size_mm.0),
            o.physical_height.unwrap_or(connector.physical_size_mm.1),
        ),
        None => connector.physical_size_mm,
    };

    let dpms_property = card.connector_property(connector.id, "DPMS");
    if dpms_property.is_none() {
        debug!("{name}: no DPMS property");
    }

    device.reserve(crtc_index, connector_index);

    Some(ResolvedOutput {
        descriptor: OutputDescriptor {
            name,
            connector_id: connector.id,
            crtc_id,
            crtc_index,
            physical_size_mm,
            mode: selected,
            preferred_mode: selection.preferred.unwrap_or(selected),
            modes: selection.modes,
            saved_crtc,
            subpixel: connector.subpixel,
            dpms_property,
        },
        virtual_index: output_config.and_then(|o| o.virtual_index).unwrap_or(i32::MAX),
        virtual_pos: output_config.and_then(|o| o.virtual_pos()),
        primary: output_config.is_some_and(|o| o.primary),
    })
}

/// Resolve every connector and build the screens.
pub fn create_screens<C: Card>(
    device: &mut KmsDevice<C>,
    config: &Config,
) -> anyhow::Result<ScreenLayout<C>> {
    let resources = device
        .card()?
        .resources()
        .context("error getting DRM resources")?;

    let mut outputs = Vec::new();
    for (i, &id) in resources.connectors.iter().enumerate() {
        let connector = match device.card()?.connector(id) {
            Ok(connector) => connector,
            Err(err) => {
                warn!("Failed to get connector {id:?}: {err:?}");
                continue;
            }
        };

        if let Some(output) = screen_for_connector(device, config, &resources, i, &connector) {
            outputs.push(output);
        }
    }

    // Stable, so outputs without an index keep connector order.
    outputs.sort_by_key(|output| output.virtual_index);

    let topology = if config.separate_screens {
        CursorTopology::IndependentCursorPerOutput
    } else {
        CursorTopology::SharedCursorAcrossOutputs
    };

    let mut next_pos = (0, 0);
    let screens = outputs
        .into_iter()
        .map(|output| {
            let (width, height) = output.descriptor.selected_mode().size();
            let position = match (topology, output.virtual_pos) {
                (CursorTopology::IndependentCursorPerOutput, _) => (0, 0),
                (CursorTopology::SharedCursorAcrossOutputs, Some(pos)) => pos,
                (CursorTopology::SharedCursorAcrossOutputs, None) => {
                    let pos = next_pos;
                    match config.virtual_desktop_layout {
                        VirtualDesktopLayout::Horizontal => next_pos.0 += width as i32,
                        VirtualDesktopLayout::Vertical => next_pos.1 += height as i32,
                    }
                    pos
                }
            };

            info!(
                "Adding screen {} at {position:?}, {width}x{height}, primary: {}",
                output.descriptor.name, output.primary
            );
            KmsScreen::new(
                output.descriptor,
                position,
                output.primary,
                config.always_set_mode,
            )
        })
        .collect();

    Ok(ScreenLayout { screens, topology })
}
