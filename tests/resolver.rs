//! Connector resolution and layout against the mock card

use eglfs_kms::backend::kms::outputs::CursorTopology;
use eglfs_kms::backend::kms::types::{ConnectorKind, ConnectorState, ModeInfo};
use eglfs_kms::testing::{mode, preferred_mode, Call, Fixture, MockCard};
use eglfs_kms::ScreenId;
use insta::assert_snapshot;

/// One CRTC and one connected HDMI connector with the given modes.
fn hdmi_card(modes: &[ModeInfo]) -> MockCard {
    let card = MockCard::new();
    card.add_crtc();
    let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b1);
    for m in modes {
        card.add_mode(hdmi, m.clone());
    }
    card
}

fn init(card: MockCard, json: &str) -> Fixture {
    let mut fixture = Fixture::with_json(card, json).unwrap();
    fixture.init().unwrap();
    fixture
}

/// An output configured off gets no screen and its CRTC is blanked once
#[test]
fn test_off_blanks_crtc_once() {
    let card = hdmi_card(&[preferred_mode(1920, 1080, 60)]);
    let crtc = card.resources_now().crtcs[0];

    let fixture = init(
        card.clone(),
        r#"{"outputs": [{"name": "HDMI1", "mode": "off"}]}"#,
    );
    assert_eq!(fixture.screen_count(), 0);

    let blank = Call::SetCrtc {
        crtc,
        framebuffer: None,
        connectors: vec![],
        mode: None,
    };
    assert_eq!(card.count_calls(|c| *c == blank), 1);
    assert_eq!(card.count_calls(|c| matches!(c, Call::SetCrtc { .. })), 1);
}

/// An explicit size wins over the driver-preferred mode
#[test]
fn test_configured_size_selects_index() {
    let card = hdmi_card(&[
        preferred_mode(3840, 2160, 60),
        mode(2560, 1440, 60),
        mode(1920, 1080, 60),
    ]);

    let fixture = init(card, r#"{"outputs": [{"name": "HDMI1", "mode": "1920x1080"}]}"#);
    let output = fixture.screen(0).output();
    assert_eq!(output.name, "HDMI1");
    assert_eq!(output.mode, 2);
    assert_eq!(output.preferred_mode, 0);
    assert_snapshot!(fixture.screen(0).mode().to_string(), @"1920x1080@60");
}

#[test]
fn test_configured_refresh() {
    let card = hdmi_card(&[
        preferred_mode(1920, 1080, 60),
        mode(1920, 1080, 50),
        mode(1920, 1080, 30),
    ]);

    let fixture = init(card, r#"{"outputs": [{"name": "HDMI1", "mode": "1920x1080@30"}]}"#);
    assert_eq!(fixture.screen(0).output().mode, 2);
    assert_eq!(fixture.screen(0).refresh_rate(), 30);
}

/// Without configuration the preferred mode beats whatever the console shows
#[test]
fn test_preferred_over_current() {
    let card = hdmi_card(&[mode(1920, 1080, 60), preferred_mode(2560, 1440, 60)]);
    let res = card.resources_now();
    card.route(res.connectors[0], res.crtcs[0], Some(mode(1920, 1080, 60)));

    let fixture = init(card, "{}");
    assert_eq!(fixture.screen(0).output().mode, 1);
    assert_eq!(fixture.screen(0).geometry().width, 2560);
}

#[test]
fn test_current_keeps_live_mode() {
    let card = hdmi_card(&[mode(1920, 1080, 60), preferred_mode(2560, 1440, 60)]);
    let res = card.resources_now();
    card.route(res.connectors[0], res.crtcs[0], Some(mode(1920, 1080, 60)));

    let fixture = init(card, r#"{"outputs": [{"name": "HDMI1", "mode": "current"}]}"#);
    assert_eq!(fixture.screen(0).output().mode, 0);
}

/// A live mode missing from the list is appended and used
#[test]
fn test_current_synthesizes_live_mode() {
    let card = hdmi_card(&[preferred_mode(1920, 1080, 60)]);
    let res = card.resources_now();
    card.route(res.connectors[0], res.crtcs[0], Some(mode(1280, 720, 60)));

    let fixture = init(card, r#"{"outputs": [{"name": "HDMI1", "mode": "current"}]}"#);
    let output = fixture.screen(0).output();
    assert_eq!(output.modes.len(), 2);
    assert_eq!(output.mode, 1);
    assert_eq!(output.selected_mode().size(), (1280, 720));
}

#[test]
fn test_modeline_appended() {
    let card = hdmi_card(&[preferred_mode(1920, 1080, 60)]);
    let fixture = init(
        card,
        r#"{"outputs": [{"name": "HDMI1",
            "mode": "148.5 1920 2008 2052 2200 1080 1084 1089 1125 +hsync +vsync"}]}"#,
    );

    let output = fixture.screen(0).output();
    assert_eq!(output.mode, 1);
    assert_snapshot!(&output.selected_mode().name, @"1920x1080@60.00");
}

#[test]
fn test_invalid_mode_falls_back_to_preferred() {
    let card = hdmi_card(&[mode(1280, 720, 60), preferred_mode(1920, 1080, 60)]);
    let fixture = init(card, r#"{"outputs": [{"name": "HDMI1", "mode": "banana"}]}"#);
    assert_eq!(fixture.screen(0).output().mode, 1);
}

#[test]
fn test_disconnected_output() {
    let card = MockCard::new();
    card.add_crtc();
    let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Disconnected, 0b1);
    card.add_mode(hdmi, preferred_mode(1920, 1080, 60));

    // Skipped when left at "preferred".
    let fixture = init(card.clone(), "{}");
    assert_eq!(fixture.screen_count(), 0);
    drop(fixture);

    // An explicit mode still drives it.
    let fixture = init(card, r#"{"outputs": [{"name": "HDMI1", "mode": "1920x1080"}]}"#);
    assert_eq!(fixture.screen_count(), 1);
}

/// "skip" ignores the connector without touching its CRTC
#[test]
fn test_skip_leaves_crtc_alone() {
    let card = hdmi_card(&[preferred_mode(1920, 1080, 60)]);
    let fixture = init(card.clone(), r#"{"outputs": [{"name": "HDMI1", "mode": "skip"}]}"#);
    assert_eq!(fixture.screen_count(), 0);
    assert_eq!(card.count_calls(|c| matches!(c, Call::SetCrtc { .. })), 0);
}

#[test]
fn test_connector_without_modes() {
    let card = hdmi_card(&[]);
    let fixture = init(card, "{}");
    assert_eq!(fixture.screen_count(), 0);
}

/// Every screen gets its own CRTC; a third connector finds none left
#[test]
fn test_crtc_allocation_monotonic() {
    let card = MockCard::new();
    card.add_crtc();
    card.add_crtc();
    for (kind, index) in [
        (ConnectorKind::HdmiA, 1),
        (ConnectorKind::DisplayPort, 1),
        (ConnectorKind::DisplayPort, 2),
    ] {
        let id = card.add_connector(kind, index, ConnectorState::Connected, 0b11);
        card.add_mode(id, preferred_mode(1920, 1080, 60));
    }

    let fixture = init(card, "{}");
    assert_snapshot!(fixture.screen_names().join(","), @"HDMI1,DP1");
    assert_ne!(fixture.screen(0).crtc(), fixture.screen(1).crtc());

    let device = fixture.kms.device().unwrap();
    assert!(device.is_crtc_allocated(0));
    assert!(device.is_crtc_allocated(1));
    assert!(device.is_connector_allocated(0));
    assert!(device.is_connector_allocated(1));
    assert!(!device.is_connector_allocated(2));
}

/// Same card and configuration resolve to the same mode every time
#[test]
fn test_resolution_idempotent() {
    let selected = || {
        let card = hdmi_card(&[
            mode(1280, 720, 60),
            preferred_mode(1920, 1080, 60),
            mode(1920, 1080, 50),
        ]);
        let fixture = init(card, r#"{"outputs": [{"name": "HDMI1", "mode": "1920x1080"}]}"#);
        let output = fixture.screen(0).output().clone();
        (output.mode, output.modes)
    };

    assert_eq!(selected(), selected());
    assert_eq!(selected().0, 1);
}

fn two_screen_card() -> MockCard {
    let card = MockCard::new();
    card.add_crtc();
    card.add_crtc();
    let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b11);
    card.add_mode(hdmi, preferred_mode(1920, 1080, 60));
    let dp = card.add_connector(ConnectorKind::DisplayPort, 1, ConnectorState::Connected, 0b11);
    card.add_mode(dp, preferred_mode(1280, 1024, 60));
    card
}

#[test]
fn test_horizontal_layout() {
    let fixture = init(two_screen_card(), "{}");
    assert_eq!(fixture.kms.topology(), CursorTopology::SharedCursorAcrossOutputs);
    assert_eq!(fixture.screen(0).position(), (0, 0));
    assert_eq!(fixture.screen(1).position(), (1920, 0));
}

#[test]
fn test_vertical_layout_with_virtual_index() {
    let fixture = init(
        two_screen_card(),
        r#"{
            "virtualDesktopLayout": "vertical",
            "outputs": [
                {"name": "HDMI1", "virtualIndex": 1},
                {"name": "DP1", "virtualIndex": 0}
            ]
        }"#,
    );
    assert_snapshot!(fixture.screen_names().join(","), @"DP1,HDMI1");
    assert_eq!(fixture.screen(0).position(), (0, 0));
    assert_eq!(fixture.screen(1).position(), (0, 1024));
}

#[test]
fn test_virtual_pos_override() {
    let fixture = init(
        two_screen_card(),
        r#"{"outputs": [{"name": "DP1", "virtualPos": "100, 2000"}]}"#,
    );
    assert_eq!(fixture.screen(0).position(), (0, 0));
    assert_eq!(fixture.screen(1).position(), (100, 2000));
}

/// Separate screens all sit at the origin and own their cursors
#[test]
fn test_separate_screens() {
    let fixture = init(two_screen_card(), r#"{"separateScreens": true}"#);
    assert_eq!(fixture.kms.topology(), CursorTopology::IndependentCursorPerOutput);
    assert_eq!(fixture.screen(0).position(), (0, 0));
    assert_eq!(fixture.screen(1).position(), (0, 0));
}

#[test]
fn test_primary_screen() {
    let fixture = init(two_screen_card(), "{}");
    assert_eq!(fixture.kms.primary_screen(), Some(ScreenId(0)));

    let fixture = init(
        two_screen_card(),
        r#"{"outputs": [{"name": "DP1", "primary": true}]}"#,
    );
    assert_eq!(fixture.kms.primary_screen(), Some(ScreenId(1)));
    assert!(fixture.screen(1).is_primary());
}

#[test]
fn test_physical_size() {
    let card = hdmi_card(&[preferred_mode(1920, 1080, 60)]);
    let hdmi = card.resources_now().connectors[0];

    // Nothing reported: estimated at 100 dpi.
    let fixture = init(card.clone(), "{}");
    let (w, h) = fixture.screen(0).physical_size_mm();
    assert!((w - 487.68).abs() < 1e-9);
    assert!((h - 274.32).abs() < 1e-9);
    let (dpi_x, dpi_y) = fixture.screen(0).logical_dpi();
    assert!((dpi_x - 100.).abs() < 1e-9);
    assert!((dpi_y - 100.).abs() < 1e-9);
    drop(fixture);

    card.set_physical_size(hdmi, (600, 340));
    let fixture = init(card.clone(), "{}");
    assert_eq!(fixture.screen(0).physical_size_mm(), (600., 340.));
    drop(fixture);

    let fixture = init(
        card,
        r#"{"outputs": [{"name": "HDMI1", "physicalWidth": 508}]}"#,
    );
    assert_eq!(fixture.screen(0).physical_size_mm(), (508., 340.));
    let (dpi_x, _) = fixture.screen(0).logical_dpi();
    assert!((dpi_x - 96.).abs() < 1e-9);
}

#[test]
fn test_screen_queries() {
    let card = hdmi_card(&[preferred_mode(1920, 1080, 0)]);
    let fixture = init(card, "{}");
    let screen = fixture.screen(0);
    assert_eq!(screen.refresh_rate(), 60);
    assert_eq!(screen.depth(), 32);
    assert!(!screen.is_mode_set());
    assert!(!screen.is_flip_pending());
    assert_eq!(screen.framebuffer_count(), 0);
}
