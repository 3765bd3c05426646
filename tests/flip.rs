//! Surface, framebuffer and page-flip pipeline against the mock card

use eglfs_kms::backend::kms::screen::ScreenState;
use eglfs_kms::backend::kms::types::{ConnectorKind, ConnectorState, PowerState};
use eglfs_kms::testing::{mode, preferred_mode, Call, Fixture, MockCard};
use eglfs_kms::{Config, DeviceIntegration, ScreenId};

/// One 1920x1080 HDMI screen with a DPMS property.
fn setup(config: Config) -> Fixture {
    let card = MockCard::new();
    card.add_crtc();
    let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b1);
    card.add_mode(hdmi, preferred_mode(1920, 1080, 60));
    card.add_dpms(hdmi);

    let mut fixture = Fixture::new(card, config);
    fixture.init().unwrap();
    assert_eq!(fixture.screen_count(), 1);
    fixture
}

fn is_modeset(call: &Call) -> bool {
    matches!(call, Call::SetCrtc { framebuffer: Some(_), .. })
}

#[test]
fn test_native_window_created_once() {
    let mut fixture = setup(Config::default());
    assert_eq!(fixture.screen(0).state(), ScreenState::NoSurface);

    let first = fixture.kms.create_native_window(ScreenId(0)).unwrap();
    let second = fixture.kms.create_native_window(ScreenId(0)).unwrap();
    assert_eq!(first, second);
    assert!(!first.as_ptr().is_null());
    assert_eq!(fixture.screen(0).state(), ScreenState::SurfaceCreated);

    let created = Call::CreateSurface {
        width: 1920,
        height: 1080,
    };
    assert_eq!(fixture.card.count_calls(|c| *c == created), 1);

    assert!(fixture.kms.create_native_window(ScreenId(7)).is_err());
}

/// After completion `current` is the old `next` and the previous `current`
/// went back to the surface exactly once
#[test]
fn test_flip_round_trip() {
    let mut fixture = setup(Config::default());

    fixture.present(0).unwrap();
    assert_eq!(fixture.screen(0).state(), ScreenState::FlipPending);
    let first = fixture.screen(0).next_buffer().unwrap();
    assert_eq!(fixture.screen(0).current_buffer(), None);

    fixture.complete_flip(0);
    assert_eq!(fixture.screen(0).state(), ScreenState::Idle);
    assert_eq!(fixture.screen(0).current_buffer(), Some(first));
    assert_eq!(fixture.screen(0).next_buffer(), None);

    fixture.present(0).unwrap();
    let second = fixture.screen(0).next_buffer().unwrap();
    assert_ne!(first, second);
    // Still on screen until the flip completes.
    assert_eq!(fixture.card.count_calls(|c| *c == Call::ReleaseBuffer(first)), 0);

    fixture.complete_flip(0);
    assert_eq!(fixture.screen(0).current_buffer(), Some(second));
    assert_eq!(fixture.card.count_calls(|c| *c == Call::ReleaseBuffer(first)), 1);
    assert_eq!(fixture.card.count_calls(|c| *c == Call::ReleaseBuffer(second)), 0);
    assert_eq!(fixture.card.locked_buffers(), 1);
}

/// The swap chain cycles and framebuffers are reused per buffer
#[test]
fn test_framebuffers_cached_per_buffer() {
    let mut fixture = setup(Config::default());

    for _ in 0..6 {
        fixture.present(0).unwrap();
        fixture.complete_flip(0);
    }

    assert_eq!(fixture.screen(0).framebuffer_count(), 3);
    assert_eq!(
        fixture.card.count_calls(|c| matches!(c, Call::AddFramebuffer { .. })),
        3
    );
    assert_eq!(fixture.card.count_calls(|c| matches!(c, Call::PageFlip { .. })), 6);
    assert_eq!(fixture.card.count_calls(is_modeset), 1);
}

#[test]
fn test_first_flip_sets_mode_and_power() {
    let mut fixture = setup(Config::default());
    fixture.present(0).unwrap();

    let crtc = fixture.screen(0).crtc();
    let live = fixture.card.crtc_now(crtc);
    assert_eq!(live.mode.as_ref(), Some(fixture.screen(0).mode()));
    assert!(fixture.screen(0).is_mode_set());

    let modeset = fixture.card.calls().iter().position(is_modeset).unwrap();
    let flip = fixture
        .card
        .calls()
        .iter()
        .position(|c| matches!(c, Call::PageFlip { .. }))
        .unwrap();
    assert!(modeset < flip);

    let dpms_on = fixture
        .card
        .count_calls(|c| matches!(c, Call::SetProperty { value: 0, .. }));
    assert_eq!(dpms_on, 1);
}

/// A CRTC already showing the selected mode is not modeset again
#[test]
fn test_mode_already_set_skipped() {
    let card = MockCard::new();
    let crtc = card.add_crtc();
    let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b1);
    card.add_mode(hdmi, preferred_mode(1920, 1080, 60));
    card.route(hdmi, crtc, Some(preferred_mode(1920, 1080, 60)));

    let mut fixture = Fixture::new(card.clone(), Config::default());
    fixture.init().unwrap();
    fixture.present(0).unwrap();
    assert!(fixture.screen(0).is_mode_set());
    assert_eq!(card.count_calls(is_modeset), 0);
    drop(fixture);

    card.clear_calls();
    let config = Config {
        always_set_mode: true,
        ..Config::default()
    };
    let mut fixture = Fixture::new(card.clone(), config);
    fixture.init().unwrap();
    fixture.present(0).unwrap();
    assert_eq!(card.count_calls(is_modeset), 1);
}

#[test]
fn test_wait_without_pending_flip_does_not_block() {
    let mut fixture = setup(Config::default());
    fixture.kms.create_native_window(ScreenId(0)).unwrap();
    fixture.card.clear_calls();

    fixture.kms.wait_for_vsync(ScreenId(0));
    assert_eq!(fixture.card.count_calls(|c| *c == Call::WaitReadable), 0);
    assert!(fixture.card.calls().is_empty());
}

#[test]
fn test_wait_for_vsync_completes_flip() {
    let mut fixture = setup(Config::default());
    fixture.card.set_auto_complete_flips(true);

    fixture.present(0).unwrap();
    assert!(fixture.screen(0).is_flip_pending());
    assert_eq!(fixture.card.pending_events(), 1);

    fixture.kms.wait_for_vsync(ScreenId(0));
    assert!(!fixture.screen(0).is_flip_pending());
    assert_eq!(fixture.card.pending_events(), 0);
}

/// A flip that never completes times out and stays pending
#[test]
fn test_wait_for_vsync_times_out() {
    let config = Config {
        flip_timeout_ms: 5,
        ..Config::default()
    };
    let mut fixture = setup(config);
    fixture.present(0).unwrap();

    fixture.kms.wait_for_vsync(ScreenId(0));
    assert!(fixture.screen(0).is_flip_pending());
    assert_eq!(fixture.card.count_calls(|c| *c == Call::WaitReadable), 1);
}

/// A failed flip drops the frame and gives the buffer straight back
#[test]
fn test_page_flip_failure_releases_buffer() {
    let mut fixture = setup(Config::default());
    fixture.card.set_fail_page_flip(true);

    fixture.present(0).unwrap();
    assert!(!fixture.screen(0).is_flip_pending());
    assert_eq!(fixture.card.locked_buffers(), 0);
    assert_eq!(
        fixture.card.count_calls(|c| matches!(c, Call::ReleaseBuffer(_))),
        1
    );

    // The next frame starts fresh.
    fixture.card.set_fail_page_flip(false);
    fixture.present(0).unwrap();
    assert!(fixture.screen(0).is_flip_pending());
}

#[test]
fn test_second_flip_while_pending_is_dropped() {
    let mut fixture = setup(Config::default());
    fixture.present(0).unwrap();
    let pending = fixture.screen(0).next_buffer();

    fixture.present(0).unwrap();
    assert_eq!(fixture.screen(0).next_buffer(), pending);
    // Checked before locking, so nothing was taken from the surface.
    assert_eq!(
        fixture.card.count_calls(|c| matches!(c, Call::LockFrontBuffer(_))),
        1
    );
    assert_eq!(
        fixture.card.count_calls(|c| matches!(c, Call::ReleaseBuffer(_))),
        0
    );
    assert_eq!(fixture.card.count_calls(|c| matches!(c, Call::PageFlip { .. })), 1);
    assert_eq!(fixture.card.locked_buffers(), 1);
}

#[test]
fn test_lock_failure_is_error() {
    let mut fixture = setup(Config::default());
    fixture.card.set_fail_lock(true);

    let err = fixture.present(0).unwrap_err();
    assert!(format!("{err:#}").contains("could not lock GBM surface front buffer"));
}

#[test]
fn test_add_framebuffer_failure_drops_frame() {
    let mut fixture = setup(Config::default());
    fixture.card.set_fail_add_framebuffer(true);

    fixture.present(0).unwrap();
    assert!(!fixture.screen(0).is_flip_pending());
    assert_eq!(fixture.card.locked_buffers(), 0);
    assert_eq!(fixture.card.count_calls(|c| matches!(c, Call::PageFlip { .. })), 0);
}

#[test]
fn test_flip_without_surface_is_ignored() {
    let mut fixture = setup(Config::default());
    fixture.kms.present_buffer(ScreenId(0)).unwrap();
    assert_eq!(fixture.card.count_calls(|c| matches!(c, Call::PageFlip { .. })), 0);
    assert_eq!(fixture.screen(0).state(), ScreenState::NoSurface);
}

/// Destroying the surface removes every cached framebuffer exactly once
#[test]
fn test_destroy_surface_removes_framebuffers_once() {
    let mut fixture = setup(Config::default());
    for _ in 0..2 {
        fixture.present(0).unwrap();
        fixture.complete_flip(0);
    }
    assert_eq!(fixture.card.live_framebuffers(), 2);

    fixture.kms.destroy_native_window(ScreenId(0));
    assert_eq!(fixture.card.live_framebuffers(), 0);
    assert_eq!(fixture.card.locked_buffers(), 0);
    assert_eq!(
        fixture.card.count_calls(|c| matches!(c, Call::RemoveFramebuffer(_))),
        2
    );
    assert_eq!(fixture.screen(0).state(), ScreenState::NoSurface);

    fixture.kms.destroy_native_window(ScreenId(0));
    assert_eq!(
        fixture.card.count_calls(|c| matches!(c, Call::RemoveFramebuffer(_))),
        2
    );
}

/// A window created again after a destroy gets its mode set again and
/// keeps flipping
#[test]
fn test_recreated_window_sets_mode_again() {
    let mut fixture = setup(Config::default());
    let crtc = fixture.screen(0).crtc();
    fixture.present(0).unwrap();
    fixture.complete_flip(0);

    fixture.kms.destroy_native_window(ScreenId(0));
    assert!(!fixture.screen(0).is_mode_set());
    assert_eq!(fixture.card.crtc_now(crtc).framebuffer, None);

    fixture.card.clear_calls();
    fixture.present(0).unwrap();
    assert_eq!(fixture.card.count_calls(is_modeset), 1);
    assert!(fixture.screen(0).is_mode_set());
    assert_eq!(fixture.screen(0).state(), ScreenState::FlipPending);

    fixture.complete_flip(0);
    fixture.present(0).unwrap();
    assert_eq!(fixture.screen(0).state(), ScreenState::FlipPending);
    assert_eq!(fixture.card.count_calls(is_modeset), 1);
}

/// Restoring twice only touches the CRTC once
#[test]
fn test_restore_mode_twice_is_noop() {
    let mut fixture = setup(Config::default());
    let crtc = fixture.screen(0).crtc();
    fixture.present(0).unwrap();
    fixture.complete_flip(0);
    fixture.card.clear_calls();

    fixture.kms.suspend();
    assert!(!fixture.screen(0).is_mode_set());
    let blank = Call::SetCrtc {
        crtc,
        framebuffer: None,
        connectors: vec![],
        mode: None,
    };
    assert_eq!(fixture.card.count_calls(|c| *c == blank), 1);

    fixture.kms.suspend();
    assert_eq!(fixture.card.count_calls(|c| matches!(c, Call::SetCrtc { .. })), 1);

    // Back from the VT switch the next frame sets the mode again.
    fixture.kms.resume();
    fixture.present(0).unwrap();
    assert!(fixture.screen(0).is_mode_set());
    assert_eq!(fixture.card.count_calls(is_modeset), 1);
}

/// Teardown puts the console's CRTC back before removing our framebuffers
#[test]
fn test_teardown_restores_original_crtc() {
    let card = MockCard::new();
    let crtc = card.add_crtc();
    let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b1);
    card.add_mode(hdmi, preferred_mode(1920, 1080, 60));
    card.route(hdmi, crtc, Some(mode(1280, 720, 60)));
    let console = card.crtc_now(crtc);

    let mut fixture = Fixture::new(card.clone(), Config::default());
    fixture.init().unwrap();
    fixture.present(0).unwrap();
    fixture.complete_flip(0);
    card.clear_calls();
    drop(fixture);

    let restore = Call::SetCrtc {
        crtc,
        framebuffer: console.framebuffer,
        connectors: vec![hdmi],
        mode: console.mode.clone(),
    };
    let calls = card.calls();
    let restored = calls.iter().position(|c| *c == restore).unwrap();
    let removed = calls
        .iter()
        .position(|c| matches!(c, Call::RemoveFramebuffer(_)))
        .unwrap();
    assert!(restored < removed);
    assert_eq!(card.crtc_now(crtc), console);
    assert_eq!(card.live_framebuffers(), 0);
    assert_eq!(card.locked_buffers(), 0);
}

#[test]
fn test_power_state() {
    let mut fixture = setup(Config::default());
    let connector = fixture.screen(0).connector();

    fixture.kms.set_power_state(ScreenId(0), PowerState::Off).unwrap();
    assert_eq!(fixture.screen(0).power_state(), PowerState::Off);
    let dpms = fixture.screen(0).output().dpms_property.unwrap();
    assert_eq!(fixture.card.property_value(connector, dpms), Some(3));
}

/// Without a DPMS property power changes do nothing
#[test]
fn test_power_state_without_dpms() {
    let card = MockCard::new();
    card.add_crtc();
    let hdmi = card.add_connector(ConnectorKind::HdmiA, 1, ConnectorState::Connected, 0b1);
    card.add_mode(hdmi, preferred_mode(1920, 1080, 60));

    let mut fixture = Fixture::new(card.clone(), Config::default());
    fixture.init().unwrap();
    assert_eq!(fixture.screen(0).output().dpms_property, None);

    fixture.kms.set_power_state(ScreenId(0), PowerState::Standby).unwrap();
    fixture.present(0).unwrap();
    assert_eq!(fixture.screen(0).power_state(), PowerState::On);
    assert_eq!(card.count_calls(|c| matches!(c, Call::SetProperty { .. })), 0);
}
