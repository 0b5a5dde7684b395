//! Chaos Tests for Feed Resilience
//!
//! These tests push the engine through adverse feed behavior:
//! - Feeds flapping between success and failure
//! - Subscribers that fail or panic during poll commits
//! - User actions racing the poll loop
//!
//! All timing runs on tokio's paused clock, so these stay fast.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use showstatus_core::adapters::scripted::{
    failure, ScriptedPlaybackAdapter, ScriptedShowAdapter, ScriptedSpeakerAdapter,
};
use showstatus_core::{
    determine_state_from_data, ActionController, Clock, ConnectivityState, ControllerData,
    ErrorCode, ManualClock, MemorySessionStore, PlaybackMode, Poller, ShowData, Song,
    SpeakerCoordinator, SpeakerSession, StateMachine, StatusConfig,
};

// =============================================================================
// Chaos Test Infrastructure
// =============================================================================

fn healthy_show() -> ShowData {
    ShowData {
        viewer_control_enabled: true,
        requests_enabled: true,
        available_songs: (0..5)
            .map(|i| Song {
                song_id: format!("song-{i}"),
                title: format!("Song {i}"),
                ..Song::default()
            })
            .collect(),
        ..ShowData::default()
    }
}

fn healthy_controller() -> ControllerData {
    ControllerData {
        mode: PlaybackMode::Idle,
        ..ControllerData::default()
    }
}

struct Rig {
    clock: Arc<ManualClock>,
    machine: Arc<StateMachine>,
    show: Arc<ScriptedShowAdapter>,
    playback: Arc<ScriptedPlaybackAdapter>,
    coordinator: Arc<SpeakerCoordinator>,
    poller: Arc<Poller>,
}

fn rig() -> Rig {
    let clock = ManualClock::shared(1_700_000_000_000, 20);
    let machine = Arc::new(StateMachine::new(StatusConfig::default(), clock.clone()));
    let show = Arc::new(ScriptedShowAdapter::new(clock.clone(), healthy_show()));
    let playback = Arc::new(ScriptedPlaybackAdapter::new(
        clock.clone(),
        healthy_controller(),
    ));
    let speaker = Arc::new(ScriptedSpeakerAdapter::new(
        clock.clone(),
        SpeakerSession::default(),
    ));
    let coordinator = SpeakerCoordinator::new(machine.clone(), speaker.clone());
    let poller = Poller::new(
        machine.clone(),
        show.clone(),
        playback.clone(),
        speaker,
        Some(coordinator.clone()),
    );
    Rig {
        clock,
        machine,
        show,
        playback,
        coordinator,
        poller,
    }
}

// =============================================================================
// Flapping feeds
// =============================================================================

#[tokio::test]
async fn chaos_flapping_feeds_keep_state_consistent() {
    let rig = rig();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..200 {
        let show_up = rng.gen_bool(0.6);
        let controller_up = rng.gen_bool(0.6);
        rig.show.set_show(if show_up {
            Ok(healthy_show())
        } else {
            failure(ErrorCode::Network, "timeout")
        });
        rig.playback.set_playback(if controller_up {
            Ok(healthy_controller())
        } else {
            failure(ErrorCode::Http, "503")
        });
        rig.clock.advance_ms(rng.gen_range(1_000..20_000));

        rig.poller.poll_once().await;
        let state = rig.machine.get_state();

        // Counters reset on success
        assert_eq!(state.failures.show == 0, show_up);
        assert_eq!(state.failures.controller == 0, controller_up);

        // Committed state matches a fresh derivation from the committed caches
        let expected = determine_state_from_data(
            state.show.effective(),
            state.controller.effective(),
            &state.failures,
            &rig.machine.config().thresholds,
            rig.clock.now_ms(),
        );
        assert_eq!(state.connectivity, expected);

        if state.failures.show >= 3 && state.failures.controller >= 3 {
            assert_eq!(state.connectivity, ConnectivityState::Offline);
        }
        let score = rig.machine.get_derived_state().health_score;
        assert!(score <= 100);
    }

    let history = rig.machine.get_state_history();
    assert!(history.len() <= 50);
    assert!(history.windows(2).all(|w| w[0].to_state == w[1].from_state));
}

// =============================================================================
// Misbehaving subscribers
// =============================================================================

#[tokio::test]
async fn chaos_bad_subscribers_do_not_break_polling() {
    let rig = rig();
    let healthy_calls = Arc::new(AtomicUsize::new(0));

    rig.machine.subscribe(|change| {
        if change.reason == "POLL_UPDATE" {
            panic!("renderer crashed");
        }
        Ok(())
    });
    rig.machine
        .subscribe(|_| Err(anyhow::anyhow!("template missing")));
    let calls = healthy_calls.clone();
    rig.machine.subscribe(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for _ in 0..5 {
        rig.poller.poll_once().await;
    }

    assert_eq!(rig.machine.connectivity(), ConnectivityState::Active);
    assert_eq!(rig.machine.get_state().poll_cycle, 5);
    // POLL_UPDATE + SPEAKER_UPDATE per cycle
    assert_eq!(healthy_calls.load(Ordering::SeqCst), 10);
}

// =============================================================================
// Actions racing the poll loop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn chaos_actions_during_polling() {
    let rig = rig();
    rig.show.set_request_delay(Duration::from_millis(700));
    let actions = Arc::new(ActionController::new(
        rig.machine.clone(),
        rig.show.clone(),
        rig.coordinator.clone(),
        Arc::new(MemorySessionStore::new()),
    ));

    rig.poller.start_polling();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut completed = 0;
    let mut ignored = 0;
    for round in 0..10 {
        let a = actions.clone();
        let b = actions.clone();
        let song = format!("song-{}", round % 5);
        let (first, second) = tokio::join!(a.request_song(&song), b.surprise_me());
        match first {
            Ok(outcome) if !outcome.is_ignored() => completed += 1,
            Ok(_) => ignored += 1,
            Err(e) => assert!(matches!(e.code, ErrorCode::Cooldown | ErrorCode::Unavailable)),
        }
        assert!(second.is_ok_and(|o| o.is_ignored()));
        rig.clock.advance_ms(4_000);
        tokio::time::sleep(Duration::from_secs(4)).await;
    }

    rig.poller.stop_polling();
    assert_eq!(ignored, 0);
    assert!(completed >= 5);
    assert!(!actions.is_busy());
    let visitor = rig.machine.get_state().visitor;
    assert_eq!(visitor.interaction_count as usize, completed);
}
