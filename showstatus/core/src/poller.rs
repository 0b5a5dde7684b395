//! Feed Poller
//!
//! Fetches all three feeds on a fixed period and commits the result as one
//! `POLL_UPDATE`.
//!
//! # Cycle
//!
//! 1. Call show, controller and speaker concurrently (`tokio::join!`)
//! 2. Update the per-feed failure counters and feed caches; a failing feed
//!    keeps its last good data
//! 3. Derive connectivity from the effective envelopes (last good one for a
//!    failing feed, so cached data keeps ageing)
//! 4. Commit once with reason `POLL_UPDATE`
//! 5. Hand a successful speaker payload to the [`SpeakerCoordinator`]
//!    (`SPEAKER_UPDATE`)
//!
//! A feed that goes from healthy to failing posts a short notice.
//!
//! # Usage
//!
//! ```ignore
//! let poller = Poller::new(machine, show, playback, speaker, Some(coordinator));
//! poller.start_polling();
//! // ...
//! poller.stop_polling();
//! ```
//!
//! Cycles are not sequenced against each other. With a period far above the
//! request timeout they do not overlap in practice.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::adapters::{PlaybackAdapter, ShowControlAdapter, SpeakerAdapter};
use crate::envelope::{ErrorCode, ResultEnvelope};
use crate::speaker::SpeakerCoordinator;
use crate::state::{
    determine_state_from_data, reason, Feed, StateChange, StateMachine, StatePatch,
};

struct PollTask {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PollTask {
    fn is_live(&self) -> bool {
        !self.stop.load(Ordering::SeqCst) && !self.handle.is_finished()
    }
}

/// Periodic fetch-all driver
pub struct Poller {
    machine: Arc<StateMachine>,
    show: Arc<dyn ShowControlAdapter>,
    playback: Arc<dyn PlaybackAdapter>,
    speaker: Arc<dyn SpeakerAdapter>,
    coordinator: Option<Arc<SpeakerCoordinator>>,
    task: Mutex<Option<PollTask>>,
    cycles: AtomicU64,
    weak_self: Weak<Poller>,
}

impl Poller {
    /// Create a poller; nothing runs until [`start_polling`](Self::start_polling)
    pub fn new(
        machine: Arc<StateMachine>,
        show: Arc<dyn ShowControlAdapter>,
        playback: Arc<dyn PlaybackAdapter>,
        speaker: Arc<dyn SpeakerAdapter>,
        coordinator: Option<Arc<SpeakerCoordinator>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            machine,
            show,
            playback,
            speaker,
            coordinator,
            task: Mutex::new(None),
            cycles: AtomicU64::new(0),
            weak_self: weak.clone(),
        })
    }

    /// Number of cycles started so far
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Run one fetch-all cycle and commit it
    pub async fn poll_once(&self) -> StateChange {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let (show_env, controller_env, speaker_env) = tokio::join!(
            self.show.fetch_show(),
            self.playback.fetch_playback(),
            self.speaker.fetch_speaker(),
        );

        tracing::debug!(
            cycle = cycle,
            show_ok = show_env.success,
            controller_ok = controller_env.success,
            speaker_ok = speaker_env.success,
            "Poll cycle fetched"
        );

        let speaker_session = speaker_env.data().cloned();
        let failed = [
            failed_feed(Feed::Show, &show_env),
            failed_feed(Feed::Controller, &controller_env),
            failed_feed(Feed::Speaker, &speaker_env),
        ];
        let thresholds = self.machine.config().thresholds;
        let now = self.machine.clock().now_ms();
        let mut went_down: Vec<(Feed, Option<ErrorCode>)> = Vec::new();

        let change = self.machine.update_state(reason::POLL_UPDATE, |snapshot| {
            let before = snapshot.failures;
            let mut failures = snapshot.failures;
            failures.record(Feed::Show, show_env.success);
            failures.record(Feed::Controller, controller_env.success);
            failures.record(Feed::Speaker, speaker_env.success);

            for (feed, code) in failed.into_iter().flatten() {
                if before.get(feed) == 0 {
                    went_down.push((feed, code));
                }
            }

            let mut show = snapshot.show.clone();
            show.record(show_env);
            let mut controller = snapshot.controller.clone();
            controller.record(controller_env);
            let mut speaker_feed = snapshot.speaker_feed.clone();
            speaker_feed.record(speaker_env);

            let connectivity = determine_state_from_data(
                show.effective(),
                controller.effective(),
                &failures,
                &thresholds,
                now,
            );

            StatePatch::new()
                .connectivity(connectivity)
                .show(show)
                .controller(controller)
                .speaker_feed(speaker_feed)
                .failures(failures)
                .poll_cycle(cycle)
        });

        let failures = change.snapshot.failures;
        if failures.show > 0 || failures.controller > 0 {
            tracing::warn!(
                cycle = cycle,
                show_failures = failures.show,
                controller_failures = failures.controller,
                state = %change.to,
                "Feed failures"
            );
        }

        if let Some((feed, code)) = went_down.into_iter().next() {
            self.machine
                .post_notice(code, format!("{feed} feed unavailable"));
        }

        if let Some(session) = speaker_session {
            match &self.coordinator {
                Some(coordinator) => {
                    coordinator.apply_speaker_session(session, reason::SPEAKER_UPDATE);
                }
                None => {
                    self.machine
                        .set_state(StatePatch::new().speaker(session), reason::SPEAKER_UPDATE);
                }
            }
        }

        change
    }

    /// Start polling: one cycle now, then every `poll_interval`
    ///
    /// Returns false when already running or when called outside a tokio
    /// runtime.
    pub fn start_polling(&self) -> bool {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(PollTask::is_live) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("start_polling called outside a tokio runtime");
            return false;
        };

        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let period = self.machine.config().poll_interval;
        let handle = runtime.spawn(run_polling(
            self.weak_self.clone(),
            stop.clone(),
            wake.clone(),
            period,
        ));
        tracing::info!(interval_ms = period.as_millis() as u64, "Polling started");
        *slot = Some(PollTask { stop, wake, handle });
        true
    }

    /// Stop polling; a cycle already in flight still commits
    pub fn stop_polling(&self) {
        if let Some(task) = self.task.lock().take() {
            task.stop.store(true, Ordering::SeqCst);
            task.wake.notify_one();
            tracing::info!(cycles = self.cycles(), "Polling stopped");
        }
    }

    /// Whether the recurring cycle is active
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.task.lock().as_ref().is_some_and(PollTask::is_live)
    }
}

fn failed_feed<T>(feed: Feed, envelope: &ResultEnvelope<T>) -> Option<(Feed, Option<ErrorCode>)> {
    (!envelope.success).then(|| (feed, envelope.error_code.clone()))
}

async fn run_polling(
    poller: Weak<Poller>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    period: std::time::Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = wake.notified() => {}
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Some(poller) = poller.upgrade() else {
            break;
        };
        poller.poll_once().await;
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.stop.store(true, Ordering::SeqCst);
            task.wake.notify_one();
        }
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("show", &self.show.name())
            .field("playback", &self.playback.name())
            .field("speaker", &self.speaker.name())
            .field("cycles", &self.cycles())
            .field("polling", &self.is_polling())
            .finish()
    }
}
