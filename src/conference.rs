//! Conference state and the global dominant speaker decision procedure.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::speaker::Speaker;

/// Threshold of the relative speech activity in the immediate interval that
/// a challenger must exceed to unseat the dominant speaker.
const C1: f64 = 3.0;

/// Threshold of the relative speech activity in the medium interval. Also
/// the floor of the tie-break among multiple eligible challengers.
const C2: f64 = 2.0;

/// Threshold of the relative speech activity in the long interval.
const C3: f64 = 0.0;

/// Cadence of the global decision, in milliseconds.
const DECISION_INTERVAL: u64 = 300;

/// Input silence after which the decision maker stands down. Re-arming on
/// the next level report is cheap, so the interval is short.
const DECISION_MAKER_IDLE_TIMEOUT: u64 = 15_000;

/// Time without a level report after which a speaker is presumed silent for
/// a frame. Chosen above the common RTP packet durations of 20 ms and 30 ms
/// so that the fade-out stays non-aggressive.
const LEVEL_IDLE_TIMEOUT: u64 = 40;

/// Time without a level report after which a non-dominant speaker is removed
/// from the conference.
const SPEAKER_IDLE_TIMEOUT: u64 = 60 * 60 * 1000;

/// Identifies an observer registered with [`Conference::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(Option<u32>) + Send + Sync>;

/// Dominant speaker identification engine for one multipoint conference.
///
/// Audio level reports enter through [`Conference::level_changed`]; a
/// background decision maker re-evaluates every speaker's activity scores on
/// a 300 ms cadence and notifies the registered observers whenever the
/// dominant speaker changes. The decision maker stands down after 15 s
/// without input and is re-armed by the next level report.
pub struct Conference {
    /// Anchor of the conference-relative millisecond clock. A stored
    /// timestamp of 0 means "never".
    epoch: Instant,
    state: Mutex<State>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer_id: AtomicU64,
    /// Handed to decision maker threads so they never keep the conference
    /// alive.
    weak_self: Weak<Conference>,
    /// Cleared by the test suite, which drives decision ticks directly.
    spawn_decision_makers: bool,
}

struct State {
    speakers: HashMap<u32, Arc<Speaker>>,
    dominant_ssrc: Option<u32>,
    /// Time of the most recent level report from any speaker.
    last_level_changed_time: u64,
    /// Time at which the last global decision iteration began.
    last_decision_time: u64,
    /// Time of the most recent idle-level sweep.
    last_level_idle_time: u64,
    /// Generation of the decision maker currently associated with this
    /// conference, if one is running.
    decision_maker: Option<u64>,
    decision_maker_seq: u64,
}

impl Conference {
    /// Creates a new conference engine.
    pub fn new() -> Arc<Conference> {
        Conference::with_decision_makers(true)
    }

    #[cfg(test)]
    pub(crate) fn new_unscheduled() -> Arc<Conference> {
        Conference::with_decision_makers(false)
    }

    fn with_decision_makers(spawn: bool) -> Arc<Conference> {
        Arc::new_cyclic(|weak| Conference {
            epoch: Instant::now(),
            state: Mutex::new(State {
                speakers: HashMap::new(),
                dominant_ssrc: None,
                last_level_changed_time: 0,
                last_decision_time: 0,
                last_level_idle_time: 0,
                decision_maker: None,
                decision_maker_seq: 0,
            }),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
            weak_self: weak.clone(),
            spawn_decision_makers: spawn,
        })
    }

    /// Reports a new audio level for the RTP stream identified by `ssrc`.
    ///
    /// The speaker is created on its first report. Levels outside `[0, 127]`
    /// are clamped rather than rejected. Never blocks on the decision maker.
    pub fn level_changed(&self, ssrc: u32, level: i32) {
        self.level_changed_at(ssrc, level, self.now_ms());
    }

    pub(crate) fn level_changed_at(&self, ssrc: u32, level: i32, now: u64) {
        let speaker = {
            let mut state = self.state.lock();
            let speaker = match state.speakers.get(&ssrc) {
                Some(speaker) => Arc::clone(speaker),
                None => {
                    let speaker = Arc::new(Speaker::new(ssrc, now));
                    state.speakers.insert(ssrc, Arc::clone(&speaker));
                    // A new speaker makes a speaker switch likely soon.
                    self.maybe_start_decision_maker(&mut state);
                    speaker
                }
            };
            if state.last_level_changed_time < now {
                state.last_level_changed_time = now;
                self.maybe_start_decision_maker(&mut state);
            }
            speaker
        };
        // The conference lock is released before the speaker lock is taken:
        // ingress holds the conference lock only for the map lookup and the
        // timestamp bookkeeping.
        speaker.level_changed(level, now);
    }

    /// Returns the SSRC of the current dominant speaker, or `None` when no
    /// speaker dominates yet.
    pub fn get_dominant_speaker(&self) -> Option<u32> {
        self.state.lock().dominant_ssrc
    }

    /// Registers an observer invoked with the new dominant SSRC (or `None`)
    /// on every dominant speaker change.
    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(Option<u32>) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Unregisters an observer. Returns false when the id is unknown.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let len = observers.len();
        observers.retain(|(registered, _)| *registered != id);
        observers.len() < len
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Spawns a decision maker unless one is already associated or there is
    /// nothing to decide about. A failed spawn reverts the association so
    /// that the next level report retries.
    fn maybe_start_decision_maker(&self, state: &mut State) {
        if !self.spawn_decision_makers
            || state.decision_maker.is_some()
            || state.speakers.is_empty()
        {
            return;
        }
        state.decision_maker_seq += 1;
        let generation = state.decision_maker_seq;
        state.decision_maker = Some(generation);

        let conference = self.weak_self.clone();
        let spawned = thread::Builder::new()
            .name("dominant-speaker-decision".into())
            .spawn(move || run_decision_maker(conference, generation));
        match spawned {
            Ok(_) => debug!("decision maker {} started", generation),
            Err(e) => {
                warn!("failed to spawn decision maker {}: {}", generation, e);
                if state.decision_maker == Some(generation) {
                    state.decision_maker = None;
                }
            }
        }
    }

    /// Notifies this conference that the decision maker of the given
    /// generation stopped running, releasing its association.
    fn decision_maker_exited(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.decision_maker == Some(generation) {
            state.decision_maker = None;
        }
    }

    /// One iteration of the decision maker of the given generation. Returns
    /// the milliseconds to sleep before the next iteration, negative when
    /// the maker must exit.
    fn run_in_decision_maker(&self, generation: u64, now: u64) -> i64 {
        {
            let state = self.state.lock();
            // A superseded decision maker exits at once.
            if state.decision_maker != Some(generation) {
                return -1;
            }
            // Stand down once no level has arrived for a whole idle window.
            if state.last_decision_time > 0 {
                let idle = state
                    .last_decision_time
                    .saturating_sub(state.last_level_changed_time);
                if idle >= DECISION_MAKER_IDLE_TIMEOUT {
                    return -1;
                }
            }
        }
        self.decision_tick(now)
    }

    /// One decision tick: runs the idle-level sweep and the global decision
    /// when they are due and computes the time until the next tick.
    pub(crate) fn decision_tick(&self, now: u64) -> i64 {
        let mut sleep: i64 = 0;
        let mut change = None;
        {
            let mut state = self.state.lock();

            let level_idle_timeout = LEVEL_IDLE_TIMEOUT as i64
                - now.saturating_sub(state.last_level_idle_time) as i64;
            if level_idle_timeout <= 0 {
                // The first tick only establishes the sweep baseline.
                if state.last_level_idle_time != 0 {
                    state.timeout_idle_levels(now);
                }
                state.last_level_idle_time = now;
            } else {
                sleep = level_idle_timeout;
            }

            let mut decision_timeout =
                DECISION_INTERVAL as i64 - now.saturating_sub(state.last_decision_time) as i64;
            if decision_timeout <= 0 {
                // The decision may take a while: its start marks the
                // decision time and the residual is re-measured afterwards.
                state.last_decision_time = now;
                change = state.make_decision();
                decision_timeout =
                    DECISION_INTERVAL as i64 - self.now_ms().saturating_sub(now) as i64;
            }
            if decision_timeout > 0 && sleep > decision_timeout {
                sleep = decision_timeout;
            }
        }
        if let Some(new_dominant) = change {
            self.fire_dominant_speaker_changed(new_dominant);
        }
        sleep
    }

    /// Invokes every registered observer, outside all locks.
    fn fire_dominant_speaker_changed(&self, new_dominant: Option<u32>) {
        debug!("dominant speaker changed: {:?}", new_dominant);
        let observers: Vec<Observer> = {
            let observers = self.observers.lock();
            observers
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect()
        };
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(new_dominant))).is_err() {
                info!("dominant speaker observer panicked");
            }
        }
    }
}

impl State {
    /// Applies the global decision rule of the Volfin-Cohen algorithm.
    /// Returns the new dominant SSRC when the dominant speaker changed,
    /// `None` when it is unchanged.
    fn make_decision(&mut self) -> Option<Option<u32>> {
        let new_dominant = if self.speakers.is_empty() {
            // An emptied conference has no dominant speaker.
            None
        } else if self.speakers.len() == 1 {
            self.speakers.keys().next().copied()
        } else {
            let incumbent = self
                .dominant_ssrc
                .and_then(|ssrc| self.speakers.get(&ssrc).map(|s| (ssrc, Arc::clone(s))));
            // With no incumbent, nominate an arbitrary speaker and let the
            // rest compete with it.
            let (mut winner, incumbent) = match incumbent {
                Some((ssrc, speaker)) => (ssrc, speaker),
                None => {
                    let (&ssrc, speaker) =
                        self.speakers.iter().next().expect("speakers is non-empty");
                    (ssrc, Arc::clone(speaker))
                }
            };

            let incumbent_scores = incumbent.evaluate_speech_activity_scores();
            // Eligible challengers compete among themselves by their
            // relative speech activity in the medium interval.
            let mut best_c2 = C2;

            for (&ssrc, speaker) in &self.speakers {
                if Arc::ptr_eq(speaker, &incumbent) {
                    continue;
                }
                let scores = speaker.evaluate_speech_activity_scores();
                let c1 = (scores[0] / incumbent_scores[0]).ln();
                let c2 = (scores[1] / incumbent_scores[1]).ln();
                let c3 = (scores[2] / incumbent_scores[2]).ln();
                if c1 > C1 && c2 > C2 && c3 > C3 && c2 > best_c2 {
                    best_c2 = c2;
                    winner = ssrc;
                }
            }
            Some(winner)
        };

        if new_dominant != self.dominant_ssrc {
            self.dominant_ssrc = new_dominant;
            Some(new_dominant)
        } else {
            None
        }
    }

    /// Injects a fade-out silence sample into every speaker idle past
    /// [`LEVEL_IDLE_TIMEOUT`] and evicts non-dominant speakers idle past
    /// [`SPEAKER_IDLE_TIMEOUT`].
    fn timeout_idle_levels(&mut self, now: u64) {
        let dominant_ssrc = self.dominant_ssrc;
        self.speakers.retain(|_, speaker| {
            let idle = now.saturating_sub(speaker.last_level_changed_time());
            if idle > SPEAKER_IDLE_TIMEOUT && dominant_ssrc != Some(speaker.ssrc()) {
                debug!("evicting idle speaker {}", speaker.ssrc());
                return false;
            }
            if idle > LEVEL_IDLE_TIMEOUT {
                speaker.level_timed_out();
            }
            true
        });
    }
}

/// Body of a decision maker thread. Only a weak reference is held between
/// iterations: a dropped conference is observed at the next wake-up and ends
/// the loop.
fn run_decision_maker(conference: Weak<Conference>, generation: u64) {
    loop {
        let sleep = match conference.upgrade() {
            Some(conference) => {
                let now = conference.now_ms();
                conference.run_in_decision_maker(generation, now)
            }
            None => break,
        };
        if sleep < 0 {
            break;
        }
        if sleep > 0 {
            thread::sleep(Duration::from_millis(sleep as u64));
        }
    }
    if let Some(conference) = conference.upgrade() {
        conference.decision_maker_exited(generation);
    }
    debug!("decision maker {} exited", generation);
}

#[cfg(test)]
impl Conference {
    pub(crate) fn speaker(&self, ssrc: u32) -> Option<Arc<Speaker>> {
        self.state.lock().speakers.get(&ssrc).cloned()
    }

    pub(crate) fn speaker_count(&self) -> usize {
        self.state.lock().speakers.len()
    }
}
