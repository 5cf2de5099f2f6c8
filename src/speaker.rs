//! Per-speaker sliding history and cached speech activity scores.

use parking_lot::Mutex;

use crate::score::{
    compute_bigs, speech_activity_score, IMMEDIATE_COUNT, LONG_COUNT, MAX_LEVEL, MEDIUM_COUNT,
    MIN_LEVEL, MIN_SPEECH_ACTIVITY_SCORE, N1, N1_MEDIUM_THRESHOLD, N2, N2_LONG_THRESHOLD, N3,
};

/// A speaker in a multipoint conference, identified by the synchronization
/// source identifier (SSRC) of its RTP stream.
///
/// Every accepted level report pushes a quantized sample into the immediate
/// history; the medium and long summaries and the three activity scores are
/// refreshed on demand by [`Speaker::evaluate_speech_activity_scores`]. All
/// state sits behind one mutex so that level ingress and score evaluation
/// may run on different threads.
pub(crate) struct Speaker {
    ssrc: u32,
    state: Mutex<SpeakerState>,
}

struct SpeakerState {
    immediates: [u8; IMMEDIATE_COUNT],
    mediums: [u8; MEDIUM_COUNT],
    longs: [u8; LONG_COUNT],
    immediate_score: f64,
    medium_score: f64,
    long_score: f64,
    /// Time of the last accepted level report. Reports older than this are
    /// dropped; equal timestamps must pass, [`Speaker::level_timed_out`]
    /// re-reports at the stored timestamp.
    last_level_changed_time: u64,
}

impl Speaker {
    /// Creates a speaker whose idle clock starts at `now`.
    pub(crate) fn new(ssrc: u32, now: u64) -> Self {
        Speaker {
            ssrc,
            state: Mutex::new(SpeakerState {
                immediates: [0; IMMEDIATE_COUNT],
                mediums: [0; MEDIUM_COUNT],
                longs: [0; LONG_COUNT],
                immediate_score: MIN_SPEECH_ACTIVITY_SCORE,
                medium_score: MIN_SPEECH_ACTIVITY_SCORE,
                long_score: MIN_SPEECH_ACTIVITY_SCORE,
                last_level_changed_time: now,
            }),
        }
    }

    pub(crate) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Records an audio level reported at `time` (conference-relative ms).
    /// Levels outside `[0, 127]` are clamped, late reports are dropped.
    pub(crate) fn level_changed(&self, level: i32, time: u64) {
        self.state.lock().level_changed(level, time);
    }

    /// Records a silence sample in place of a level report that never came,
    /// without advancing the speaker's idle clock.
    pub(crate) fn level_timed_out(&self) {
        let mut state = self.state.lock();
        let time = state.last_level_changed_time;
        state.level_changed(MIN_LEVEL, time);
    }

    pub(crate) fn last_level_changed_time(&self) -> u64 {
        self.state.lock().last_level_changed_time
    }

    /// Refreshes the cached scores and returns them as
    /// `[immediate, medium, long]`.
    ///
    /// The immediate score is recomputed unconditionally. The medium summary
    /// is recounted and its score recomputed only when some medium block
    /// changed; the long score likewise only when the mediums changed the
    /// longs.
    pub(crate) fn evaluate_speech_activity_scores(&self) -> [f64; 3] {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.immediate_score =
            speech_activity_score(u32::from(state.immediates[0]), N1 as u32, 0.5, 0.78);
        if compute_bigs(&state.immediates, &mut state.mediums, N1_MEDIUM_THRESHOLD) {
            state.medium_score =
                speech_activity_score(u32::from(state.mediums[0]), N2 as u32, 0.5, 24.0);
            if compute_bigs(&state.mediums, &mut state.longs, N2_LONG_THRESHOLD) {
                state.long_score =
                    speech_activity_score(u32::from(state.longs[0]), N3 as u32, 0.5, 47.0);
            }
        }

        [state.immediate_score, state.medium_score, state.long_score]
    }
}

impl SpeakerState {
    fn level_changed(&mut self, level: i32, time: u64) {
        if time < self.last_level_changed_time {
            return;
        }
        self.last_level_changed_time = time;
        self.push_level(level);
    }

    /// Shifts the immediate history one slot and stores the quantized level
    /// in slot 0.
    fn push_level(&mut self, level: i32) {
        let level = level.clamp(MIN_LEVEL, MAX_LEVEL);
        self.immediates.copy_within(..IMMEDIATE_COUNT - 1, 1);
        self.immediates[0] = (level / N1 as i32) as u8;
    }
}

#[cfg(test)]
impl Speaker {
    pub(crate) fn immediates(&self) -> [u8; IMMEDIATE_COUNT] {
        self.state.lock().immediates
    }

    pub(crate) fn mediums(&self) -> [u8; MEDIUM_COUNT] {
        self.state.lock().mediums
    }

    pub(crate) fn longs(&self) -> [u8; LONG_COUNT] {
        self.state.lock().longs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_speaker_is_silent() {
        let speaker = Speaker::new(0xAAAA, 100);
        assert_eq!(speaker.ssrc(), 0xAAAA);
        assert_eq!(speaker.last_level_changed_time(), 100);
        assert_eq!(speaker.immediates(), [0u8; IMMEDIATE_COUNT]);
        assert_eq!(
            speaker.evaluate_speech_activity_scores(),
            [MIN_SPEECH_ACTIVITY_SCORE; 3]
        );
    }

    #[test]
    fn levels_are_quantized_into_sub_bands() {
        let speaker = Speaker::new(1, 0);
        speaker.level_changed(100, 1);
        speaker.level_changed(50, 2);
        let immediates = speaker.immediates();
        assert_eq!(immediates[0], 50 / 13);
        assert_eq!(immediates[1], 100 / 13);
    }

    #[test]
    fn levels_are_clamped_to_the_supported_range() {
        let speaker = Speaker::new(1, 0);
        speaker.level_changed(-5, 1);
        assert_eq!(speaker.immediates()[0], 0);
        speaker.level_changed(500, 2);
        assert_eq!(speaker.immediates()[0], 127 / 13);
    }

    #[test]
    fn late_levels_are_dropped() {
        let speaker = Speaker::new(1, 0);
        speaker.level_changed(50, 1000);
        speaker.level_changed(100, 999);
        assert_eq!(speaker.immediates()[0], 50 / 13);
        assert_eq!(speaker.last_level_changed_time(), 1000);
    }

    #[test]
    fn equal_timestamps_are_accepted() {
        let speaker = Speaker::new(1, 0);
        speaker.level_changed(100, 1000);
        speaker.level_changed(120, 1000);
        let immediates = speaker.immediates();
        assert_eq!(immediates[0], 120 / 13);
        assert_eq!(immediates[1], 100 / 13);
    }

    #[test]
    fn timed_out_level_fades_without_advancing_time() {
        let speaker = Speaker::new(1, 0);
        speaker.level_changed(120, 1000);
        speaker.level_timed_out();
        assert_eq!(speaker.last_level_changed_time(), 1000);
        let immediates = speaker.immediates();
        assert_eq!(immediates[0], 0);
        assert_eq!(immediates[1], 120 / 13);
    }

    #[test]
    fn history_counts_match_recomputation() {
        let speaker = Speaker::new(1, 0);
        // An uneven on/off pattern across more than the whole history.
        for i in 0..80u64 {
            let level = match i % 3 {
                0 => 127,
                1 => 64,
                _ => 0,
            };
            speaker.level_changed(level, i + 1);
        }
        speaker.evaluate_speech_activity_scores();

        let immediates = speaker.immediates();
        let mediums = speaker.mediums();
        let longs = speaker.longs();
        assert!(immediates.iter().all(|&v| v <= (N1 as u8)));
        for (j, &medium) in mediums.iter().enumerate() {
            let expected = immediates[j * N2..(j + 1) * N2]
                .iter()
                .filter(|&&v| v > N1_MEDIUM_THRESHOLD)
                .count() as u8;
            assert_eq!(medium, expected);
        }
        for (k, &long) in longs.iter().enumerate() {
            let expected = mediums[k * N3..(k + 1) * N3]
                .iter()
                .filter(|&&v| v > N2_LONG_THRESHOLD)
                .count() as u8;
            assert_eq!(long, expected);
        }
    }

    #[test]
    fn scores_stay_positive() {
        let speaker = Speaker::new(1, 0);
        for i in 0..200u64 {
            let level = if i % 7 < 3 { 110 } else { 0 };
            speaker.level_changed(level, i + 1);
            let scores = speaker.evaluate_speech_activity_scores();
            assert!(scores.iter().all(|&s| s >= MIN_SPEECH_ACTIVITY_SCORE));
        }
    }

    #[test]
    fn long_score_updates_only_after_medium_blocks_change() {
        let speaker = Speaker::new(1, 0);
        // Four loud samples fill most of the freshest medium block but leave
        // it below the long threshold.
        for t in 1..=4 {
            speaker.level_changed(127, t);
        }
        let scores = speaker.evaluate_speech_activity_scores();
        assert!(scores[1] > MIN_SPEECH_ACTIVITY_SCORE);
        assert_eq!(scores[2], MIN_SPEECH_ACTIVITY_SCORE);

        // The fifth sample completes the block and cascades into the longs.
        speaker.level_changed(127, 5);
        let scores = speaker.evaluate_speech_activity_scores();
        assert!(scores[2] > MIN_SPEECH_ACTIVITY_SCORE);
    }
}
