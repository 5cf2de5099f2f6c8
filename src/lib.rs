//! Dominant speaker identification for multipoint audio conferences.
//!
//! Implements the statistical engine of Volfin and Cohen, "Dominant Speaker
//! Identification for Multipoint Videoconferencing": every per-packet audio
//! level report feeds a per-speaker sliding history that is scored over
//! three time-intervals (immediate / medium / long), and a background
//! decision maker compares every speaker against the incumbent to detect
//! speaker switches.
//!
//! # Example
//!
//! ```
//! use dominant_speaker::Conference;
//!
//! let conference = Conference::new();
//! conference.add_observer(|ssrc| println!("dominant speaker: {ssrc:?}"));
//!
//! // Feed audio levels extracted from RTP packets (SSRC, level 0..=127).
//! conference.level_changed(0x1234, 100);
//! ```
//!
//! The decision maker runs on a background thread, wakes every 300 ms to
//! re-evaluate, injects fade-out silence for speakers that stop reporting,
//! and stands down after 15 s without any level report; the next level
//! report re-arms it.

mod conference;
mod score;
mod speaker;

pub use conference::{Conference, ObserverId};
pub use score::{binomial_coefficient, speech_activity_score};
