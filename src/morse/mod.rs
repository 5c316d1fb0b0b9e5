//! Morse encoding and timed playback on a lamp.
//!
//! Text is lowercased, every character with a code is replaced by it (space
//! becomes `/`), characters without a code are dropped, and the codes are
//! joined with single spaces. Every character of that stream is one playback
//! unit:
//!
//! | Unit | Lamp |
//! |---|---|
//! | `.` | on for `dot`, then off for `gap` |
//! | `-` | on for `dash`, then off for `gap` |
//! | ` ` | off for `letter_gap` |
//! | `/` | off for `word_gap` |

use crate::{
    config::MorseSettings,
    devices::Device,
    error::AppError,
    metrics as app_metrics,
    models::MorseProgressEvent,
    publisher::ProgressSink,
};
use std::{future::Future, time::Duration};
use tracing::{debug, info};

/// At most this many intermediate progress events per message.
const PROGRESS_STEPS: usize = 10;

fn code(c: char) -> Option<&'static str> {
    let code = match c {
        'a' => ".-",
        'b' => "-...",
        'c' => "-.-.",
        'd' => "-..",
        'e' => ".",
        'f' => "..-.",
        'g' => "--.",
        'h' => "....",
        'i' => "..",
        'j' => ".---",
        'k' => "-.-",
        'l' => ".-..",
        'm' => "--",
        'n' => "-.",
        'o' => "---",
        'p' => ".--.",
        'q' => "--.-",
        'r' => ".-.",
        's' => "...",
        't' => "-",
        'u' => "..-",
        'v' => "...-",
        'w' => ".--",
        'x' => "-..-",
        'y' => "-.--",
        'z' => "--..",
        '0' => "-----",
        '1' => ".----",
        '2' => "..---",
        '3' => "...--",
        '4' => "....-",
        '5' => ".....",
        '6' => "-....",
        '7' => "--...",
        '8' => "---..",
        '9' => "----.",
        ' ' => "/",
        _ => return None,
    };
    Some(code)
}

/// Encodes `text` into a flat stream of `.`, `-`, `/` and separating spaces.
pub fn encode(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter_map(code)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorseUnit {
    Dot,
    Dash,
    LetterGap,
    WordGap,
}

pub fn units(text: &str) -> Vec<MorseUnit> {
    encode(text)
        .chars()
        .filter_map(|c| match c {
            '.' => Some(MorseUnit::Dot),
            '-' => Some(MorseUnit::Dash),
            ' ' => Some(MorseUnit::LetterGap),
            '/' => Some(MorseUnit::WordGap),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MorseTiming {
    pub dot: Duration,
    pub dash: Duration,
    pub gap: Duration,
    pub letter_gap: Duration,
    pub word_gap: Duration,
}

impl MorseTiming {
    /// No delays at all; playback runs as fast as the device answers.
    pub fn instant() -> Self {
        Self {
            dot: Duration::ZERO,
            dash: Duration::ZERO,
            gap: Duration::ZERO,
            letter_gap: Duration::ZERO,
            word_gap: Duration::ZERO,
        }
    }
}

impl Default for MorseTiming {
    fn default() -> Self {
        Self {
            dot: Duration::from_millis(100),
            dash: Duration::from_millis(300),
            gap: Duration::from_millis(100),
            letter_gap: Duration::from_millis(300),
            word_gap: Duration::from_millis(500),
        }
    }
}

impl From<&MorseSettings> for MorseTiming {
    fn from(settings: &MorseSettings) -> Self {
        Self {
            dot: Duration::from_millis(settings.dot_ms),
            dash: Duration::from_millis(settings.dash_ms),
            gap: Duration::from_millis(settings.gap_ms),
            letter_gap: Duration::from_millis(settings.letter_gap_ms),
            word_gap: Duration::from_millis(settings.word_gap_ms),
        }
    }
}

fn percent(processed: usize, total: usize) -> u8 {
    ((processed as f64 * 100.0) / total as f64).round() as u8
}

/// Plays messages on a lamp. A message runs to completion once started.
pub struct MorsePlayer {
    timing: MorseTiming,
    op_timeout: Duration,
}

impl MorsePlayer {
    /// `op_timeout` bounds every single device call, not the whole message.
    pub fn new(timing: MorseTiming, op_timeout: Duration) -> Self {
        Self { timing, op_timeout }
    }

    pub async fn play(
        &self,
        device: &dyn Device,
        text: &str,
        sink: &dyn ProgressSink,
    ) -> Result<(), AppError> {
        let units = units(text);
        let total = units.len();
        let was_on = self.bounded(device.get_state()).await?.powered_on;
        info!(units = total, "Morse playback started");
        sink.emit(MorseProgressEvent::started()).await;

        if total > 0 {
            if was_on {
                self.bounded(device.turn_off()).await?;
            }

            let step = total.div_ceil(PROGRESS_STEPS);
            for (index, unit) in units.iter().enumerate() {
                self.play_unit(device, *unit).await?;
                let processed = index + 1;
                if processed % step == 0 || processed == total {
                    sink.emit(MorseProgressEvent::progress(percent(processed, total)))
                        .await;
                }
            }
            metrics::counter!(app_metrics::MORSE_UNITS_TOTAL).increment(total as u64);

            if was_on {
                self.bounded(device.turn_on()).await?;
            }
        } else {
            sink.emit(MorseProgressEvent::progress(100)).await;
        }

        sink.emit(MorseProgressEvent::completed()).await;
        info!("Morse playback completed");
        Ok(())
    }

    async fn play_unit(&self, device: &dyn Device, unit: MorseUnit) -> Result<(), AppError> {
        debug!(?unit, "Morse unit");
        match unit {
            MorseUnit::Dot => self.pulse(device, self.timing.dot).await,
            MorseUnit::Dash => self.pulse(device, self.timing.dash).await,
            MorseUnit::LetterGap => {
                tokio::time::sleep(self.timing.letter_gap).await;
                Ok(())
            }
            MorseUnit::WordGap => {
                tokio::time::sleep(self.timing.word_gap).await;
                Ok(())
            }
        }
    }

    async fn pulse(&self, device: &dyn Device, on_for: Duration) -> Result<(), AppError> {
        self.bounded(device.turn_on()).await?;
        tokio::time::sleep(on_for).await;
        self.bounded(device.turn_off()).await?;
        tokio::time::sleep(self.timing.gap).await;
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        tokio::time::timeout(self.op_timeout, call)
            .await
            .map_err(|_| AppError::ExecutionTimeout(self.op_timeout))?
    }
}
