// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Classification of the flashing tool's accumulated output

/// Any of these means the tool never reached the board
pub const DEVICE_NOT_FOUND_MARKERS: &[&str] = &["can't open device", "No device found"];
pub const FAILURE_MARKER: &str = "FAILED";
pub const VERIFIED_MARKER: &str = "verified";
pub const DONE_MARKER: &str = "done";
pub const TIMEOUT_MARKER: &str = "ReceiveMessage(): timeout";

const READING_MARKER: &str = "Reading";
const WRITING_MARKER: &str = "Writing";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    DeviceNotFound,
    ToolFailed,
    Completed(FlashTimings),
    TimedOut,
    /// Process exited without printing any recognized marker
    UnknownFailure,
    Running,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlashTimings {
    pub reading_secs: Option<f64>,
    pub writing_secs: Option<f64>,
}

impl FlashTimings {
    /// Sum of read and write time rounded to two decimals; `None` unless both were printed
    pub fn total(&self) -> Option<f64> {
        let sum = self.reading_secs? + self.writing_secs?;
        Some((sum * 100.0).round() / 100.0)
    }
}

/// Classify the whole log text. Checks run in a fixed priority order because the
/// surrounding text of one outcome can contain the markers of a later one.
pub fn classify(log: &str, process_exited: bool) -> Verdict {
    if DEVICE_NOT_FOUND_MARKERS.iter().any(|m| log.contains(m)) {
        return Verdict::DeviceNotFound;
    }
    if log.contains(FAILURE_MARKER) {
        return Verdict::ToolFailed;
    }
    if log.contains(VERIFIED_MARKER) && log.contains(DONE_MARKER) {
        return Verdict::Completed(extract_timings(log));
    }
    if log.contains(TIMEOUT_MARKER) {
        return Verdict::TimedOut;
    }
    if process_exited {
        return Verdict::UnknownFailure;
    }
    Verdict::Running
}

/// Pull the seconds printed at the end of the last "Reading" and "Writing" lines,
/// e.g. `Reading | ################################################## | 100% 1.23s`.
pub fn extract_timings(log: &str) -> FlashTimings {
    let mut timings = FlashTimings::default();
    for line in log.lines() {
        if line.contains(READING_MARKER)
            && let Some(secs) = trailing_seconds(line)
        {
            timings.reading_secs = Some(secs);
        }
        if line.contains(WRITING_MARKER)
            && let Some(secs) = trailing_seconds(line)
        {
            timings.writing_secs = Some(secs);
        }
    }
    timings
}

/// The number between the last space and a trailing `s`
fn trailing_seconds(line: &str) -> Option<f64> {
    let line = line.trim_end();
    let token = line.rsplit(' ').next()?;
    token.strip_suffix('s')?.parse::<f64>().ok()
}
