//! Parsing of the encoder's line-oriented progress output.
//!
//! Input contract: the encoder is run with `-progress`, which writes
//! `key=value` lines. Exactly one key is recognised, [`PROGRESS_MARKER`],
//! whose value is the elapsed encoded time in microseconds (ffmpeg names it
//! `_ms` for historical reasons). Every other line is diagnostic noise.

/// Marker key carrying elapsed encoded time in microseconds
pub const PROGRESS_MARKER: &str = "out_time_ms";

/// A single parsed unit of encoder progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub current_seconds: f64,
}

/// Parse one output line into a progress event, or `None` for any line that
/// is not a well-formed marker line.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let (key, value) = line.trim().split_once('=')?;
    if key.trim() != PROGRESS_MARKER {
        return None;
    }

    // "N/A" is emitted before the first frame is muxed
    let micros: i64 = value.trim().parse().ok()?;
    if micros < 0 {
        return None;
    }

    Some(ProgressEvent {
        current_seconds: micros as f64 / 1_000_000.0,
    })
}

/// Convert elapsed seconds into a whole percentage of the total duration,
/// truncated and clamped to 0..=100.
pub fn percent_complete(current_seconds: f64, total_seconds: f64) -> u8 {
    if !total_seconds.is_finite() || total_seconds <= 0.0 || !current_seconds.is_finite() {
        return 0;
    }

    let percent = (current_seconds / total_seconds * 100.0).trunc();
    percent.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parses_marker_line() {
        let event = parse_progress_line("out_time_ms=12500000").unwrap();
        assert_eq!(event.current_seconds, 12.5);
    }

    #[test]
    fn test_ignores_noise() {
        for line in [
            "frame=120",
            "out_time=00:00:05.000000",
            "out_time_us=5000000",
            "progress=continue",
            "out_time_ms=N/A",
            "out_time_ms=-1",
            "Stream #0:0: Video: h264",
            "",
        ] {
            assert!(parse_progress_line(line).is_none(), "line {:?} should be ignored", line);
        }
    }

    #[test]
    fn test_tolerates_surrounding_whitespace() {
        let event = parse_progress_line("  out_time_ms=1000000\r").unwrap();
        assert_eq!(event.current_seconds, 1.0);
    }

    #[test]
    fn test_percent_complete_edges() {
        assert_eq!(percent_complete(5.0, 10.0), 50);
        assert_eq!(percent_complete(9.999, 10.0), 99);
        assert_eq!(percent_complete(25.0, 10.0), 100);
        assert_eq!(percent_complete(-1.0, 10.0), 0);
        assert_eq!(percent_complete(5.0, 0.0), 0);
        assert_eq!(percent_complete(5.0, f64::NAN), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Well-formed marker lines yield exactly micros / 1e6 seconds
        #[test]
        fn test_extracts_well_formed_markers(micros in 0i64..=86_400_000_000i64) {
            let line = format!("{}={}", PROGRESS_MARKER, micros);
            let event = parse_progress_line(&line);
            prop_assert_eq!(event, Some(ProgressEvent { current_seconds: micros as f64 / 1_000_000.0 }));
        }

        /// Lines whose key is not the marker are never events
        #[test]
        fn test_ignores_unrelated_lines(key in "[a-z_]{1,16}", value in "[0-9A-Za-z/:.]{0,16}") {
            prop_assume!(key != PROGRESS_MARKER);
            let line = format!("{}={}", key, value);
            prop_assert!(parse_progress_line(&line).is_none());
        }

        /// Percent is always in range whatever the inputs
        #[test]
        fn test_percent_in_range(current in -1.0e6f64..1.0e6, total in -1.0e3f64..1.0e6) {
            let percent = percent_complete(current, total);
            prop_assert!(percent <= 100);
        }

        /// Later timestamps never map to a lower percent
        #[test]
        fn test_percent_monotonic(a in 0.0f64..1.0e4, b in 0.0f64..1.0e4, total in 0.1f64..1.0e4) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(percent_complete(lo, total) <= percent_complete(hi, total));
        }
    }
}
