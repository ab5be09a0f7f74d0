//! Parser for the demodulator's diagnostic text.
//!
//! The demodulator periodically prints lines such as
//!
//! ```text
//! blk=  12:freq=88.100000MHz  IF=+12.3dB  BB=-3.1dB  audio=-14.0dB  buf=0.2s
//! got stereo signal (pilot level = 0.012345)
//! lost stereo signal
//! ```
//!
//! The parser only ever sees a bounded tail of that text, so the first line
//! may be cut in the middle and the last line may still be incomplete.

/// Latest statistics extracted from a diagnostic tail.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DemodStats {
    pub tuned_mhz: Option<f64>,
    pub if_db: Option<f64>,
    pub bb_db: Option<f64>,
    pub audio_db: Option<f64>,
    /// `Some(true)` after "got stereo signal", `Some(false)` after "lost
    /// stereo signal", `None` when neither was seen.
    pub stereo: Option<bool>,
    /// Pilot level announced by the latest "got stereo signal".
    pub pilot_level: Option<f64>,
}

const GOT_STEREO: &str = "got stereo signal";
const LOST_STEREO: &str = "lost stereo signal";
const PILOT_LEVEL: &str = "pilot level =";

/// Extract the latest complete statistics from `tail`.
///
/// Never fails: anything that cannot be read is reported as `None`.
pub fn parse_stats(tail: &str) -> DemodStats {
    // ASCII lowering keeps byte offsets identical to `tail`.
    let lower = tail.to_ascii_lowercase();

    let got = lower.rfind(GOT_STEREO);
    let lost = lower.rfind(LOST_STEREO);
    let stereo = match (got, lost) {
        (None, None) => None,
        (Some(g), Some(l)) => Some(g > l),
        (Some(_), None) => Some(true),
        (None, Some(_)) => Some(false),
    };
    let pilot_level = match (stereo, got) {
        (Some(true), Some(g)) => pilot_after(&lower, g),
        _ => None,
    };

    DemodStats {
        tuned_mhz: value_between(&lower, "freq=", "mhz"),
        if_db: value_between(&lower, "if=", "db"),
        bb_db: value_between(&lower, "bb=", "db"),
        audio_db: value_between(&lower, "audio=", "db"),
        stereo,
        pilot_level,
    }
}

/// Latest occurrence of `marker <number> suffix` whose number is complete.
fn value_between(text: &str, marker: &str, suffix: &str) -> Option<f64> {
    text.rmatch_indices(marker).find_map(|(idx, _)| {
        let rest = &text[idx + marker.len()..];
        let end = rest.find(suffix)?;
        parse_decimal(rest[..end].trim())
    })
}

fn pilot_after(text: &str, from: usize) -> Option<f64> {
    let idx = text[from..].find(PILOT_LEVEL)? + from + PILOT_LEVEL.len();
    let rest = text[idx..].trim_start();
    let len = rest
        .find(|c: char| !is_number_char(c))
        // A number running into the end of the tail may still be growing.
        .filter(|&len| len > 0)?;
    rest[..len].parse().ok()
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e')
}

/// Accept only a plain signed decimal, rejecting anything with trailing noise.
fn parse_decimal(s: &str) -> Option<f64> {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    let well_formed = !digits.is_empty()
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.matches('.').count() <= 1;
    if !well_formed {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str =
        "blk=  12:freq=88.100000MHz  IF=+12.3dB  BB=-3.1dB  audio=-14.0dB  buf=0.2s\n";

    #[test]
    fn test_parse_full_line() {
        let stats = parse_stats(LINE);
        assert_eq!(stats.tuned_mhz, Some(88.1));
        assert_eq!(stats.if_db, Some(12.3));
        assert_eq!(stats.bb_db, Some(-3.1));
        assert_eq!(stats.audio_db, Some(-14.0));
        assert_eq!(stats.stereo, None);
        assert_eq!(stats.pilot_level, None);
    }

    #[test]
    fn test_empty_tail() {
        assert_eq!(parse_stats(""), DemodStats::default());
        assert_eq!(parse_stats("nothing useful here"), DemodStats::default());
    }

    #[test]
    fn test_latest_value_wins() {
        let text = format!("{}blk=  13:freq=88.100000MHz  IF=+20.0dB  BB=-1.0dB", LINE);
        let stats = parse_stats(&text);
        assert_eq!(stats.if_db, Some(20.0));
        assert_eq!(stats.bb_db, Some(-1.0));
        // Not yet printed on the partial line.
        assert_eq!(stats.audio_db, Some(-14.0));
    }

    #[test]
    fn test_truncated_value_falls_back() {
        // Incomplete trailing number without its unit.
        let text = format!("{}blk=  13:freq=88.100000MHz  IF=+2", LINE);
        assert_eq!(parse_stats(&text).if_db, Some(12.3));

        // Tail cut in the middle of the first line.
        let stats = parse_stats("3dB  BB=-3.1dB  audio=-14.0dB\n");
        assert_eq!(stats.if_db, None);
        assert_eq!(stats.bb_db, Some(-3.1));
    }

    #[test]
    fn test_garbage_between_marker_and_unit() {
        assert_eq!(parse_stats("IF=n/a dB").if_db, None);
        assert_eq!(parse_stats("IF=+1.2.3dB").if_db, None);
    }

    #[test]
    fn test_case_insensitive_markers() {
        let stats = parse_stats("if=+4.5DB bb=+1.0Db AUDIO=-2.0dB FREQ=90.000000mhz");
        assert_eq!(stats.if_db, Some(4.5));
        assert_eq!(stats.bb_db, Some(1.0));
        assert_eq!(stats.audio_db, Some(-2.0));
        assert_eq!(stats.tuned_mhz, Some(90.0));
    }

    #[test]
    fn test_stereo_transitions() {
        let stats = parse_stats("got stereo signal (pilot level = 0.012345)\n");
        assert_eq!(stats.stereo, Some(true));
        assert_eq!(stats.pilot_level, Some(0.012345));

        let stats = parse_stats(
            "got stereo signal (pilot level = 0.012345)\nlost stereo signal\n",
        );
        assert_eq!(stats.stereo, Some(false));
        assert_eq!(stats.pilot_level, None);

        let stats = parse_stats(
            "lost stereo signal\nGot Stereo Signal (pilot level = 0.5)\n",
        );
        assert_eq!(stats.stereo, Some(true));
        assert_eq!(stats.pilot_level, Some(0.5));
    }

    #[test]
    fn test_truncated_pilot_level() {
        let stats = parse_stats("got stereo signal (pilot level = 0.01");
        assert_eq!(stats.stereo, Some(true));
        assert_eq!(stats.pilot_level, None);
    }
}
