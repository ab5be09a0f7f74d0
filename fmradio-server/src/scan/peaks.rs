//! Peak detection over collected scan samples.

use std::cmp::Ordering;

use fmradio_protocol::{format_mhz, ScanResultEntry, ThresholdLevel};

use crate::pipeline::DemodStats;

/// Samples closer than this are treated as one station.
pub const CLUSTER_GAP_HZ: i64 = 250_000;

/// Minimum number of IF readings needed to estimate a noise floor.
const MIN_NOISE_SAMPLES: usize = 5;

const RAW_LIMIT: usize = 500;
const FALLBACK_LIMIT: usize = 50;
const RESULT_LIMIT: usize = 200;

/// Best-of-dwell measurement for one probed frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSample {
    pub freq_hz: i64,
    pub stats: DemodStats,
}

impl ScanSample {
    fn if_level(&self) -> f64 {
        self.stats.if_db.unwrap_or(f64::NEG_INFINITY)
    }

    fn bb_level(&self) -> f64 {
        self.stats.bb_db.unwrap_or(f64::NEG_INFINITY)
    }

    fn audio_level(&self) -> f64 {
        self.stats.audio_db.unwrap_or(f64::NEG_INFINITY)
    }

    /// Stronger than `other` within a cluster: IF first, then baseband.
    fn beats(&self, other: &ScanSample) -> bool {
        match self.if_level().total_cmp(&other.if_level()) {
            Ordering::Greater => true,
            Ordering::Equal => self.bb_level() > other.bb_level(),
            Ordering::Less => false,
        }
    }

    fn to_entry(self) -> ScanResultEntry {
        ScanResultEntry {
            freq_mhz: format_mhz(self.freq_hz),
            tuned_mhz: self.stats.tuned_mhz,
            if_db: self.stats.if_db,
            bb_db: self.stats.bb_db,
            audio_db: self.stats.audio_db,
            stereo: self.stats.stereo.unwrap_or(false),
            pilot_level: self.stats.pilot_level,
        }
    }
}

/// Strongest first: IF, then baseband, then audio level.
fn by_strength(a: &ScanSample, b: &ScanSample) -> Ordering {
    b.if_level()
        .total_cmp(&a.if_level())
        .then_with(|| b.bb_level().total_cmp(&a.bb_level()))
        .then_with(|| b.audio_level().total_cmp(&a.audio_level()))
}

/// Result of post-processing, before it is wrapped into a report.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakSummary {
    pub threshold_level: Option<ThresholdLevel>,
    pub threshold_offset_db: Option<f64>,
    pub noise_floor_if_db: Option<f64>,
    pub if_threshold_db: Option<f64>,
    pub results: Vec<ScanResultEntry>,
}

/// Median of the available IF readings, when there are enough of them.
pub fn noise_floor(samples: &[ScanSample]) -> Option<f64> {
    let mut levels: Vec<f64> = samples.iter().filter_map(|s| s.stats.if_db).collect();
    if levels.len() < MIN_NOISE_SAMPLES {
        return None;
    }
    levels.sort_by(f64::total_cmp);
    Some(levels[levels.len() / 2])
}

/// Merge neighbouring samples, keeping the strongest of each group.
///
/// Each candidate is compared with the current group's best frequency, so
/// running this on its own output changes nothing.
pub fn cluster(candidates: &[ScanSample]) -> Vec<ScanSample> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|s| s.freq_hz);

    let mut peaks = Vec::new();
    let mut best: Option<ScanSample> = None;
    for sample in sorted {
        match best {
            None => best = Some(sample),
            Some(current) if (sample.freq_hz - current.freq_hz).abs() <= CLUSTER_GAP_HZ => {
                if sample.beats(&current) {
                    best = Some(sample);
                }
            }
            Some(current) => {
                peaks.push(current);
                best = Some(sample);
            }
        }
    }
    peaks.extend(best);
    peaks
}

/// Rank the samples, either as-is (`raw`) or as detected stations.
pub fn summarize(samples: &[ScanSample], raw: bool, level: ThresholdLevel) -> PeakSummary {
    if raw {
        let mut ranked = samples.to_vec();
        ranked.sort_by(by_strength);
        ranked.truncate(RAW_LIMIT);
        return PeakSummary {
            threshold_level: None,
            threshold_offset_db: None,
            noise_floor_if_db: None,
            if_threshold_db: None,
            results: ranked.into_iter().map(ScanSample::to_entry).collect(),
        };
    }

    let offset_db = level.offset_db();
    let floor = noise_floor(samples);
    let threshold = floor.map(|f| f + offset_db);

    let mut selected = match threshold {
        Some(threshold) => {
            let above: Vec<ScanSample> = samples
                .iter()
                .filter(|s| s.stats.if_db.is_some_and(|db| db >= threshold))
                .copied()
                .collect();
            cluster(&above)
        }
        None => Vec::new(),
    };

    if selected.is_empty() {
        selected = samples.to_vec();
        selected.sort_by(|a, b| {
            b.if_level()
                .total_cmp(&a.if_level())
                .then_with(|| b.bb_level().total_cmp(&a.bb_level()))
        });
        selected.truncate(FALLBACK_LIMIT);
    }

    selected.sort_by(by_strength);
    selected.truncate(RESULT_LIMIT);

    PeakSummary {
        threshold_level: Some(level),
        threshold_offset_db: Some(offset_db),
        noise_floor_if_db: floor,
        if_threshold_db: threshold,
        results: selected.into_iter().map(ScanSample::to_entry).collect(),
    }
}
