//! Sequential spectrum scan.
//!
//! A scan probes one frequency at a time: it launches the demodulator alone,
//! lets its diagnostics accumulate for the dwell time, kills it and records
//! the strongest levels seen. Probes never overlap; each one holds the device
//! lock for its whole lifetime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fmradio_protocol::{
    format_mhz, mhz_to_hz, quantize_hz, ScanPlan, ScanReport, ThresholdLevel,
    FREQUENCY_QUANTUM_HZ,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::peaks::{summarize, ScanSample, CLUSTER_GAP_HZ};
use crate::pipeline::{
    parse_stats, DemodStats, OutputMode, Pipeline, PipelineError, PipelineExit, PipelineSpec,
    TailObserver, Tuning, SCAN_TAIL_LIMIT,
};
use crate::radio::RadioContext;

/// Upper bound on the number of probed frequencies per run.
pub const MAX_SCAN_POINTS: usize = 5000;

/// Pause between stopping other outputs and the first probe.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Integer frequency list for a plan, on the 100 kHz grid.
pub fn frequency_plan(plan: &ScanPlan) -> Vec<i64> {
    let start = quantize_hz(mhz_to_hz(plan.start_mhz));
    let end = quantize_hz(mhz_to_hz(plan.end_mhz));
    let mut step = quantize_hz(mhz_to_hz(plan.step_mhz));
    if step <= 0 {
        step = FREQUENCY_QUANTUM_HZ;
    }
    (0i64..)
        .map(|i| start + i * step)
        .take_while(|hz| *hz <= end)
        .take(MAX_SCAN_POINTS)
        .collect()
}

#[derive(Default)]
struct ScanRun {
    running: bool,
    started: Option<DateTime<Utc>>,
    total: usize,
    done: usize,
    samples: Vec<ScanSample>,
    error: Option<String>,
    cancel: Option<CancellationToken>,
}

/// Owns the current (or last finished) scan run.
pub struct ScanEngine {
    ctx: Arc<RadioContext>,
    settle_delay: Duration,
    run: Mutex<ScanRun>,
}

impl ScanEngine {
    pub fn with_settle_delay(ctx: Arc<RadioContext>, settle_delay: Duration) -> Self {
        Self {
            ctx,
            settle_delay,
            run: Mutex::new(ScanRun::default()),
        }
    }

    /// Start a new run; `false` when one is still running.
    ///
    /// `preempt` is called once the run has been claimed and must stop every
    /// other user of the device.
    pub fn start(self: &Arc<Self>, plan: ScanPlan, preempt: impl FnOnce()) -> bool {
        let frequencies = frequency_plan(&plan);
        let cancel = CancellationToken::new();
        {
            let mut run = self.run.lock();
            if run.running {
                return false;
            }
            *run = ScanRun {
                running: true,
                started: Some(Utc::now()),
                total: frequencies.len(),
                cancel: Some(cancel.clone()),
                ..ScanRun::default()
            };
        }

        preempt();

        let base = self.ctx.state.lock().tuning();
        let dwell = Duration::from_millis(plan.dwell_ms);
        info!(
            "[Scan] started {:.1}-{:.1} MHz, {} points, dwell {} ms",
            plan.start_mhz,
            plan.end_mhz,
            frequencies.len(),
            plan.dwell_ms
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.execute(frequencies, base, dwell, &cancel).await;
            let mut run = this.run.lock();
            if let Err(e) = outcome {
                warn!("[Scan] aborted: {}", e);
                run.error = Some(e.to_string());
            }
            run.running = false;
            info!("[Scan] finished: {}/{} probed", run.done, run.total);
        });
        true
    }

    async fn execute(
        &self,
        frequencies: Vec<i64>,
        base: Tuning,
        dwell: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        for freq_hz in frequencies {
            if cancel.is_cancelled() {
                break;
            }
            let tuning = Tuning { freq_hz, ..base };
            match probe(&self.ctx, &tuning, dwell, cancel).await {
                Ok(Some(stats)) => {
                    let mut run = self.run.lock();
                    run.done += 1;
                    run.samples.push(ScanSample { freq_hz, stats });
                }
                // Cancelled mid-probe.
                Ok(None) => break,
                Err(e) if e.is_launch_failure() => return Err(e),
                Err(e) => {
                    warn!("[Scan] probe at {} MHz failed: {}", format_mhz(freq_hz), e);
                    self.run.lock().done += 1;
                }
            }
        }
        Ok(())
    }

    /// Cancel the current run; it ends once the running probe has been torn down.
    pub fn stop(&self) {
        if let Some(cancel) = &self.run.lock().cancel {
            cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().running
    }

    /// `(done, total)` of the current or last run.
    pub fn progress(&self) -> (usize, usize) {
        let run = self.run.lock();
        (run.done, run.total)
    }

    /// Progress plus ranked results.
    pub fn report(&self, raw: bool, level: ThresholdLevel) -> ScanReport {
        let (samples, mut report) = {
            let run = self.run.lock();
            let report = ScanReport {
                running: run.running,
                started_utc: run.started,
                total: run.total,
                done: run.done,
                error: run.error.clone(),
                raw,
                threshold_level: None,
                threshold_offset_db: None,
                raw_count: run.samples.len(),
                filtered_count: 0,
                noise_floor_if_db: None,
                if_threshold_db: None,
                cluster_gap_mhz: CLUSTER_GAP_HZ as f64 / 1_000_000.0,
                results: Vec::new(),
            };
            (run.samples.clone(), report)
        };

        let summary = summarize(&samples, raw, level);
        report.threshold_level = summary.threshold_level;
        report.threshold_offset_db = summary.threshold_offset_db;
        report.noise_floor_if_db = summary.noise_floor_if_db;
        report.if_threshold_db = summary.if_threshold_db;
        report.filtered_count = summary.results.len();
        report.results = summary.results;
        report
    }
}

/// Best-of-dwell accumulator fed by the probe's diagnostic tail.
#[derive(Default)]
struct DwellCollector {
    best: Mutex<DemodStats>,
}

fn max_level(current: Option<f64>, seen: Option<f64>) -> Option<f64> {
    match (current, seen) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl TailObserver for DwellCollector {
    fn observe(&self, tail: &str) {
        let seen = parse_stats(tail);
        let mut best = self.best.lock();
        best.if_db = max_level(best.if_db, seen.if_db);
        best.bb_db = max_level(best.bb_db, seen.bb_db);
        best.audio_db = max_level(best.audio_db, seen.audio_db);
        if seen.tuned_mhz.is_some() {
            best.tuned_mhz = seen.tuned_mhz;
        }
        if seen.stereo.is_some() {
            best.stereo = seen.stereo;
        }
        if seen.pilot_level.is_some() {
            best.pilot_level = seen.pilot_level;
        }
    }
}

/// Run one probe; `Ok(None)` when cancelled before the dwell elapsed.
async fn probe(
    ctx: &RadioContext,
    tuning: &Tuning,
    dwell: Duration,
    cancel: &CancellationToken,
) -> Result<Option<DemodStats>, PipelineError> {
    let _device = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        guard = ctx.device.acquire("scan") => guard?,
    };

    let collector = Arc::new(DwellCollector::default());
    let spec = PipelineSpec {
        label: "Scan",
        demodulator: ctx.tools.demodulator_spec(tuning),
        encoder: None,
        output: OutputMode::Discard,
        tail_limit: SCAN_TAIL_LIMIT,
        observer: Some(collector.clone()),
        echo_diagnostics: ctx.debug_scan,
    };
    if ctx.debug_scan {
        info!("[Scan] probe {} MHz", format_mhz(tuning.freq_hz));
    }
    let mut pipeline = Pipeline::start(spec, cancel)?;

    // `wait` also returns on cancellation.
    let ended = tokio::select! {
        _ = tokio::time::sleep(dwell) => None,
        exit = pipeline.wait() => Some(exit),
    };
    let report = pipeline.shutdown().await;

    match ended {
        None if cancel.is_cancelled() => return Ok(None),
        None => {}
        Some(Ok(PipelineExit::Cancelled)) => return Ok(None),
        Some(Ok(PipelineExit::Exited { role, status })) => {
            return Err(report.unexpected_exit(role, status))
        }
        Some(Err(e)) => return Err(e),
    }
    let stats = *collector.best.lock();
    debug!(
        "[Scan] {} MHz: IF={:?} BB={:?} audio={:?} stereo={:?}",
        format_mhz(tuning.freq_hz),
        stats.if_db,
        stats.bb_db,
        stats.audio_db,
        stats.stereo
    );
    Ok(Some(stats))
}
