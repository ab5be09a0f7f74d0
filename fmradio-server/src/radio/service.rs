//! The radio service: every operation the HTTP layer may call.
//!
//! Three activities compete for the single SDR device: a live stream for the
//! current listener, the continuous segmented output and a scan. The service
//! decides which one may run and wires each of them to the shared context.

use std::sync::Arc;
use std::time::Duration;

use fmradio_protocol::{
    validate_frequency, ConfigSnapshot, Delivery, OutputFormat, ScanPlan, ScanReport,
    StatusSnapshot, StreamingConfigUpdate, ThresholdLevel, ValidationError,
};
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use super::lease::{LeaseManager, StreamLease};
use super::state::{RadioContext, StereoTracker};
use crate::hls::{clear_segment_dir, manifest_readiness, ContinuousOutput, NotReady, RunFn, RETRY_DELAY};
use crate::pipeline::{
    buffer_capacity, relay, OutputMode, Pipeline, PipelineError, PipelineExit, PipelineSpec,
    RelayEnd, LIVE_TAIL_LIMIT, TEARDOWN_GRACE,
};
use crate::scan::{ScanEngine, SETTLE_DELAY};

/// Owner of the live stream, continuous output and scan.
pub struct RadioService {
    ctx: Arc<RadioContext>,
    leases: LeaseManager,
    hls: Arc<ContinuousOutput>,
    scan: Arc<ScanEngine>,
    /// Serializes claiming a scan against starting the segmented output.
    delivery_gate: Mutex<()>,
}

impl RadioService {
    pub fn new(ctx: Arc<RadioContext>) -> Self {
        Self::with_timings(ctx, RETRY_DELAY, SETTLE_DELAY)
    }

    /// Service with custom HLS retry backoff and scan settle delay.
    pub fn with_timings(ctx: Arc<RadioContext>, hls_retry: Duration, scan_settle: Duration) -> Self {
        let scan = Arc::new(ScanEngine::with_settle_delay(Arc::clone(&ctx), scan_settle));
        let runner_ctx = Arc::clone(&ctx);
        let runner_scan = Arc::clone(&scan);
        let runner: RunFn = Arc::new(move |cancel: CancellationToken| {
            run_segmented(Arc::clone(&runner_ctx), Arc::clone(&runner_scan), cancel).boxed()
        });
        Self {
            hls: Arc::new(ContinuousOutput::with_retry_delay(runner, hls_retry)),
            scan,
            leases: LeaseManager::new(),
            delivery_gate: Mutex::new(()),
            ctx,
        }
    }

    #[cfg(test)]
    pub fn context(&self) -> &Arc<RadioContext> {
        &self.ctx
    }

    pub fn status(&self) -> StatusSnapshot {
        let hls_running = self.hls.is_running();
        let scan_running = self.scan.is_running();
        let (scan_done, scan_total) = self.scan.progress();
        let streaming = self.leases.is_streaming() || hls_running;

        let state = self.ctx.state.lock();
        StatusSnapshot {
            freq_hz: state.settings.freq_hz,
            streaming,
            hls_running,
            scan_running,
            scan_done,
            scan_total,
            stereo_detected: state.stereo_detected,
            pilot_level: state.pilot_level,
            stereo_updated_utc: state.stereo_updated,
            last_error: state.last_error.clone(),
            delivery: state.settings.delivery,
            stereo_mode: state.settings.stereo_mode,
            force_stereo: state.settings.stereo_mode.forces_stereo(),
        }
    }

    pub fn config(&self) -> ConfigSnapshot {
        self.ctx.state.lock().config_snapshot()
    }

    /// Retune. With `restart`, running pipelines are cancelled so the next
    /// start picks up the new frequency.
    pub fn set_frequency(&self, freq_hz: i64, restart: bool) -> Result<(), ValidationError> {
        let freq_hz = validate_frequency(freq_hz)?;
        {
            let mut state = self.ctx.state.lock();
            state.settings.freq_hz = freq_hz;
            state.last_error = None;
            state.forget_stereo();
        }
        info!("[Radio] frequency set to {} Hz", freq_hz);

        if restart {
            self.leases.cancel_current();
            self.hls.cancel_current();
            self.clear_segments();
        }
        Ok(())
    }

    /// Validate and apply a configuration update; nothing changes on error.
    pub fn set_streaming_config(
        &self,
        update: &StreamingConfigUpdate,
        restart: bool,
    ) -> Result<ConfigSnapshot, ValidationError> {
        let change = update.validate()?;
        let (snapshot, delivery) = {
            let mut state = self.ctx.state.lock();
            state.apply(&change);
            (state.config_snapshot(), state.settings.delivery)
        };
        debug!("[Radio] streaming config updated: {:?}", snapshot);

        if restart {
            self.leases.cancel_current();
            match delivery {
                Delivery::Segmented => {
                    self.hls.cancel_current();
                    self.clear_segments();
                    self.ensure_continuous_output_started();
                }
                Delivery::Direct => {
                    self.hls.stop();
                    self.clear_segments();
                }
            }
        }
        Ok(snapshot)
    }

    /// Start whatever the configured delivery mode needs.
    pub fn ensure_delivery_started(&self) {
        if self.ctx.state.lock().settings.delivery == Delivery::Segmented {
            self.ensure_continuous_output_started();
        }
    }

    /// Idempotent start of the continuous segmented output.
    pub fn ensure_continuous_output_started(&self) {
        let _gate = self.delivery_gate.lock();
        if self.scan.is_running() {
            debug!("[Hls] scan in progress, not starting segmented output");
            return;
        }
        if self.ctx.state.lock().settings.delivery != Delivery::Segmented {
            return;
        }
        self.hls.ensure_running();
    }

    /// Whether the segmented output can be played.
    pub fn segmented_readiness(&self) -> Result<(), NotReady> {
        if self.ctx.state.lock().settings.delivery != Delivery::Segmented {
            return Err(NotReady::NotSegmented);
        }
        manifest_readiness(&self.ctx.segment_dir)
    }

    /// The activity that keeps a live stream off the device, if any.
    ///
    /// A scan or an active segmented output holds the device until stopped,
    /// so a live stream would wait forever behind it.
    pub fn live_blocker(&self) -> Option<&'static str> {
        if self.scan.is_running() {
            Some("scan")
        } else if self.hls.is_active() {
            Some("hls")
        } else {
            None
        }
    }

    /// Take over as the current listener, preempting any previous one.
    pub fn begin_streaming(&self) -> StreamLease {
        let lease = self.leases.acquire();
        debug!("[Stream] lease {} acquired", lease.generation);
        lease
    }

    pub fn end_streaming(&self, generation: u64) -> bool {
        self.leases.release(generation)
    }

    /// Requested format when it is supported, else the configured one.
    pub fn resolve_format(&self, requested: Option<&str>) -> OutputFormat {
        requested
            .and_then(|fmt| fmt.parse().ok())
            .unwrap_or_else(|| self.ctx.state.lock().settings.format)
    }

    /// Run a live pipeline into `sink` until the request or the lease is
    /// cancelled, the client goes away, or the pipeline fails.
    ///
    /// Cancellation and client disconnect return `Ok`. Failures are also
    /// recorded as the last error.
    pub async fn stream_to<W>(
        &self,
        sink: &mut W,
        request: &CancellationToken,
        lease: &StreamLease,
        format: OutputFormat,
    ) -> Result<(), PipelineError>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(holder) = self.live_blocker() {
            let err = PipelineError::DeviceBusy(holder);
            warn!("[Stream] lease {} refused: {}", lease.generation, err);
            self.ctx.record_error(err.to_string());
            return Err(err);
        }

        let cancel = lease.token.child_token();
        let _unlink = cancel.clone().drop_guard();
        tokio::spawn({
            let request = request.clone();
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = request.cancelled() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            }
        });

        let device = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            guard = self.ctx.device.acquire("live") => guard?,
        };

        let (tuning, capacity) = {
            let mut state = self.ctx.state.lock();
            state.last_error = None;
            state.begin_pipeline();
            let capacity = buffer_capacity(state.settings.buffer_seconds, format.live_bitrate_kbps());
            (state.tuning(), capacity)
        };
        let spec = PipelineSpec {
            label: "Stream",
            demodulator: self.ctx.tools.demodulator_spec(&tuning),
            encoder: Some(
                self.ctx
                    .tools
                    .live_encoder_spec(format, tuning.stereo_mode.channels()),
            ),
            output: OutputMode::Capture,
            tail_limit: LIVE_TAIL_LIMIT,
            observer: Some(Arc::new(StereoTracker::new(Arc::clone(&self.ctx)))),
            echo_diagnostics: false,
        };

        let mut pipeline = match Pipeline::start(spec, &cancel) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!("[Stream] failed to start: {}", e);
                self.ctx.record_error(e.to_string());
                return Err(e);
            }
        };
        info!(
            "[Stream] lease {} streaming {} at {} Hz (buffer {} bytes)",
            lease.generation, format, tuning.freq_hz, capacity
        );

        let ending = match pipeline.take_output() {
            Some(mut output) => {
                let relayed = relay(&mut output, sink, capacity, pipeline.cancel_token()).await;
                match relayed {
                    Ok((RelayEnd::Cancelled, stats)) => {
                        debug!("[Stream] cancelled after {} bytes", stats.bytes_out);
                        Ending::Clean
                    }
                    Ok((RelayEnd::SourceClosed, _)) if cancel.is_cancelled() => Ending::Clean,
                    Ok((RelayEnd::SourceClosed, stats)) => {
                        debug!("[Stream] encoder output ended after {} bytes", stats.bytes_out);
                        // Give the processes a moment to report how they ended.
                        let _ = tokio::time::timeout(TEARDOWN_GRACE, pipeline.wait()).await;
                        Ending::Exited
                    }
                    Err(e) if e.is_disconnect() || cancel.is_cancelled() => {
                        debug!("[Stream] client went away: {}", e);
                        Ending::Clean
                    }
                    Err(e) => Ending::Failed(e.into()),
                }
            }
            None => Ending::Failed(PipelineError::OutputClosed),
        };

        let report = pipeline.shutdown().await;
        drop(device);

        let result = match ending {
            Ending::Clean => Ok(()),
            Ending::Exited => Err(report.exit_error().unwrap_or(PipelineError::OutputClosed)),
            Ending::Failed(e) => Err(e),
        };
        match &result {
            Ok(()) => info!("[Stream] lease {} ended", lease.generation),
            Err(e) => {
                warn!("[Stream] lease {} failed: {}", lease.generation, e);
                self.ctx.record_error(e.to_string());
            }
        }
        result
    }

    /// Start a scan, stopping live and segmented output first.
    pub fn start_scan(&self, plan: ScanPlan) -> bool {
        let _gate = self.delivery_gate.lock();
        self.scan.start(plan, || self.stop_delivery())
    }

    pub fn stop_scan(&self) {
        self.scan.stop();
    }

    pub fn scan_report(&self, raw: bool, level: ThresholdLevel) -> ScanReport {
        self.scan.report(raw, level)
    }

    /// Stop everything: live stream, segmented output and scan.
    pub fn stop(&self) {
        self.ctx.state.lock().last_error = None;
        self.stop_delivery();
        self.scan.stop();
        info!("[Radio] stopped");
    }

    fn stop_delivery(&self) {
        self.leases.revoke();
        self.hls.stop();
        self.clear_segments();
    }

    fn clear_segments(&self) {
        if let Err(e) = clear_segment_dir(&self.ctx.segment_dir) {
            warn!(
                "[Hls] failed to clear {}: {}",
                self.ctx.segment_dir.display(),
                e
            );
        }
    }
}

enum Ending {
    Clean,
    /// The encoder output closed on its own.
    Exited,
    Failed(PipelineError),
}

/// One run of the segmented pipeline; failures are recorded as `HLS: ...`.
async fn run_segmented(
    ctx: Arc<RadioContext>,
    scan: Arc<ScanEngine>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let result = run_segmented_once(&ctx, &scan, &cancel).await;
    if let Err(e) = &result {
        ctx.record_error(format!("HLS: {}", e));
    }
    result
}

async fn run_segmented_once(
    ctx: &Arc<RadioContext>,
    scan: &ScanEngine,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let _device = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        guard = ctx.device.acquire("hls") => guard?,
    };
    if scan.is_running() {
        // Ends the whole loop; the scan owns the device until it finishes.
        info!("[Hls] scan in progress, stopping segmented output");
        cancel.cancel();
        return Ok(());
    }
    clear_segment_dir(&ctx.segment_dir)?;

    let (tuning, bitrate_kbps, buffer_seconds) = {
        let mut state = ctx.state.lock();
        state.begin_pipeline();
        (
            state.tuning(),
            state.settings.segment_bitrate_kbps,
            state.settings.buffer_seconds,
        )
    };
    let spec = PipelineSpec {
        label: "Hls",
        demodulator: ctx.tools.demodulator_spec(&tuning),
        encoder: Some(ctx.tools.segment_encoder_spec(
            &ctx.segment_dir,
            bitrate_kbps,
            buffer_seconds,
            tuning.stereo_mode.channels(),
        )),
        output: OutputMode::Discard,
        tail_limit: LIVE_TAIL_LIMIT,
        observer: Some(Arc::new(StereoTracker::new(Arc::clone(ctx)))),
        echo_diagnostics: false,
    };

    let mut pipeline = Pipeline::start(spec, cancel)?;
    info!(
        "[Hls] segmenting {} Hz at {} kbps into {}",
        tuning.freq_hz,
        bitrate_kbps,
        ctx.segment_dir.display()
    );
    let exit = pipeline.wait().await;
    let report = pipeline.shutdown().await;

    match exit? {
        PipelineExit::Cancelled => Ok(()),
        PipelineExit::Exited { role, status } => Err(report.unexpected_exit(role, status)),
    }
}
