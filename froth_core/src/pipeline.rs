//! The running system: sense loop, control loop, watchdog and optional
//! persistence sink, each on its own thread.
//!
//! Threads share nothing but `Arc`s to the shared state, the safety
//! supervisor, the latest-metrics slot, the queues and the actuator driver.
//! All sleeps are `recv_timeout` on a shutdown channel: dropping its sender
//! wakes every loop after its current tick.
//!
//! Shutdown order:
//! 1. drop the shutdown sender
//! 2. join control, watchdog, sense and sink threads
//! 3. stop every channel, release the pins and close the bus
//! 4. release the camera
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use eyre::WrapErr;
use froth_traits::{Camera, Classifier, Clock, MonotonicClock, PwmBus, Segmentation};
use tracing::{debug, error, info, trace, warn};

use crate::actuator::{ActuatorDriver, Channel};
use crate::analyze::{FrothAnalyzer, FrothMetrics};
use crate::config::FrothCfg;
use crate::detect::BlobDetector;
use crate::error::{AcquisitionError, BuildError, FrothError, Result};
use crate::handle::ControlHandle;
use crate::pi::PiController;
use crate::preprocess::Preprocessor;
use crate::queue::{FrameQueue, LatestSlot, MetricsQueue};
use crate::safety::SafetySupervisor;
use crate::source::{Frame, FrameSource};
use crate::state::{ControlParams, ControlState, Mode, SharedState};
use crate::util::period_from_hz;

/// Fire-and-forget persistence of completed metrics records.
pub trait MetricsSink {
    fn record(
        &mut self,
        metrics: &FrothMetrics,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub type DynCamera = Box<dyn Camera + Send>;
pub type DynBus = Box<dyn PwmBus + Send>;
pub type DynSegmentation = Box<dyn Segmentation + Send + Sync>;

pub type SharedDriver<B> = Arc<Mutex<ActuatorDriver<B>>>;

fn lock_driver<B: PwmBus>(d: &Mutex<ActuatorDriver<B>>) -> MutexGuard<'_, ActuatorDriver<B>> {
    d.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Sense loop ───────────────────────────────────────────────────────────────

/// One sense tick: acquire, analyse, publish.
pub struct SenseLoop<C: Camera, S: Segmentation> {
    source: FrameSource<C>,
    analyzer: FrothAnalyzer<S>,
    safety: Arc<SafetySupervisor>,
    shared: Arc<SharedState>,
    latest: Arc<LatestSlot<FrothMetrics>>,
    frames: FrameQueue<Frame>,
    metrics: MetricsQueue<FrothMetrics>,
    sink: Option<MetricsQueue<FrothMetrics>>,
    annotate: bool,
}

impl<C: Camera, S: Segmentation> SenseLoop<C, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: FrameSource<C>,
        analyzer: FrothAnalyzer<S>,
        safety: Arc<SafetySupervisor>,
        shared: Arc<SharedState>,
        latest: Arc<LatestSlot<FrothMetrics>>,
        frames: FrameQueue<Frame>,
        metrics: MetricsQueue<FrothMetrics>,
        sink: Option<MetricsQueue<FrothMetrics>>,
    ) -> Self {
        Self {
            source,
            analyzer,
            safety,
            shared,
            latest,
            frames,
            metrics,
            sink,
            annotate: false,
        }
    }

    /// Stream frames with the detected bubbles drawn on them.
    #[must_use]
    pub fn with_annotation(mut self, on: bool) -> Self {
        self.annotate = on;
        self
    }

    /// Run one tick. An acquisition error skips the tick without a
    /// heartbeat; a closed source gets one reopen attempt.
    pub fn tick(&mut self) -> std::result::Result<FrothMetrics, AcquisitionError> {
        let frame = match self.acquire() {
            Ok(f) => f,
            Err(e) => {
                self.publish_health();
                return Err(e);
            }
        };
        let analysis = self.analyzer.analyze_frame(&frame.image, frame.seq);
        let metrics = analysis.metrics;

        self.latest.store(metrics.clone());
        let healthy = self.source.is_healthy();
        let fps = self.source.frame_rate();
        let published = metrics.clone();
        self.shared.publish(move |s| {
            s.metrics = Some(published);
            s.sense_healthy = healthy;
            s.frame_rate = fps;
        });
        self.metrics.push(metrics.clone());
        if let Some(sink) = &self.sink {
            sink.push(metrics.clone());
        }
        if self.annotate {
            let image = self.analyzer.detector().annotate(&analysis.detection, &frame.image);
            self.frames.push(Frame { image, ..frame });
        } else {
            self.frames.push(frame);
        }
        self.safety.beat_sense();
        trace!(seq = metrics.seq, count = metrics.bubble_count, "sense tick");
        Ok(metrics)
    }

    fn acquire(&mut self) -> std::result::Result<Frame, AcquisitionError> {
        if !self.source.is_open() {
            self.source.try_reopen()?;
        }
        match self.source.read() {
            Ok(f) => Ok(f),
            Err(e @ AcquisitionError::Stale(_)) => {
                debug!(error = %e, "no fresh frame; tick skipped");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "frame acquisition failed; tick skipped");
                Err(e)
            }
        }
    }

    fn publish_health(&self) {
        let healthy = self.source.is_healthy();
        self.shared.publish(|s| s.sense_healthy = healthy);
    }

    pub fn source(&self) -> &FrameSource<C> {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut FrameSource<C> {
        &mut self.source
    }

    pub fn analyzer(&self) -> &FrothAnalyzer<S> {
        &self.analyzer
    }
}

// ── Control loop ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Duties were written; carries the frother duty.
    Applied { frother: f64 },
    /// The emergency stop is latched; nothing was written.
    Stopped,
}

/// One control tick: safety check, PI or manual duty, actuator writes.
pub struct ControlLoop<B: PwmBus> {
    pi: PiController,
    last_mode: Mode,
    last_epoch: u64,
    driver: SharedDriver<B>,
    safety: Arc<SafetySupervisor>,
    shared: Arc<SharedState>,
    latest: Arc<LatestSlot<FrothMetrics>>,
}

impl<B: PwmBus> ControlLoop<B> {
    pub fn new(
        pi: PiController,
        driver: SharedDriver<B>,
        safety: Arc<SafetySupervisor>,
        shared: Arc<SharedState>,
        latest: Arc<LatestSlot<FrothMetrics>>,
    ) -> Self {
        let params = shared.params();
        Self {
            pi,
            last_mode: params.mode,
            last_epoch: params.auto_epoch,
            driver,
            safety,
            shared,
            latest,
        }
    }

    /// `dt` is the time since the previous tick in seconds.
    pub fn tick(&mut self, dt: f64) -> TickOutcome {
        let params = self.shared.params();
        // Track transitions before the safety check so a stopped tick still
        // records the mode it saw.
        let entered_auto = params.mode == Mode::Auto && self.last_mode != Mode::Auto;
        if entered_auto {
            info!("entering AUTO; integral cleared");
            self.pi.reset();
        } else if params.auto_epoch != self.last_epoch {
            debug!(epoch = params.auto_epoch, "mode re-entered or stop cleared; integral cleared");
            self.pi.reset();
        }
        self.last_mode = params.mode;
        self.last_epoch = params.auto_epoch;

        if !self.safety.check() {
            self.publish(&params);
            return TickOutcome::Stopped;
        }

        let frother = match params.mode {
            Mode::Auto => {
                self.pi
                    .set_params(Some(params.kp), Some(params.ki), Some(params.setpoint));
                match self.latest.latest() {
                    Some(m) => self.pi.update(m.measured_value(), dt),
                    None => {
                        debug!("no metrics yet; frother held at 0");
                        0.0
                    }
                }
            }
            Mode::Manual => params.manual_duty,
        };

        {
            let mut driver = lock_driver(&self.driver);
            // The watchdog may have tripped since the check above.
            if !self.safety.is_safe_to_run() {
                drop(driver);
                self.publish(&params);
                return TickOutcome::Stopped;
            }
            let mut applied = frother;
            for channel in Channel::ALL {
                let want = if channel == Channel::Frother {
                    frother
                } else {
                    params.devices.get(channel)
                };
                match driver.set_duty_cycle(channel, want) {
                    Ok(d) if channel == Channel::Frother => applied = d,
                    Ok(_) => {}
                    Err(e) => debug!(%channel, error = %e, "duty not applied this tick"),
                }
            }
            drop(driver);
            self.safety.beat_control();
            self.publish(&params);
            trace!(frother = applied, integral = self.pi.integral(), "control tick");
            TickOutcome::Applied { frother: applied }
        }
    }

    fn publish(&self, params: &ControlParams) {
        let control = ControlState::from_params(params, self.pi.integral());
        let devices = lock_driver(&self.driver).device_state();
        let safety = self.safety.state();
        self.shared.publish(|s| {
            s.control = control;
            s.devices = devices;
            s.safety = safety;
        });
    }

    pub fn pi(&self) -> &PiController {
        &self.pi
    }
}

// ── Thread plumbing ──────────────────────────────────────────────────────────

/// Run `tick` every `period` until the shutdown channel disconnects.
/// Overruns start the next tick immediately and re-anchor the schedule.
fn run_periodic(
    name: &'static str,
    period: Duration,
    shutdown: &xch::Receiver<()>,
    clock: &dyn Clock,
    mut tick: impl FnMut(),
) {
    debug!(loop_name = name, period_ms = period.as_millis() as u64, "loop started");
    let mut next = clock.now();
    loop {
        tick();
        next += period;
        let now = clock.now();
        let wait = next.saturating_duration_since(now);
        if wait.is_zero() {
            trace!(loop_name = name, "tick overran its period");
            next = now;
        }
        match shutdown.recv_timeout(wait) {
            Err(xch::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(xch::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(loop_name = name, "loop stopped");
}

fn spawn_named<T: Send + 'static>(
    name: &str,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<JoinHandle<T>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .wrap_err_with(|| format!("spawning {name} thread"))
}

fn join_logged<T>(name: &str, handle: Option<JoinHandle<T>>) -> Option<T> {
    let h = handle?;
    match h.join() {
        Ok(v) => {
            trace!(thread = name, "joined");
            Some(v)
        }
        Err(e) => {
            error!(thread = name, ?e, "thread panicked");
            None
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    shutdown_tx: Option<xch::Sender<()>>,
    sense: Option<JoinHandle<SenseLoop<DynCamera, DynSegmentation>>>,
    control: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    sink: Option<JoinHandle<()>>,
    driver: SharedDriver<DynBus>,
    shared: Arc<SharedState>,
    handle: ControlHandle,
    stopped: bool,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder<Missing, Missing, Missing> {
        PipelineBuilder::default()
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    /// Stop everything in order. Returns the channels that could not be
    /// zeroed. Idempotent.
    pub fn shutdown(&mut self) -> Vec<Channel> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        info!("pipeline shutting down");
        drop(self.shutdown_tx.take());

        join_logged("control", self.control.take());
        join_logged("watchdog", self.watchdog.take());
        let sense = join_logged("sense", self.sense.take());
        join_logged("sink", self.sink.take());

        let (failed, devices) = {
            let mut d = lock_driver(&self.driver);
            (d.shutdown(), d.device_state())
        };
        if let Some(mut s) = sense {
            s.source_mut().release();
        }
        self.shared.publish(|s| {
            s.devices = devices;
            s.sense_healthy = false;
        });
        info!(
            estop = self.handle.is_estopped(),
            failed = failed.len(),
            "pipeline stopped"
        );
        failed
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ── Type-state builder ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

pub struct PipelineBuilder<C, B, S> {
    camera: Option<DynCamera>,
    bus: Option<DynBus>,
    segmentation: Option<DynSegmentation>,
    cfg: FrothCfg,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    classifier: Option<Box<dyn Classifier + Send + Sync>>,
    sink: Option<Box<dyn MetricsSink + Send>>,
    _c: PhantomData<C>,
    _b: PhantomData<B>,
    _s: PhantomData<S>,
}

impl Default for PipelineBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            camera: None,
            bus: None,
            segmentation: None,
            cfg: FrothCfg::default(),
            clock: None,
            classifier: None,
            sink: None,
            _c: PhantomData,
            _b: PhantomData,
            _s: PhantomData,
        }
    }
}

/// Chainable setters that do not affect type-state.
impl<C, B, S> PipelineBuilder<C, B, S> {
    pub fn with_config(mut self, cfg: FrothCfg) -> Self {
        self.cfg = cfg;
        self
    }
    /// Provide a custom clock; defaults to `MonotonicClock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }
    pub fn with_classifier(mut self, classifier: Box<dyn Classifier + Send + Sync>) -> Self {
        self.classifier = Some(classifier);
        self
    }
    pub fn with_sink(mut self, sink: impl MetricsSink + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    fn retype<C2, B2, S2>(self) -> PipelineBuilder<C2, B2, S2> {
        PipelineBuilder {
            camera: self.camera,
            bus: self.bus,
            segmentation: self.segmentation,
            cfg: self.cfg,
            clock: self.clock,
            classifier: self.classifier,
            sink: self.sink,
            _c: PhantomData,
            _b: PhantomData,
            _s: PhantomData,
        }
    }
}

// Setters that advance type-state
impl<B, S> PipelineBuilder<Missing, B, S> {
    pub fn with_camera(self, camera: impl Camera + Send + 'static) -> PipelineBuilder<Set, B, S> {
        let mut next = self.retype();
        next.camera = Some(Box::new(camera));
        next
    }
}

impl<C, S> PipelineBuilder<C, Missing, S> {
    pub fn with_bus(self, bus: impl PwmBus + Send + 'static) -> PipelineBuilder<C, Set, S> {
        let mut next = self.retype();
        next.bus = Some(Box::new(bus));
        next
    }
}

impl<C, B> PipelineBuilder<C, B, Missing> {
    pub fn with_segmentation(
        self,
        seg: impl Segmentation + Send + Sync + 'static,
    ) -> PipelineBuilder<C, B, Set> {
        let mut next = self.retype();
        next.segmentation = Some(Box::new(seg));
        next
    }
}

impl PipelineBuilder<Set, Set, Set> {
    /// Open the camera, start the actuators and spawn the loops.
    pub fn start(self) -> Result<Pipeline> {
        self.try_start()
    }
}

fn validate(cfg: &FrothCfg) -> std::result::Result<(), BuildError> {
    let p = &cfg.pipeline;
    if !(p.sense_rate_hz.is_finite() && p.sense_rate_hz > 0.0) {
        return Err(BuildError::InvalidConfig("sense rate must be > 0"));
    }
    if !(p.control_rate_hz.is_finite() && p.control_rate_hz > 0.0) {
        return Err(BuildError::InvalidConfig("control rate must be > 0"));
    }
    if cfg.safety.watchdog_timeout <= period_from_hz(p.control_rate_hz) {
        return Err(BuildError::InvalidConfig(
            "watchdog timeout must exceed the control period",
        ));
    }
    if cfg.analyzer.history == 0 {
        return Err(BuildError::InvalidConfig("history must be >= 1"));
    }
    if !(0.0..1.0).contains(&cfg.detector.distance_threshold) {
        return Err(BuildError::InvalidConfig("distance threshold must be in [0, 1)"));
    }
    let bk = cfg.detector.background_kernel;
    if bk % 2 == 0 || bk > 31 {
        return Err(BuildError::InvalidConfig("background kernel must be odd and <= 31"));
    }
    Ok(())
}

impl<C, B, S> PipelineBuilder<C, B, S> {
    /// Fallible start available in any type-state; reports missing pieces.
    pub fn try_start(self) -> Result<Pipeline> {
        let camera = self
            .camera
            .ok_or_else(|| eyre::Report::new(BuildError::MissingCamera))?;
        let bus = self
            .bus
            .ok_or_else(|| eyre::Report::new(BuildError::MissingBus))?;
        let seg = self
            .segmentation
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSegmentation))?;
        let cfg = self.cfg;
        validate(&cfg).map_err(eyre::Report::new)?;

        let clock: Arc<dyn Clock + Send + Sync> = match self.clock {
            Some(c) => c,
            None => Arc::new(MonotonicClock::new()),
        };

        let mut source = FrameSource::with_clock(camera, cfg.source.clone(), clock.clone());
        source
            .open()
            .map_err(FrothError::from)
            .wrap_err("opening camera")?;
        let driver = ActuatorDriver::start(bus, cfg.pins.clone())
            .map_err(FrothError::from)
            .wrap_err("starting actuators")?;
        let driver: SharedDriver<DynBus> = Arc::new(Mutex::new(driver));

        let safety = Arc::new(SafetySupervisor::with_clock(
            cfg.safety.watchdog_timeout,
            clock.clone(),
        ));
        let shared = Arc::new(SharedState::new(
            ControlParams::from(&cfg.control),
            safety.state(),
        ));
        register_stop(&safety, &driver, &shared);

        let latest = Arc::new(LatestSlot::new());
        let frames = FrameQueue::new(cfg.pipeline.frame_capacity);
        let metrics = MetricsQueue::new(cfg.pipeline.metrics_capacity);
        let sink_queue = self
            .sink
            .as_ref()
            .map(|_| MetricsQueue::new(cfg.pipeline.sink_capacity));

        let mut analyzer = FrothAnalyzer::new(
            Preprocessor::new(cfg.preprocess.clone()),
            BlobDetector::new(seg, cfg.detector.clone()),
            cfg.analyzer.clone(),
        );
        if let Some(model) = self.classifier {
            analyzer = analyzer.with_classifier(model);
        }
        let sense_loop = SenseLoop::new(
            source,
            analyzer,
            safety.clone(),
            shared.clone(),
            latest.clone(),
            frames.clone(),
            metrics.clone(),
            sink_queue.clone(),
        )
        .with_annotation(cfg.pipeline.annotate_frames);
        let pi = PiController::new(cfg.control.kp, cfg.control.ki, cfg.control.setpoint)
            .with_integral_limit(cfg.control.integral_limit);
        let control_loop = ControlLoop::new(
            pi,
            driver.clone(),
            safety.clone(),
            shared.clone(),
            latest.clone(),
        );

        let handle = ControlHandle::new(shared.clone(), safety.clone(), latest, frames, metrics);
        let (shutdown_tx, shutdown_rx) = xch::bounded::<()>(0);
        let mut pipeline = Pipeline {
            shutdown_tx: Some(shutdown_tx),
            sense: None,
            control: None,
            watchdog: None,
            sink: None,
            driver,
            shared,
            handle,
            stopped: false,
        };

        // Any spawn failure below drops `pipeline`, which shuts down what
        // already started.
        if let (Some(sink), Some(queue)) = (self.sink, sink_queue) {
            let rx = shutdown_rx.clone();
            pipeline.sink = Some(spawn_named("froth-sink", move || {
                run_sink(sink, &queue.receiver(), &rx);
            })?);
        }

        let sense_period = period_from_hz(cfg.pipeline.sense_rate_hz);
        let rx = shutdown_rx.clone();
        let c = clock.clone();
        pipeline.sense = Some(spawn_named("froth-sense", move || {
            let mut sense_loop = sense_loop;
            run_periodic("sense", sense_period, &rx, c.as_ref(), || {
                let _ = sense_loop.tick();
            });
            sense_loop
        })?);

        let control_period = period_from_hz(cfg.pipeline.control_rate_hz);
        let rx = shutdown_rx.clone();
        let c = clock.clone();
        pipeline.control = Some(spawn_named("froth-control", move || {
            let mut control_loop = control_loop;
            let mut last = c.now();
            run_periodic("control", control_period, &rx, c.as_ref(), || {
                let dt = c.secs_since(last);
                last = c.now();
                control_loop.tick(dt);
            });
        })?);

        let watch_period = (cfg.safety.watchdog_timeout / 4)
            .clamp(Duration::from_millis(10), Duration::from_millis(250));
        let rx = shutdown_rx;
        let sup = safety;
        pipeline.watchdog = Some(spawn_named("froth-watchdog", move || {
            run_periodic("watchdog", watch_period, &rx, clock.as_ref(), || {
                sup.check();
            });
        })?);

        info!(
            sense_hz = cfg.pipeline.sense_rate_hz,
            control_hz = cfg.pipeline.control_rate_hz,
            mode = %cfg.control.mode,
            "pipeline started"
        );
        Ok(pipeline)
    }
}

/// Emergency stop action: zero every channel under the driver lock, then
/// publish. Holds only a weak reference to the supervisor that owns it.
fn register_stop<B: PwmBus + Send + 'static>(
    safety: &Arc<SafetySupervisor>,
    driver: &SharedDriver<B>,
    shared: &Arc<SharedState>,
) {
    let driver = Arc::clone(driver);
    let shared = Arc::clone(shared);
    let weak: Weak<SafetySupervisor> = Arc::downgrade(safety);
    safety.register_stop_callback(move || {
        let (failed, devices) = {
            let mut d = lock_driver(&driver);
            (d.stop_all(), d.device_state())
        };
        if !failed.is_empty() {
            error!(?failed, "emergency stop could not zero every channel");
        }
        let safety_state = weak.upgrade().map(|s| s.state());
        shared.publish(|s| {
            s.devices = devices;
            if let Some(st) = safety_state {
                s.safety = st;
            }
        });
    });
}

fn run_sink(
    mut sink: Box<dyn MetricsSink + Send>,
    rx: &xch::Receiver<FrothMetrics>,
    shutdown: &xch::Receiver<()>,
) {
    let mut record = |m: &FrothMetrics| {
        if let Err(e) = sink.record(m) {
            warn!(seq = m.seq, error = %e, "metrics sink write failed");
        }
    };
    loop {
        xch::select! {
            recv(rx) -> msg => match msg {
                Ok(m) => record(&m),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                for m in rx.try_iter() {
                    record(&m);
                }
                break;
            }
        }
    }
    debug!("metrics sink stopped");
}
