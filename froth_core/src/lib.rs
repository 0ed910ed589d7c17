#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Froth flotation sensing, control and safety (hardware-agnostic).
//!
//! All hardware goes through `froth_traits::Camera` and `froth_traits::PwmBus`;
//! image segmentation through `froth_traits::Segmentation`.
//!
//! ## Architecture
//!
//! - **Sensing**: `FrameSource` → `Preprocessor` → `BlobDetector` → `FrothAnalyzer`
//! - **Control**: `PiController` on the bubble count, `ActuatorDriver` on four PWM channels
//! - **Safety**: `SafetySupervisor` watches the sense and control heartbeats and
//!   latches an emergency stop that only an operator can clear
//! - **Runtime**: `Pipeline` runs the loops on their own threads; `ControlHandle`
//!   is the only way in from outside

pub mod actuator;
pub mod analyze;
pub mod config;
pub mod conversions;
pub mod detect;
pub mod error;
pub mod geometry;
pub mod handle;
pub mod hw_error;
pub mod mocks;
pub mod pi;
pub mod pipeline;
pub mod preprocess;
pub mod queue;
pub mod safety;
pub mod source;
pub mod state;
pub mod util;

pub use actuator::{ActuatorDriver, Channel, DeviceState, clamp_duty};
pub use analyze::{Analysis, FrothAnalyzer, FrothMetrics, History};
pub use config::{
    AnalyzerCfg, ChannelPins, ControlCfg, DetectorCfg, FrothCfg, PipelineCfg, PreprocessCfg,
    SafetyCfg, SourceCfg, StabilityWeights,
};
pub use detect::{Blob, BlobDetector, BlobSet, BlobSummary, Detection, Diagnostics};
pub use error::{
    AcquisitionError, BuildError, ControlError, FrothError, Report, Result, StartupError,
};
pub use handle::ControlHandle;
pub use pi::PiController;
pub use pipeline::{
    ControlLoop, MetricsSink, Pipeline, PipelineBuilder, SenseLoop, TickOutcome,
};
pub use preprocess::{Preprocessed, Preprocessor};
pub use queue::{FrameQueue, LatestSlot, MetricsQueue};
pub use safety::{EstopReason, SafetyState, SafetySupervisor};
pub use source::{Frame, FrameSource};
pub use state::{ControlParams, ControlState, Mode, SharedSnapshot, SharedState};
