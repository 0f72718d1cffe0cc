//! Testing utilities for the streaming pipeline
//!
//! Synthetic JPEG frames plus fakes for the camera module, host hardware,
//! legacy daemon and alert/crash sinks, so the supervisor can be driven
//! end to end without a camera attached.

pub mod fakes;
pub mod synthetic_data;

pub use fakes::{
    test_context, FakeCamera, FakeHardware, FakeLegacyDaemon, RecordingAlertSink,
    RecordingCrashReporter,
};
pub use synthetic_data::{synthetic_frame, synthetic_jpeg};
