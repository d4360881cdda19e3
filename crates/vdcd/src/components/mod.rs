//! Device components: output channels and containers, button inputs, binary
//! inputs, sensors. This layer carries most of the protocol's invariants and
//! all of the hardware bridging; entities compose components, components
//! never reach back into entities.

pub mod binary_input;
pub mod button_input;
pub mod output;
pub mod output_channel;
pub mod sensor;

pub use binary_input::BinaryInput;
pub use button_input::{ButtonInput, ButtonMode};
pub use output::{DimCommand, DimDirection, DimHandler, Output, OutputFunction, OutputMode};
pub use output_channel::{HardwareCallback, OutputChannel};
pub use sensor::{Sensor, SensorCallback};

use thiserror::Error;

/// Validation failures raised by component state writes.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("invalid click type {0}: must be 0-14 or 255")]
    InvalidClickType(u8),

    #[error("invalid action mode {0}: must be 0 (normal), 1 (force) or 2 (undo)")]
    InvalidActionMode(u8),
}
