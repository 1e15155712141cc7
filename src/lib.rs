pub mod actions;
pub mod device;
pub mod error;
pub mod pilot;
pub mod predict;

pub use actions::{Action, ActionOutcome, ActionPayload};
pub use device::{SandboxClient, SandboxConfig, ScreenCapture, Session, SessionRegistry};
pub use error::DriveError;
pub use pilot::{Pilot, PilotConfig, RunOutcome};
pub use predict::{ComputerUseClient, ComputerUseConfig, Prediction, Predictor};
