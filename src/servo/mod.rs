//! Visual servoing: search for the target, center it, approach it and commit
//! to a blind grasp once it is inside the camera's close-range blind zone.

mod controller;
mod session;
mod state;

pub use controller::{PhaseLimit, ServoController, ServoRig, ServoSettings, ServoingSession};
pub use session::{CompletionHook, FeedFactory, ServoControl, ServoingService};
pub use state::{AlignAxis, FailureReason, Phase, ServoState, ServoStatus};
