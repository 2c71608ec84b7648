pub mod error;
pub use error::Error;

pub mod repository;
pub use repository::{Repository, BASE_GAME_VERSION, EXPAC_VERSION_BOOT};

pub mod patch_index;
pub use patch_index::{PatchIndex, Part, TargetFile};

pub mod patch_source;
pub use patch_source::{InstallLocation, PatchSource, PatchSourceKey};

pub mod progress;
pub use progress::{InstallTaskState, ProgressEvent, SpeedEstimator, VerifierProgress, VerifyState};

pub mod rpc;
pub use rpc::{Frame, MissingPartGrouping, Opcode, ProcessPriority, TargetStreamMode};
pub(crate) use rpc::{EVENT_CORRELATION_ID, PROTOCOL_VERSION};
