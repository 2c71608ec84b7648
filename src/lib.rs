//Modules
mod cancellation;
pub mod channel;
mod functions;
mod implementations;
mod installer;
pub mod operations;
mod remote;
mod structures;
pub mod traits;
mod verifier;
mod verifier_builder;
mod worker;

pub use crate::cancellation::CancellationToken;
pub use crate::functions::admin_access_required;
pub use crate::installer::{LocalInstaller, ProgressSink};
pub use crate::remote::{ProgressSubscription, RemoteInstaller};
pub use crate::structures::{
  Error, InstallLocation, InstallTaskState, MissingPartGrouping, Part, PatchIndex, PatchSource,
  PatchSourceKey, ProcessPriority, ProgressEvent, Repository, SpeedEstimator, TargetFile,
  TargetStreamMode, VerifierProgress, VerifyState, BASE_GAME_VERSION,
};
pub use crate::traits::{ChunkCodec, RawChunkCodec};
pub use crate::verifier::{
  AttemptSchedule, Trust, Verifier, WorkerKind, MAX_CONCURRENT_CONNECTIONS_FOR_PATCH_SET,
  REATTEMPT_COUNT,
};
pub use crate::verifier_builder::VerifierBuilder;
#[cfg(unix)]
pub use crate::worker::run as run_worker;
pub use crate::worker::serve as serve_worker;

#[cfg(test)]
mod tests;
