mod error;
mod patch_index;
mod patch_source;
mod progress;
mod repository;
pub(crate) mod rpc;
