pub(crate) mod binary;
pub(crate) mod download_ranges;
pub(crate) mod elevation_probe;
pub(crate) mod fetch_metadata;
pub(crate) mod get_hash;

pub use elevation_probe::admin_access_required;
