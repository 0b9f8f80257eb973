//! Exposure container and visit list readers

pub mod exposure_file;
pub mod poller;

pub use exposure_file::{ExposureFile, UpdateHandle};
pub use poller::{parse_poller, read_poller_file};
