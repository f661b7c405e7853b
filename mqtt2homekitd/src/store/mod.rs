pub mod file;
pub mod snapshot;
