pub mod config;
pub mod folder;
pub mod log;
pub mod note;
pub mod sync;
