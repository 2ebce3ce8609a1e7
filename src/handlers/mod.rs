pub mod audio_files;
pub mod config;

pub use audio_files::*;
pub use config::*;
