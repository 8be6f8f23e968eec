pub mod channel;
pub mod engine;
pub mod packet;
pub mod redirector;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(not(target_os = "windows"))]
pub mod unsupported;

#[cfg(test)]
pub(crate) mod testing;

/// Diversion backend for the build target. Platforms without a backend get
/// a stub whose `open` fails.
#[cfg(target_os = "windows")]
pub type PlatformChannel = windows::WinDivertChannel;

#[cfg(not(target_os = "windows"))]
pub type PlatformChannel = unsupported::UnsupportedChannel;

pub use redirector::{Redirector, RedirectorError};
