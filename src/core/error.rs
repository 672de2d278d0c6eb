//! Error types shared by the pseudo console layers.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to create pipe: {0}")]
    Resource(#[source] io::Error),

    #[error("Failed to create pseudo console (os error {code:#010x})")]
    DeviceCreation { code: i32 },

    #[error("Failed to resize pseudo console (os error {code:#010x})")]
    Resize { code: i32 },

    #[error("Pseudo console has been closed")]
    DeviceClosed,

    #[error("Failed to set up process attribute list: {reason}")]
    AttributeSetup { reason: String },

    #[error("Failed to spawn process (os error {code})")]
    ProcessCreation { code: i32 },

    #[error("Session has already been started")]
    AlreadyStarted,

    #[error("There is no writer attached to a pseudo console; start the session first")]
    NotStarted,

    #[error("Console input channel is closed")]
    NotConnected,

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("Pseudo consoles are only supported on Windows")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Extract the Win32 error code carried by a `windows` error.
///
/// HRESULTs in the Win32 facility (`0x8007xxxx`) are unwrapped to the raw
/// code; anything else is returned as the HRESULT bit pattern.
#[cfg(windows)]
pub(crate) fn os_code(err: &windows::core::Error) -> i32 {
    let hr = err.code().0;
    if (hr as u32) & 0xFFFF_0000 == 0x8007_0000 {
        hr & 0xFFFF
    } else {
        hr
    }
}

#[cfg(windows)]
pub(crate) fn io_error(err: &windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(os_code(err))
}
