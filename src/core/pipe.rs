//! Anonymous pipe pairs used to plumb console I/O.
//!
//! Both ends are wrapped in [`OwnedHandle`] the moment `CreatePipe` returns,
//! so every exit path of session setup closes whatever was allocated.

use std::fs::File;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};

use windows::Win32::Foundation::{SetHandleInformation, HANDLE, HANDLE_FLAGS, HANDLE_FLAG_INHERIT};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::Pipes::CreatePipe;

use super::error::{io_error, PtyError, Result};

/// Which end of a pipe is handed to the pseudo console / child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// A unidirectional pipe.
pub struct HandlePipe {
    pub read: OwnedHandle,
    pub write: OwnedHandle,
}

impl HandlePipe {
    /// Create a pipe whose `inheritable` end survives process creation.
    ///
    /// The opposite end is stripped of the inherit flag so it stays private
    /// to this process.
    pub fn create(inheritable: PipeEnd) -> Result<Self> {
        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: std::ptr::null_mut(),
            bInheritHandle: true.into(),
        };

        let mut read = HANDLE::default();
        let mut write = HANDLE::default();

        let pipe = unsafe {
            CreatePipe(&mut read, &mut write, Some(&attributes as *const _), 0)
                .map_err(|e| PtyError::Resource(io_error(&e)))?;

            Self {
                read: OwnedHandle::from_raw_handle(read.0 as RawHandle),
                write: OwnedHandle::from_raw_handle(write.0 as RawHandle),
            }
        };

        let private = match inheritable {
            PipeEnd::Read => &pipe.write,
            PipeEnd::Write => &pipe.read,
        };
        unsafe {
            SetHandleInformation(raw(private), HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0))
                .map_err(|e| PtyError::Resource(io_error(&e)))?;
        }

        Ok(pipe)
    }

    /// Split into `(read, write)` ends.
    pub fn into_ends(self) -> (OwnedHandle, OwnedHandle) {
        (self.read, self.write)
    }
}

/// Borrow an owned handle as a raw Win32 `HANDLE`.
pub(crate) fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle() as _)
}

/// Turn the end retained by the session into a blocking file stream.
pub(crate) fn into_file(handle: OwnedHandle) -> File {
    File::from(handle)
}
