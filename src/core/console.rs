//! Pseudo console device
//!
//! [`Console`] is the contract a session holds its device through;
//! [`PseudoConsole`] is the ConPTY implementation of it.

use super::error::Result;

/// Console size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleSize {
    pub cols: u16,
    pub rows: u16,
}

impl ConsoleSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for ConsoleSize {
    fn default() -> Self {
        Self::new(80, 30)
    }
}

/// A virtual terminal device bound to a session's pipes.
///
/// Disposing the device must close its ends of the session pipes, so a
/// reader blocked on the output pipe observes end-of-stream.
pub trait Console: Send + Sync {
    /// Resize the device. Fails with `DeviceClosed` once disposed.
    fn resize(&self, size: ConsoleSize) -> Result<()>;

    /// Release the device. Further calls are no-ops.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// Size last applied to the device.
    fn size(&self) -> ConsoleSize;
}

#[cfg(windows)]
pub use self::native::PseudoConsole;

#[cfg(windows)]
mod native {
    use std::os::windows::io::OwnedHandle;
    use std::sync::Mutex;

    use tracing::debug;
    use windows::Win32::System::Console::{
        ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
    };

    use super::{Console, ConsoleSize};
    use crate::core::error::{os_code, PtyError, Result};
    use crate::core::pipe::raw;
    use crate::core::sync::lock;

    struct State {
        hpc: Option<HPCON>,
        size: ConsoleSize,
    }

    /// ConPTY handle wrapper
    pub struct PseudoConsole {
        state: Mutex<State>,
    }

    // Safety: HPCON is an opaque kernel reference; every use goes through the
    // mutex, and ConPTY calls are safe from any thread.
    unsafe impl Send for PseudoConsole {}
    unsafe impl Sync for PseudoConsole {}

    fn coord(size: ConsoleSize) -> COORD {
        COORD {
            X: size.cols as i16,
            Y: size.rows as i16,
        }
    }

    impl PseudoConsole {
        /// Create a pseudo console reading `input_read` and writing `output_write`.
        ///
        /// The device duplicates both handles, so they are closed here once
        /// creation returns; the caller keeps the opposite ends.
        pub fn create(
            input_read: OwnedHandle,
            output_write: OwnedHandle,
            size: ConsoleSize,
        ) -> Result<Self> {
            let hpc = unsafe {
                CreatePseudoConsole(coord(size), raw(&input_read), raw(&output_write), 0)
                    .map_err(|e| PtyError::DeviceCreation { code: os_code(&e) })?
            };
            drop(input_read);
            drop(output_write);

            debug!(cols = size.cols, rows = size.rows, "pseudo console created");
            Ok(Self {
                state: Mutex::new(State {
                    hpc: Some(hpc),
                    size,
                }),
            })
        }

        /// Run `f` with the raw device handle, holding off disposal until it
        /// returns. Fails with `DeviceClosed` once disposed.
        pub(crate) fn with_handle<R>(&self, f: impl FnOnce(HPCON) -> Result<R>) -> Result<R> {
            let state = lock(&self.state);
            let hpc = state.hpc.ok_or(PtyError::DeviceClosed)?;
            f(hpc)
        }
    }

    impl Console for PseudoConsole {
        fn resize(&self, size: ConsoleSize) -> Result<()> {
            let mut state = lock(&self.state);
            let hpc = state.hpc.ok_or(PtyError::DeviceClosed)?;

            unsafe {
                ResizePseudoConsole(hpc, coord(size))
                    .map_err(|e| PtyError::Resize { code: os_code(&e) })?;
            }

            state.size = size;
            Ok(())
        }

        fn dispose(&self) {
            if let Some(hpc) = lock(&self.state).hpc.take() {
                unsafe { ClosePseudoConsole(hpc) };
                debug!("pseudo console closed");
            }
        }

        fn is_disposed(&self) -> bool {
            lock(&self.state).hpc.is_none()
        }

        fn size(&self) -> ConsoleSize {
            lock(&self.state).size
        }
    }

    impl Drop for PseudoConsole {
        fn drop(&mut self) {
            self.dispose();
        }
    }
}
