//! Child processes attached to a pseudo console.

use std::time::Duration;

use super::error::Result;

/// A hosted process as seen by a session.
pub trait Child: Send + Sync {
    fn pid(&self) -> u32;

    /// Block until the process exits and return its exit code.
    fn wait(&self) -> Result<u32>;

    /// Wait up to `timeout`; `None` if the process is still running.
    fn wait_timeout(&self, timeout: Duration) -> Result<Option<u32>>;

    /// Exit code if the process has already exited.
    fn try_wait(&self) -> Result<Option<u32>> {
        self.wait_timeout(Duration::ZERO)
    }

    /// Forcibly end the process.
    fn terminate(&self) -> Result<()>;
}

#[cfg(windows)]
pub use self::native::{AttributeList, ChildProcess, ChildProcessLauncher};

#[cfg(windows)]
mod native {
    use std::io;
    use std::os::windows::io::{FromRawHandle, OwnedHandle, RawHandle};
    use std::time::Duration;

    use tracing::{debug, info};
    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::{WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Console::HPCON;
    use windows::Win32::System::Threading::{
        CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
        InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
        WaitForSingleObject, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
        LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, STARTUPINFOEXW,
    };

    use super::Child;
    use crate::core::console::PseudoConsole;
    use crate::core::error::{io_error, os_code, PtyError, Result};
    use crate::core::pipe::raw;

    const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

    /// An initialized process/thread attribute list.
    ///
    /// The backing buffer is sized by asking the OS first, and the list is
    /// deleted and freed on drop.
    pub struct AttributeList {
        buffer: Vec<usize>,
    }

    impl AttributeList {
        /// Allocate a list able to hold exactly `count` attributes.
        pub fn with_capacity(count: u32) -> Result<Self> {
            let mut size: usize = 0;
            let probe = unsafe {
                InitializeProcThreadAttributeList(
                    LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                    count,
                    0,
                    &mut size,
                )
            };
            // The probe only reports the size; it is expected to fail.
            if probe.is_ok() || size == 0 {
                return Err(PtyError::AttributeSetup {
                    reason: "could not calculate the size of the attribute list".to_string(),
                });
            }

            let word = std::mem::size_of::<usize>();
            let mut buffer = vec![0usize; (size + word - 1) / word];
            unsafe {
                InitializeProcThreadAttributeList(
                    LPPROC_THREAD_ATTRIBUTE_LIST(buffer.as_mut_ptr() as *mut _),
                    count,
                    0,
                    &mut size,
                )
            }
            .map_err(|e| PtyError::AttributeSetup {
                reason: format!("could not initialize the attribute list: {}", e),
            })?;

            Ok(Self { buffer })
        }

        fn as_raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
            LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut _)
        }

        /// Bind the pseudo console the child will be attached to.
        pub fn set_pseudo_console(&mut self, hpc: HPCON) -> Result<()> {
            unsafe {
                UpdateProcThreadAttribute(
                    self.as_raw(),
                    0,
                    PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                    Some(hpc.0 as *const _),
                    std::mem::size_of::<HPCON>(),
                    None,
                    None,
                )
            }
            .map_err(|e| PtyError::AttributeSetup {
                reason: format!("could not set the pseudo console attribute: {}", e),
            })
        }
    }

    impl Drop for AttributeList {
        fn drop(&mut self) {
            unsafe { DeleteProcThreadAttributeList(self.as_raw()) };
        }
    }

    /// Process and primary thread handles of a launched child.
    pub struct ChildProcess {
        process: OwnedHandle,
        _thread: OwnedHandle,
        pid: u32,
    }

    impl ChildProcess {
        /// Take ownership of the handles in `info`.
        ///
        /// # Safety
        /// `info` must come from a successful `CreateProcessW` call and its
        /// handles must not be owned by anything else.
        unsafe fn from_info(info: PROCESS_INFORMATION) -> Self {
            Self {
                process: OwnedHandle::from_raw_handle(info.hProcess.0 as RawHandle),
                _thread: OwnedHandle::from_raw_handle(info.hThread.0 as RawHandle),
                pid: info.dwProcessId,
            }
        }

        fn exit_code(&self) -> Result<u32> {
            let mut exit_code: u32 = 0;
            unsafe { GetExitCodeProcess(raw(&self.process), &mut exit_code) }
                .map_err(|e| PtyError::Wait(io_error(&e)))?;
            Ok(exit_code)
        }

        fn wait_ms(&self, ms: u32) -> Result<Option<u32>> {
            let result = unsafe { WaitForSingleObject(raw(&self.process), ms) };
            if result == WAIT_OBJECT_0 {
                self.exit_code().map(Some)
            } else if result == WAIT_TIMEOUT {
                Ok(None)
            } else {
                Err(PtyError::Wait(io::Error::last_os_error()))
            }
        }
    }

    impl Child for ChildProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn wait(&self) -> Result<u32> {
            loop {
                if let Some(code) = self.wait_ms(INFINITE)? {
                    return Ok(code);
                }
            }
        }

        fn wait_timeout(&self, timeout: Duration) -> Result<Option<u32>> {
            let ms = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
            self.wait_ms(ms)
        }

        fn terminate(&self) -> Result<()> {
            debug!(pid = self.pid, "terminating child process");
            unsafe { TerminateProcess(raw(&self.process), 1) }
                .map_err(|e| PtyError::Wait(io_error(&e)))
        }
    }

    /// Launches processes attached to a pseudo console.
    pub struct ChildProcessLauncher;

    impl ChildProcessLauncher {
        /// Start `command_line` attached to `console`.
        ///
        /// The console cannot be disposed while this runs.
        pub fn start(command_line: &str, console: &PseudoConsole) -> Result<ChildProcess> {
            console.with_handle(|hpc| {
                let mut attributes = AttributeList::with_capacity(1)?;
                attributes.set_pseudo_console(hpc)?;

                let mut startup_info = STARTUPINFOEXW {
                    StartupInfo: unsafe { std::mem::zeroed() },
                    lpAttributeList: attributes.as_raw(),
                };
                startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

                // CreateProcessW may rewrite the command line in place
                let mut cmd_wide: Vec<u16> = command_line
                    .encode_utf16()
                    .chain(std::iter::once(0))
                    .collect();
                let mut process_info = PROCESS_INFORMATION::default();

                unsafe {
                    CreateProcessW(
                        PCWSTR::null(),
                        PWSTR(cmd_wide.as_mut_ptr()),
                        None,
                        None,
                        false,
                        EXTENDED_STARTUPINFO_PRESENT,
                        None,
                        PCWSTR::null(),
                        &startup_info.StartupInfo,
                        &mut process_info,
                    )
                    .map_err(|e| PtyError::ProcessCreation { code: os_code(&e) })?;
                }

                let child = unsafe { ChildProcess::from_info(process_info) };
                info!(pid = child.pid, command = command_line, "spawned child process");
                Ok(child)
            })
        }
    }
}
