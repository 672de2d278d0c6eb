//! Launching a process on a pseudo console
//!
//! A [`Launcher`] turns a command line into a live [`Connection`]: the device,
//! the hosted child, and the session's ends of the input and output pipes.
//! [`ConPtyLauncher`] is the Windows implementation; other launchers can be
//! supplied to host transports created elsewhere.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use super::console::{Console, ConsoleSize};
use super::error::Result;
use super::process::Child;

/// Everything a running session talks to.
pub struct Connection {
    pub console: Arc<dyn Console>,
    /// Absent when the process is not owned by the session.
    pub child: Option<Arc<dyn Child>>,
    /// Session → child.
    pub input: Box<dyn Write + Send>,
    /// Child → session.
    pub output: Box<dyn Read + Send>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("size", &self.console.size())
            .field("pid", &self.child.as_ref().map(|c| c.pid()))
            .finish_non_exhaustive()
    }
}

/// Creates connections for sessions.
pub trait Launcher: Send + Sync {
    fn launch(&self, command: &str, size: ConsoleSize) -> Result<Connection>;
}

/// Launches children on a Windows pseudo console.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConPtyLauncher;

#[cfg(windows)]
impl Launcher for ConPtyLauncher {
    fn launch(&self, command: &str, size: ConsoleSize) -> Result<Connection> {
        use super::console::PseudoConsole;
        use super::pipe::{into_file, HandlePipe, PipeEnd};
        use super::process::ChildProcessLauncher;

        // Input pipe (we write, PTY reads)
        let (input_read, input_write) = HandlePipe::create(PipeEnd::Read)?.into_ends();
        // Output pipe (PTY writes, we read)
        let (output_read, output_write) = HandlePipe::create(PipeEnd::Write)?.into_ends();

        let console = PseudoConsole::create(input_read, output_write, size)?;
        // On failure `console` drops here and closes the device before the
        // retained pipe ends go.
        let child = ChildProcessLauncher::start(command, &console)?;

        Ok(Connection {
            console: Arc::new(console),
            child: Some(Arc::new(child)),
            input: Box::new(into_file(input_write)),
            output: Box::new(into_file(output_read)),
        })
    }
}

#[cfg(not(windows))]
impl Launcher for ConPtyLauncher {
    fn launch(&self, _command: &str, _size: ConsoleSize) -> Result<Connection> {
        Err(super::error::PtyError::Unsupported)
    }
}
