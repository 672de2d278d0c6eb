//! conterm - host console programs on a Windows pseudo console
//!
//! A [`TerminalSession`] launches a command line attached to a ConPTY
//! device, streams everything the program prints as [`SessionEvent`]s,
//! forwards input to it, and tears the device, process and pipes down in a
//! fixed order when the program exits or the session is closed.
//!
//! ```no_run
//! use conterm::{ConsoleSize, SessionEvent, SessionOptions, TerminalSession};
//!
//! let session = TerminalSession::new(SessionOptions::default());
//! let events = session.subscribe();
//!
//! let runner = session.clone();
//! let handle = std::thread::spawn(move || runner.start("cmd.exe", ConsoleSize::default(), true));
//!
//! for event in events {
//!     match event {
//!         SessionEvent::Ready => {
//!             session.write_str("echo hello\r").unwrap();
//!             session.write_str("exit\r").unwrap();
//!         }
//!         SessionEvent::Output(text) => print!("{}", text),
//!         SessionEvent::Exited(_) => break,
//!     }
//! }
//! handle.join().unwrap().unwrap();
//! println!("{}", session.console_text(true));
//! ```
//!
//! Sessions only launch processes on Windows. Elsewhere, preview mode and
//! custom [`Launcher`]s still work.

pub mod config;
pub mod core;
pub mod text;

pub use crate::config::{Config, SessionOptions};
pub use crate::core::console::{Console, ConsoleSize};
pub use crate::core::error::{PtyError, Result};
pub use crate::core::process::Child;
pub use crate::core::pty::{ConPtyLauncher, Connection, Launcher};
pub use crate::core::session::{Interceptor, SessionEvent, SessionState, TerminalSession};
