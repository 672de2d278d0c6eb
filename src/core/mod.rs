//! Core pseudo console components.
//!
//! - **console**: the device (`Console` trait, ConPTY `PseudoConsole`)
//! - **process**: the hosted child (`Child` trait, process launching)
//! - **pty**: wiring pipes, device and child into a `Connection`
//! - **session**: `TerminalSession`, the lifecycle on top of a connection
//! - **shutdown**: cleanup callbacks for an abruptly closed console
//!
//! # Architecture
//!
//! ```text
//! TerminalSession
//! ├── Connection (from a Launcher)
//! │   ├── Console (pseudo console device)
//! │   ├── Child (hosted process)
//! │   ├── input  (session → child pipe)
//! │   └── output (child → session pipe, drained by the read loop)
//! └── transcript + event subscribers
//! ```

pub mod console;
pub mod error;
#[cfg(windows)]
pub mod pipe;
pub mod process;
pub mod pty;
pub mod session;
pub mod shutdown;
mod sync;
