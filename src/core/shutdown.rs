//! Process-wide console close hook
//!
//! Sessions register one cleanup callback each. When the hosting console is
//! closed abruptly (window close button, logoff) every registered callback
//! runs once. Callbacks are removed when a session tears down normally, and
//! sessions make their cleanup idempotent, so a late hook is harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::info;

use super::sync::lock;

type Callback = Box<dyn FnOnce() + Send>;

static GLOBAL: Lazy<HookRegistry> = Lazy::new(HookRegistry::new);

/// Token for a registered callback.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// A set of one-shot cleanup callbacks.
pub struct HookRegistry {
    hooks: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The registry wired to the console close event.
    pub fn global() -> &'static HookRegistry {
        install();
        &GLOBAL
    }

    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> HookId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.hooks).insert(id, Box::new(callback));
        HookId(id)
    }

    /// Remove a callback; returns false if it already ran or was removed.
    pub fn unregister(&self, id: HookId) -> bool {
        lock(&self.hooks).remove(&id.0).is_some()
    }

    /// Number of callbacks waiting to run.
    pub fn len(&self) -> usize {
        lock(&self.hooks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run and clear every registered callback.
    pub fn run_all(&self) -> usize {
        // drain first so a callback may unregister without deadlocking
        let hooks: Vec<Callback> = lock(&self.hooks).drain().map(|(_, hook)| hook).collect();
        let count = hooks.len();
        if count > 0 {
            info!(count, "running console close hooks");
        }
        for hook in hooks {
            hook();
        }
        count
    }
}

#[cfg(windows)]
fn install() {
    use std::sync::Once;
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::System::Console::{SetConsoleCtrlHandler, CTRL_CLOSE_EVENT};

    unsafe extern "system" fn handler(ctrl_type: u32) -> BOOL {
        if ctrl_type == CTRL_CLOSE_EVENT {
            GLOBAL.run_all();
        }
        // let the default handler run as well
        false.into()
    }

    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        if let Err(e) = SetConsoleCtrlHandler(Some(handler), true) {
            tracing::warn!("failed to install console close handler: {}", e);
        }
    });
}

#[cfg(not(windows))]
fn install() {}
