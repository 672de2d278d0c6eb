//! Session management
//!
//! A [`TerminalSession`] hosts one command line on a pseudo console. It owns
//! the device, the child process and both pipe ends, runs a background
//! thread that drains the output pipe, and publishes everything it reads as
//! [`SessionEvent`]s.
//!
//! # Lifecycle
//!
//! ```text
//! Unstarted ──start──▶ Starting ──launch ok──▶ Running ──exit/close──▶ Closed
//!                          └────────launch failed──────────────────────▲
//! ```
//!
//! Teardown always runs in the same order: close the input writer, wait for
//! (or terminate) the child, dispose the device, then release the output
//! pipe end by joining the read loop. Closing the device is what makes the
//! read loop see end-of-stream.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Once, TryLockError, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, info, trace, warn};

use super::console::{Console, ConsoleSize};
use super::error::{PtyError, Result};
use super::process::Child;
use super::pty::{ConPtyLauncher, Connection, Launcher};
use super::shutdown::{HookId, HookRegistry};
use super::sync::lock;
use crate::config::SessionOptions;
use crate::text::{self, Utf8Stream};

/// Output published by the read loop in preview mode.
pub const PREVIEW_BANNER: &str = "conterm preview:> console output appears here\r\n";

/// Session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The console is hooked up and ready for input.
    Ready,
    /// Output for the display surface, escape sequences included.
    Output(String),
    /// The session was torn down; carries the child's exit code if known.
    Exited(Option<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Starting,
    Running,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unstarted,
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Closed,
        }
    }
}

/// Hook run on every input or output chunk before delivery.
///
/// The hook may rewrite the chunk in place; leaving it empty suppresses it.
pub type Interceptor = Box<dyn FnMut(&mut Vec<u8>) + Send>;

/// Holds an interceptor that runs with the slot unlocked, so the hook may
/// call back into the session (uninstall itself, write input, close).
#[derive(Default)]
struct HookSlot {
    installed: Mutex<Option<Arc<HookCell>>>,
}

struct HookCell {
    hook: Mutex<Interceptor>,
    running_on: Mutex<Option<ThreadId>>,
}

impl HookSlot {
    fn set(&self, hook: Option<Interceptor>) {
        *lock(&self.installed) = hook.map(|hook| {
            Arc::new(HookCell {
                hook: Mutex::new(hook),
                running_on: Mutex::new(None),
            })
        });
    }

    /// Run the installed hook over `chunk`.
    ///
    /// A chunk the hook itself sends back into the session passes through
    /// unhooked.
    fn apply(&self, chunk: &mut Vec<u8>) {
        let Some(cell) = lock(&self.installed).clone() else {
            return;
        };
        let current = thread::current().id();
        if *lock(&cell.running_on) == Some(current) {
            return;
        }

        let mut guard = lock(&cell.hook);
        *lock(&cell.running_on) = Some(current);
        let hook: &mut Interceptor = &mut guard;
        hook(chunk);
        *lock(&cell.running_on) = None;
    }
}

enum InputChannel {
    Unattached,
    Open(Box<dyn Write + Send>),
    Closed,
}

impl InputChannel {
    fn close(&mut self) {
        if let InputChannel::Open(mut writer) = std::mem::replace(self, InputChannel::Closed) {
            let _ = writer.flush();
            debug!("input channel closed");
        }
    }
}

struct Inner {
    options: SessionOptions,
    launcher: Arc<dyn Launcher>,
    state: AtomicU8,
    started: AtomicBool,
    read_loop_started: AtomicBool,
    read_only: AtomicBool,
    killed: AtomicBool,
    tearing_down: AtomicBool,
    console: Mutex<Option<Arc<dyn Console>>>,
    child: Mutex<Option<Arc<dyn Child>>>,
    input: Mutex<InputChannel>,
    output: Mutex<Option<Box<dyn Read + Send>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_id: Mutex<Option<ThreadId>>,
    transcript: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
    output_hook: HookSlot,
    input_hook: HookSlot,
    registry: &'static HookRegistry,
    close_hook: Mutex<Option<HookId>>,
    /// Set first thing in teardown; a connection is only installed under it.
    closed: Mutex<bool>,
    teardown: Once,
}

/// A console program hosted on a pseudo console.
///
/// Cloning yields another handle to the same session. `start` blocks until
/// the child exits, so it is normally called on a dedicated thread while
/// other handles write input, resize and subscribe to events.
#[derive(Clone)]
pub struct TerminalSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("state", &self.state())
            .field("size", &self.size())
            .field("pid", &self.pid())
            .finish()
    }
}

impl Default for TerminalSession {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl TerminalSession {
    /// Create a session that launches children on a ConPTY device.
    pub fn new(options: SessionOptions) -> Self {
        Self::with_launcher(options, Arc::new(ConPtyLauncher))
    }

    /// Create a session that gets its connection from `launcher`.
    pub fn with_launcher(options: SessionOptions, launcher: Arc<dyn Launcher>) -> Self {
        Self::with_registry(options, launcher, HookRegistry::global())
    }

    /// Like [`with_launcher`](TerminalSession::with_launcher), registering
    /// the console close hook in `registry`.
    pub(crate) fn with_registry(
        options: SessionOptions,
        launcher: Arc<dyn Launcher>,
        registry: &'static HookRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                launcher,
                state: AtomicU8::new(SessionState::Unstarted as u8),
                started: AtomicBool::new(false),
                read_loop_started: AtomicBool::new(false),
                read_only: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                tearing_down: AtomicBool::new(false),
                console: Mutex::new(None),
                child: Mutex::new(None),
                input: Mutex::new(InputChannel::Unattached),
                output: Mutex::new(None),
                reader: Mutex::new(None),
                reader_id: Mutex::new(None),
                transcript: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                output_hook: HookSlot::default(),
                input_hook: HookSlot::default(),
                registry,
                close_hook: Mutex::new(None),
                closed: Mutex::new(false),
                teardown: Once::new(),
            }),
        }
    }

    /// Wrap a connection that is already running.
    ///
    /// The session counts as started; call [`start_read_loop`] once
    /// subscribers are in place and [`close`] when done.
    ///
    /// [`start_read_loop`]: TerminalSession::start_read_loop
    /// [`close`]: TerminalSession::close
    pub fn attach(options: SessionOptions, connection: Connection, log_output: bool) -> Self {
        let session = Self::new(options);
        session.inner.started.store(true, Ordering::SeqCst);
        if log_output {
            *lock(&session.inner.transcript) = Some(String::new());
        }
        {
            let _closed = lock(&session.inner.closed);
            session.inner.install(connection);
            session.register_close_hook();
            session.inner.set_state(SessionState::Running);
        }
        session
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Launch `command` and block until it exits.
    ///
    /// Publishes [`SessionEvent::Ready`] once the child runs, starts the read
    /// loop, waits for the child, then tears the session down and publishes
    /// [`SessionEvent::Exited`]. Returns the exit code, or `None` when no
    /// child was launched (preview mode, or a launcher without a child).
    pub fn start(&self, command: &str, size: ConsoleSize, log_output: bool) -> Result<Option<u32>> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(PtyError::AlreadyStarted);
        }
        inner.set_state(SessionState::Starting);
        if log_output {
            *lock(&inner.transcript) = Some(String::new());
        }

        if inner.options.preview {
            info!(command, "preview mode, not launching");
            if inner.advance(SessionState::Starting, SessionState::Running) {
                inner.emit(SessionEvent::Ready);
            }
            return Ok(None);
        }

        let connection = match inner.launcher.launch(command, size) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(command, "failed to start session: {}", e);
                inner.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        let child = connection.child.clone();
        {
            let closed = lock(&inner.closed);
            if *closed {
                drop(closed);
                // closed while launching; nothing else will tear this down
                discard(connection);
                return Ok(None);
            }
            inner.install(connection);
            self.register_close_hook();
            inner.advance(SessionState::Starting, SessionState::Running);
            inner.emit(SessionEvent::Ready);
        }
        self.start_read_loop();

        let exit_code = match &child {
            Some(child) => match child.wait() {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!("failed to wait for child: {}", e);
                    None
                }
            },
            None => {
                inner.join_reader();
                None
            }
        };

        inner.teardown();
        Ok(exit_code)
    }

    /// Start draining the output pipe. Only the first call has an effect.
    ///
    /// In preview mode a placeholder line is published instead.
    pub fn start_read_loop(&self) {
        let inner = &self.inner;
        if inner.read_loop_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if inner.options.preview {
            inner.deliver(PREVIEW_BANNER.to_string());
            return;
        }

        let Some(output) = lock(&inner.output).take() else {
            debug!("no output channel to read");
            return;
        };

        let session = Arc::downgrade(inner);
        let buffer_size = inner.options.read_buffer_size.max(1);
        let spawned = thread::Builder::new()
            .name("conterm-reader".to_string())
            .spawn(move || read_loop(session, output, buffer_size));

        match spawned {
            Ok(handle) => {
                *lock(&inner.reader_id) = Some(handle.thread().id());
                *lock(&inner.reader) = Some(handle);
            }
            Err(e) => warn!("failed to spawn reader thread: {}", e),
        }
    }

    /// Write raw bytes to the child's input.
    ///
    /// A no-op in preview mode and once the device is disposed. Fails with
    /// `NotStarted` before a connection exists and `NotConnected` after
    /// [`close_input`](TerminalSession::close_input).
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        self.inner.write(data, false)
    }

    /// Write text to the child's input, translating newlines if configured.
    pub fn write_str(&self, text: &str) -> Result<()> {
        if self.inner.options.translate_newlines {
            let translated = text.replace("\r\n", "\r").replace('\n', "\r");
            self.inner.write(translated.as_bytes(), false)
        } else {
            self.inner.write(text.as_bytes(), false)
        }
    }

    /// Keystroke input from the display surface; dropped in read-only mode.
    pub fn send_keys(&self, data: &[u8]) -> Result<()> {
        self.inner.write(data, true)
    }

    /// Close the input writer so the child reads end-of-stream.
    pub fn close_input(&self) {
        lock(&self.inner.input).close();
    }

    /// Resize the device. Silently ignored once it is disposed.
    pub fn resize(&self, size: ConsoleSize) {
        let Some(console) = self.inner.console() else {
            return;
        };
        if console.is_disposed() {
            return;
        }
        match console.resize(size) {
            Ok(()) => debug!(cols = size.cols, rows = size.rows, "resized"),
            Err(PtyError::DeviceClosed) => {}
            Err(e) => warn!("resize failed: {}", e),
        }
    }

    /// Forcibly end the child, leaving the device and session bookkeeping.
    ///
    /// No-op when there is no child or it has already exited.
    pub fn terminate_child_only(&self) {
        let Some(child) = lock(&self.inner.child).clone() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = child.terminate() {
            warn!(pid = child.pid(), "failed to terminate child: {}", e);
        }
    }

    /// Suppress keystroke input; optionally hide the cursor while read-only.
    pub fn set_read_only(&self, read_only: bool, update_cursor: bool) {
        self.inner.read_only.store(read_only, Ordering::SeqCst);
        debug!(read_only, "read-only mode");
        if update_cursor {
            self.set_cursor_visibility(!read_only);
        }
    }

    /// Whether keystroke input is currently suppressed.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::SeqCst)
    }

    /// Install (or with `None`, remove) the hook run on each output chunk
    /// before it reaches the transcript and subscribers.
    pub fn set_output_interceptor(&self, hook: Option<Interceptor>) {
        self.inner.output_hook.set(hook);
    }

    /// Install (or with `None`, remove) the hook run on all input before it
    /// is written, including keys dropped in read-only mode.
    pub fn set_input_interceptor(&self, hook: Option<Interceptor>) {
        self.inner.input_hook.set(hook);
    }

    /// Toggle win32-input-mode on both the display and the hosted program.
    pub fn set_win32_input_mode(&self, enable: bool) -> Result<()> {
        let sequence = text::win32_input_mode(enable);
        self.inner.deliver(sequence.to_string());
        self.write_input(sequence.as_bytes())
    }

    /// Clear the display; `hard` also resets terminal modes.
    pub fn clear_terminal(&self, hard: bool) {
        self.inner.deliver(text::clear_screen(hard).to_string());
    }

    /// Show or hide the cursor on the display.
    pub fn set_cursor_visibility(&self, visible: bool) {
        self.inner.deliver(text::cursor_visibility(visible).to_string());
    }

    /// Transcript with control sequences stripped (if `strip`) and blank
    /// lines collapsed. Empty when output logging is off.
    pub fn console_text(&self, strip: bool) -> String {
        lock(&self.inner.transcript)
            .as_deref()
            .map(|log| text::console_text(log, strip))
            .unwrap_or_default()
    }

    /// Raw transcript, if output logging is enabled.
    pub fn transcript(&self) -> Option<String> {
        lock(&self.inner.transcript).clone()
    }

    pub fn clear_transcript(&self) {
        if let Some(log) = lock(&self.inner.transcript).as_mut() {
            log.clear();
        }
    }

    /// Tear the session down; see the module docs for the order.
    pub fn close(&self) {
        self.inner.teardown();
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Size last applied to the device; `None` without a connection.
    pub fn size(&self) -> Option<ConsoleSize> {
        self.inner.console().map(|console| console.size())
    }

    /// Process id of the hosted child, if the session owns one.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner.child).as_ref().map(|child| child.pid())
    }

    fn register_close_hook(&self) {
        let session = Arc::downgrade(&self.inner);
        let id = self.inner.registry.register(move || {
            if let Some(inner) = session.upgrade() {
                inner.teardown();
            }
        });
        *lock(&self.inner.close_hook) = Some(id);
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`; false if the state changed meanwhile.
    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn console(&self) -> Option<Arc<dyn Console>> {
        lock(&self.console).clone()
    }

    fn install(&self, connection: Connection) {
        if let Some(child) = &connection.child {
            info!(pid = child.pid(), "session running");
        }
        *lock(&self.console) = Some(connection.console);
        *lock(&self.child) = connection.child;
        *lock(&self.input) = InputChannel::Open(connection.input);
        *lock(&self.output) = Some(connection.output);
    }

    fn emit(&self, event: SessionEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Append to the transcript and publish, in one step so concurrent
    /// deliveries keep the transcript in event order.
    fn deliver(&self, text: String) {
        let mut transcript = lock(&self.transcript);
        if let Some(log) = transcript.as_mut() {
            log.push_str(&text);
        }
        self.emit(SessionEvent::Output(text));
    }

    /// Run one chunk read from the output pipe through the hook and publish it.
    fn publish_output(&self, bytes: &[u8], decoder: &mut Utf8Stream) {
        let mut chunk = bytes.to_vec();
        self.output_hook.apply(&mut chunk);
        if chunk.is_empty() {
            return;
        }

        let text = decoder.decode(&chunk);
        if !text.is_empty() {
            trace!(len = text.len(), "output");
            self.deliver(text);
        }
    }

    fn write(&self, data: &[u8], from_keys: bool) -> Result<()> {
        if self.options.preview {
            return Ok(());
        }

        let mut data = data.to_vec();
        self.input_hook.apply(&mut data);
        if data.is_empty() {
            return Ok(());
        }
        if from_keys && self.read_only.load(Ordering::SeqCst) {
            trace!(len = data.len(), "read-only, dropping keys");
            return Ok(());
        }
        if self.console().map_or(false, |console| console.is_disposed()) {
            return Ok(());
        }

        match &mut *lock(&self.input) {
            InputChannel::Unattached => Err(PtyError::NotStarted),
            InputChannel::Closed => Err(PtyError::NotConnected),
            InputChannel::Open(writer) => {
                writer
                    .write_all(&data)
                    .and_then(|_| writer.flush())
                    .map_err(PtyError::Write)
            }
        }
    }

    fn join_reader(&self) {
        let Some(handle) = lock(&self.reader).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // teardown triggered from inside an output hook
            return;
        }
        if handle.join().is_err() {
            warn!("reader thread panicked");
        }
    }

    fn teardown(&self) {
        let on_reader = *lock(&self.reader_id) == Some(thread::current().id());
        if self.tearing_down.swap(true, Ordering::SeqCst) && on_reader {
            // another thread is tearing down and will join this one
            return;
        }
        self.teardown.call_once(|| {
            debug!("tearing down session");
            self.started.store(true, Ordering::SeqCst);
            *lock(&self.closed) = true;

            // 1. input writer; a writer blocked on a full pipe is closed
            //    after the device goes away instead
            let input_deferred = match self.input.try_lock() {
                Ok(mut input) => {
                    input.close();
                    false
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    poisoned.into_inner().close();
                    false
                }
                Err(TryLockError::WouldBlock) => true,
            };

            // 2. child
            let child = lock(&self.child).clone();
            let exit_code = child.and_then(|child| self.finish_child(&*child));

            // 3. device; an output end nobody drains would block the close
            if !self.read_loop_started.load(Ordering::SeqCst) {
                drop(lock(&self.output).take());
            }
            if let Some(console) = self.console() {
                console.dispose();
            }
            if input_deferred {
                lock(&self.input).close();
            }

            // 4. output pipe end, owned by the read loop until it sees EOF
            drop(lock(&self.output).take());
            self.join_reader();

            if let Some(id) = lock(&self.close_hook).take() {
                self.registry.unregister(id);
            }

            self.set_state(SessionState::Closed);
            info!(?exit_code, "session closed");
            self.emit(SessionEvent::Exited(exit_code));
        });
    }

    /// Wait out the grace period, then terminate. Returns the exit code.
    fn finish_child(&self, child: &dyn Child) -> Option<u32> {
        match child.wait_timeout(self.options.exit_grace) {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(e) => warn!("failed to wait for child: {}", e),
        }
        if !self.killed.swap(true, Ordering::SeqCst) {
            if let Err(e) = child.terminate() {
                warn!(pid = child.pid(), "failed to terminate child: {}", e);
            }
        }
        child.wait_timeout(self.options.exit_grace).ok().flatten()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Release a connection nobody will own.
fn discard(connection: Connection) {
    let Connection {
        console,
        child,
        output,
        ..
    } = connection;
    drop(output);
    if let Some(child) = child {
        let _ = child.terminate();
    }
    console.dispose();
}

fn read_loop(session: Weak<Inner>, mut output: Box<dyn Read + Send>, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];
    let mut decoder = Utf8Stream::new();

    loop {
        let n = match output.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // a broken pipe is how the device going away usually shows up
                debug!("output channel closed: {}", e);
                break;
            }
        };

        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.publish_output(&buffer[..n], &mut decoder);
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        if let Some(inner) = session.upgrade() {
            inner.deliver(tail);
        }
    }
    debug!("read loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Condvar;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct FakeConsole {
        disposed: AtomicBool,
        size: Mutex<ConsoleSize>,
        resizes: Mutex<Vec<ConsoleSize>>,
        output: Mutex<Option<Sender<Vec<u8>>>>,
    }

    impl FakeConsole {
        /// Simulate the hosted program printing `bytes`.
        fn print(&self, bytes: &[u8]) {
            if let Some(tx) = lock(&self.output).as_ref() {
                tx.send(bytes.to_vec()).unwrap();
            }
        }
    }

    impl Console for FakeConsole {
        fn resize(&self, size: ConsoleSize) -> Result<()> {
            if self.is_disposed() {
                return Err(PtyError::DeviceClosed);
            }
            *lock(&self.size) = size;
            lock(&self.resizes).push(size);
            Ok(())
        }

        fn dispose(&self) {
            if !self.disposed.swap(true, Ordering::SeqCst) {
                // the device's end of the output pipe goes away
                lock(&self.output).take();
            }
        }

        fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }

        fn size(&self) -> ConsoleSize {
            *lock(&self.size)
        }
    }

    struct ChannelReader {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(bytes) => self.pending = bytes,
                    Err(_) => return Ok(0),
                }
            }
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeChild {
        exit: Mutex<Option<u32>>,
        exited: Condvar,
        terminations: Mutex<usize>,
    }

    impl FakeChild {
        fn exit(&self, code: u32) {
            lock(&self.exit).get_or_insert(code);
            self.exited.notify_all();
        }

        fn terminations(&self) -> usize {
            *lock(&self.terminations)
        }
    }

    impl Child for FakeChild {
        fn pid(&self) -> u32 {
            4242
        }

        fn wait(&self) -> Result<u32> {
            let mut exit = lock(&self.exit);
            loop {
                if let Some(code) = *exit {
                    return Ok(code);
                }
                exit = self.exited.wait(exit).unwrap();
            }
        }

        fn wait_timeout(&self, timeout: Duration) -> Result<Option<u32>> {
            let exit = lock(&self.exit);
            let (exit, _) = self
                .exited
                .wait_timeout_while(exit, timeout, |exit| exit.is_none())
                .unwrap();
            Ok(*exit)
        }

        fn terminate(&self) -> Result<()> {
            *lock(&self.terminations) += 1;
            self.exit(1);
            Ok(())
        }
    }

    struct Fake {
        console: Arc<FakeConsole>,
        child: Arc<FakeChild>,
        input: Arc<Mutex<Vec<u8>>>,
    }

    impl Fake {
        fn input(&self) -> Vec<u8> {
            lock(&self.input).clone()
        }
    }

    struct FakeLauncher {
        connection: Mutex<Option<Connection>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, _command: &str, _size: ConsoleSize) -> Result<Connection> {
            lock(&self.connection)
                .take()
                .ok_or(PtyError::ProcessCreation { code: 2 })
        }
    }

    fn fake_connection() -> (Fake, Connection) {
        let (tx, rx) = mpsc::channel();
        let console = Arc::new(FakeConsole {
            disposed: AtomicBool::new(false),
            size: Mutex::new(ConsoleSize::default()),
            resizes: Mutex::new(Vec::new()),
            output: Mutex::new(Some(tx)),
        });
        let child = Arc::new(FakeChild::default());
        let input = Arc::new(Mutex::new(Vec::new()));

        let connection = Connection {
            console: console.clone(),
            child: Some(child.clone()),
            input: Box::new(SharedWriter(input.clone())),
            output: Box::new(ChannelReader {
                rx,
                pending: Vec::new(),
            }),
        };
        (
            Fake {
                console,
                child,
                input,
            },
            connection,
        )
    }

    fn options() -> SessionOptions {
        SessionOptions {
            exit_grace: Duration::from_millis(20),
            ..SessionOptions::default()
        }
    }

    fn fake_session(options: SessionOptions) -> (TerminalSession, Fake) {
        let (fake, connection) = fake_connection();
        let launcher = FakeLauncher {
            connection: Mutex::new(Some(connection)),
        };
        (TerminalSession::with_launcher(options, Arc::new(launcher)), fake)
    }

    /// A fake session whose close hook lands in a registry of its own.
    fn fake_session_in(registry: &'static HookRegistry) -> (TerminalSession, Fake) {
        let (fake, connection) = fake_connection();
        let launcher = FakeLauncher {
            connection: Mutex::new(Some(connection)),
        };
        let session = TerminalSession::with_registry(options(), Arc::new(launcher), registry);
        (session, fake)
    }

    fn leaked_registry() -> &'static HookRegistry {
        Box::leak(Box::new(HookRegistry::new()))
    }

    /// Closes the session from inside `launch`.
    struct ClosingLauncher {
        session: Mutex<Option<TerminalSession>>,
        connection: Mutex<Option<Connection>>,
    }

    impl Launcher for ClosingLauncher {
        fn launch(&self, _command: &str, _size: ConsoleSize) -> Result<Connection> {
            if let Some(session) = lock(&self.session).take() {
                session.close();
            }
            lock(&self.connection)
                .take()
                .ok_or(PtyError::ProcessCreation { code: 2 })
        }
    }

    /// Start on a background thread and wait for `Ready`.
    fn run(
        session: &TerminalSession,
        log_output: bool,
    ) -> (Receiver<SessionEvent>, JoinHandle<Result<Option<u32>>>) {
        let events = session.subscribe();
        let runner = session.clone();
        let handle =
            thread::spawn(move || runner.start("shell.exe", ConsoleSize::new(100, 40), log_output));
        assert_eq!(events.recv_timeout(TIMEOUT).unwrap(), SessionEvent::Ready);
        (events, handle)
    }

    /// Collect output until the session exits.
    fn drain(events: &Receiver<SessionEvent>) -> (Vec<String>, Option<u32>) {
        let mut outputs = Vec::new();
        loop {
            match events.recv_timeout(TIMEOUT).unwrap() {
                SessionEvent::Output(text) => outputs.push(text),
                SessionEvent::Exited(code) => return (outputs, code),
                SessionEvent::Ready => panic!("unexpected second Ready"),
            }
        }
    }

    fn recv_output(events: &Receiver<SessionEvent>) -> String {
        match events.recv_timeout(TIMEOUT).unwrap() {
            SessionEvent::Output(text) => text,
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[test]
    fn test_start_twice_fails() {
        let session = TerminalSession::new(SessionOptions {
            preview: true,
            ..options()
        });
        assert_eq!(session.start("cmd.exe", ConsoleSize::default(), false).unwrap(), None);
        assert!(matches!(
            session.start("cmd.exe", ConsoleSize::default(), false),
            Err(PtyError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_failed_launch_closes_session() {
        let launcher = FakeLauncher {
            connection: Mutex::new(None),
        };
        let session = TerminalSession::with_launcher(options(), Arc::new(launcher));

        let err = session.start("missing.exe", ConsoleSize::default(), false).unwrap_err();
        assert!(matches!(err, PtyError::ProcessCreation { code: 2 }));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.start("missing.exe", ConsoleSize::default(), false),
            Err(PtyError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_output_reaches_subscribers_and_transcript() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, true);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.pid(), Some(4242));

        fake.console.print(b"\x1b]0;shell\x07\x1b[31mhello\x1b[0m\r\n");
        fake.console.print(b"\r\n\r\n\r\n");
        fake.console.print("w\u{f6}rld".as_bytes());
        fake.child.exit(0);

        assert_eq!(handle.join().unwrap().unwrap(), Some(0));
        let (outputs, code) = drain(&events);
        assert_eq!(code, Some(0));
        assert_eq!(session.state(), SessionState::Closed);

        let delivered: String = outputs.concat();
        assert_eq!(session.transcript().unwrap(), delivered);
        assert_eq!(session.console_text(true), "hello\n\nw\u{f6}rld");
        assert!(fake.console.is_disposed());
    }

    #[test]
    fn test_split_utf8_is_reassembled() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, false);

        let bytes = "日本".as_bytes();
        fake.console.print(&bytes[..2]);
        fake.console.print(&bytes[2..]);
        fake.child.exit(0);
        handle.join().unwrap().unwrap();

        let (outputs, _) = drain(&events);
        assert_eq!(outputs.concat(), "日本");
        assert_eq!(session.transcript(), None);
        assert_eq!(session.console_text(true), "");
    }

    #[test]
    fn test_suppressing_interceptor_delivers_nothing() {
        let (session, fake) = fake_session(options());
        session.set_output_interceptor(Some(Box::new(|chunk: &mut Vec<u8>| chunk.clear())));
        let (events, handle) = run(&session, true);

        fake.console.print(b"secret\r\n");
        fake.console.print(b"more\r\n");
        fake.child.exit(0);
        handle.join().unwrap().unwrap();

        let (outputs, _) = drain(&events);
        assert!(outputs.is_empty());
        assert_eq!(session.transcript().as_deref(), Some(""));
    }

    #[test]
    fn test_interceptor_can_rewrite_output() {
        let (session, fake) = fake_session(options());
        session.set_output_interceptor(Some(Box::new(|chunk: &mut Vec<u8>| {
            chunk.make_ascii_uppercase();
            if let Some(pos) = chunk.iter().position(|&b| b == b'|') {
                chunk.truncate(pos);
            }
        })));
        let (events, handle) = run(&session, true);

        fake.console.print(b"visible|hidden");
        fake.child.exit(0);
        handle.join().unwrap().unwrap();

        let (outputs, _) = drain(&events);
        assert_eq!(outputs, vec!["VISIBLE".to_string()]);
        assert_eq!(session.transcript().as_deref(), Some("VISIBLE"));
    }

    #[test]
    fn test_write_before_start_fails() {
        let (session, _fake) = fake_session(options());
        assert!(matches!(session.write_input(b"dir\r"), Err(PtyError::NotStarted)));
        session.resize(ConsoleSize::new(10, 10));
        assert_eq!(session.size(), None);
    }

    #[test]
    fn test_write_after_close_input_is_rejected() {
        let (session, fake) = fake_session(options());
        let (_events, handle) = run(&session, false);

        session.write_input(b"dir\r").unwrap();
        session.close_input();
        session.close_input();
        assert!(matches!(session.write_input(b"exit\r"), Err(PtyError::NotConnected)));
        assert!(matches!(session.write_str("exit\r"), Err(PtyError::NotConnected)));
        assert_eq!(fake.input(), b"dir\r");

        fake.child.exit(0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_writes_after_teardown_are_dropped() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, false);
        fake.child.exit(0);
        handle.join().unwrap().unwrap();
        drain(&events);

        session.write_input(b"late\r").unwrap();
        assert!(fake.input().is_empty());
    }

    #[test]
    fn test_close_unblocks_read_loop() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, false);

        // the read loop is parked in recv(); closing must not hang
        session.close();

        assert_eq!(handle.join().unwrap().unwrap(), Some(1));
        let (_, code) = drain(&events);
        assert_eq!(code, Some(1));
        assert_eq!(fake.child.terminations(), 1);
        assert!(fake.console.is_disposed());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_resize_after_dispose_is_silent() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, false);

        session.resize(ConsoleSize::new(120, 50));
        assert_eq!(session.size(), Some(ConsoleSize::new(120, 50)));

        session.close();
        handle.join().unwrap().unwrap();
        drain(&events);

        for cols in [1, 80, 400] {
            session.resize(ConsoleSize::new(cols, 25));
        }
        assert_eq!(*lock(&fake.console.resizes), vec![ConsoleSize::new(120, 50)]);
    }

    #[test]
    fn test_terminate_after_exit_is_noop() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, false);
        fake.child.exit(0);
        handle.join().unwrap().unwrap();
        drain(&events);

        session.terminate_child_only();
        session.terminate_child_only();
        assert_eq!(fake.child.terminations(), 0);
    }

    #[test]
    fn test_terminate_child_only_kills_once() {
        let (session, fake) = fake_session(SessionOptions {
            exit_grace: Duration::from_secs(5),
            ..options()
        });
        let (events, handle) = run(&session, false);

        session.terminate_child_only();
        assert_eq!(handle.join().unwrap().unwrap(), Some(1));
        drain(&events);
        session.terminate_child_only();
        assert_eq!(fake.child.terminations(), 1);
    }

    #[test]
    fn test_read_only_drops_keys_but_hook_sees_them() {
        let (session, fake) = fake_session(options());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = seen.clone();
        session.set_input_interceptor(Some(Box::new(move |chunk: &mut Vec<u8>| {
            lock(&observer).push(chunk.clone());
        })));
        let (events, handle) = run(&session, false);

        session.set_read_only(true, true);
        assert_eq!(recv_output(&events), "\x1b[?25l");
        session.send_keys(b"x").unwrap();
        session.write_input(b"y").unwrap();

        session.set_read_only(false, false);
        session.send_keys(b"z").unwrap();

        assert_eq!(fake.input(), b"yz");
        assert_eq!(*lock(&seen), vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);

        fake.child.exit(0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_input_interceptor_can_suppress() {
        let (session, fake) = fake_session(options());
        session.set_input_interceptor(Some(Box::new(|chunk: &mut Vec<u8>| {
            chunk.retain(|&b| b != 0x03);
        })));
        let (_events, handle) = run(&session, false);

        session.write_input(b"\x03").unwrap();
        session.write_input(b"a\x03b").unwrap();
        assert_eq!(fake.input(), b"ab");

        fake.child.exit(0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_translate_newlines() {
        let (session, fake) = fake_session(SessionOptions {
            translate_newlines: true,
            ..options()
        });
        let (_events, handle) = run(&session, false);

        session.write_str("a\nb\r\nc").unwrap();
        session.write_input(b"raw\n").unwrap();
        assert_eq!(fake.input(), b"a\rb\rcraw\n");

        fake.child.exit(0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_win32_input_mode_goes_both_ways() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, false);

        session.set_win32_input_mode(true).unwrap();
        assert_eq!(recv_output(&events), "\x1b[?9001h");
        assert_eq!(fake.input(), b"\x1b[?9001h");

        session.clear_terminal(false);
        assert_eq!(recv_output(&events), "\x1b[H\x1b[2J\x1b[3J");

        fake.child.exit(0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_preview_mode_touches_nothing() {
        let session = TerminalSession::new(SessionOptions {
            preview: true,
            ..options()
        });
        let events = session.subscribe();

        assert_eq!(session.start("cmd.exe", ConsoleSize::default(), true).unwrap(), None);
        assert_eq!(events.recv_timeout(TIMEOUT).unwrap(), SessionEvent::Ready);

        session.start_read_loop();
        session.start_read_loop();
        assert_eq!(recv_output(&events), PREVIEW_BANNER);
        assert!(events.try_recv().is_err());

        session.write_input(b"ignored").unwrap();
        session.resize(ConsoleSize::new(10, 10));
        session.terminate_child_only();
        assert_eq!(session.size(), None);
        assert_eq!(session.console_text(true), "conterm preview:> console output appears here");
    }

    #[test]
    fn test_attach_existing_connection() {
        let (fake, connection) = fake_connection();
        let session = TerminalSession::attach(options(), connection, true);
        let events = session.subscribe();
        assert!(matches!(
            session.start("cmd.exe", ConsoleSize::default(), false),
            Err(PtyError::AlreadyStarted)
        ));

        session.start_read_loop();
        fake.console.print(b"attached\r\n");
        assert_eq!(recv_output(&events), "attached\r\n");

        session.write_input(b"ls\r").unwrap();
        assert_eq!(fake.input(), b"ls\r");

        fake.child.exit(7);
        session.close();
        let (_, code) = drain(&events);
        assert_eq!(code, Some(7));
    }

    #[test]
    fn test_clear_transcript() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, true);

        fake.console.print(b"one\r\n");
        assert_eq!(recv_output(&events), "one\r\n");
        session.clear_transcript();
        fake.console.print(b"two\r\n");
        assert_eq!(recv_output(&events), "two\r\n");
        assert_eq!(session.console_text(false), "two");

        fake.child.exit(0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_output_hook_can_uninstall_itself() {
        let (session, fake) = fake_session(options());
        let handle = session.clone();
        session.set_output_interceptor(Some(Box::new(move |chunk: &mut Vec<u8>| {
            chunk.make_ascii_uppercase();
            handle.set_output_interceptor(None);
        })));
        let (events, runner) = run(&session, true);

        fake.console.print(b"first\r\n");
        assert_eq!(recv_output(&events), "FIRST\r\n");
        fake.console.print(b"second\r\n");
        assert_eq!(recv_output(&events), "second\r\n");

        fake.child.exit(0);
        runner.join().unwrap().unwrap();
        assert_eq!(session.transcript().as_deref(), Some("FIRST\r\nsecond\r\n"));
    }

    #[test]
    fn test_output_hook_can_close_session() {
        let (session, fake) = fake_session(options());
        let handle = session.clone();
        session.set_output_interceptor(Some(Box::new(move |chunk: &mut Vec<u8>| {
            if chunk.as_slice() == b"logout\r\n" {
                handle.set_output_interceptor(None);
                handle.close();
            }
        })));
        let (events, runner) = run(&session, false);

        fake.console.print(b"logout\r\n");
        assert_eq!(runner.join().unwrap().unwrap(), Some(1));
        let (_, code) = drain(&events);
        assert_eq!(code, Some(1));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(fake.console.is_disposed());
    }

    #[test]
    fn test_input_hook_can_write_back() {
        let (session, fake) = fake_session(options());
        let handle = session.clone();
        session.set_input_interceptor(Some(Box::new(move |chunk: &mut Vec<u8>| {
            if chunk.as_slice() == b"!!" {
                chunk.clear();
                handle.write_input(b"history\r").unwrap();
            }
        })));
        let (_events, runner) = run(&session, false);

        session.write_input(b"!!").unwrap();
        session.write_input(b"dir\r").unwrap();
        assert_eq!(fake.input(), b"history\rdir\r");

        session.set_input_interceptor(None);
        fake.child.exit(0);
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_zero_read_buffer_still_reads() {
        let (session, fake) = fake_session(SessionOptions {
            read_buffer_size: 0,
            ..options()
        });
        let (events, handle) = run(&session, true);

        fake.console.print(b"hello\r\n");
        fake.child.exit(0);
        handle.join().unwrap().unwrap();

        let (outputs, _) = drain(&events);
        assert_eq!(outputs.concat(), "hello\r\n");
        assert_eq!(session.transcript().as_deref(), Some("hello\r\n"));
    }

    #[test]
    fn test_close_during_launch_discards_connection() {
        let (fake, connection) = fake_connection();
        let launcher = Arc::new(ClosingLauncher {
            session: Mutex::new(None),
            connection: Mutex::new(Some(connection)),
        });
        let session = TerminalSession::with_launcher(options(), launcher.clone());
        *lock(&launcher.session) = Some(session.clone());
        let events = session.subscribe();

        assert_eq!(session.start("shell.exe", ConsoleSize::default(), false).unwrap(), None);
        assert_eq!(events.recv_timeout(TIMEOUT).unwrap(), SessionEvent::Exited(None));
        assert!(events.try_recv().is_err());

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pid(), None);
        assert_eq!(fake.child.terminations(), 1);
        assert!(fake.console.is_disposed());
        assert!(matches!(session.write_input(b"dir\r"), Err(PtyError::NotStarted)));
    }

    #[test]
    fn test_transcript_keeps_event_order() {
        let (session, fake) = fake_session(options());
        let (events, handle) = run(&session, true);

        let sender = session.clone();
        let cursor = thread::spawn(move || {
            for i in 0..200 {
                sender.set_cursor_visibility(i % 2 == 0);
            }
        });
        for i in 0..200 {
            fake.console.print(format!("line {}\r\n", i).as_bytes());
        }
        cursor.join().unwrap();
        fake.child.exit(0);
        handle.join().unwrap().unwrap();

        let (outputs, _) = drain(&events);
        assert_eq!(outputs.len(), 400);
        assert_eq!(session.transcript().unwrap(), outputs.concat());
    }

    #[test]
    fn test_close_hook_tears_down_running_session() {
        let registry = leaked_registry();
        let (session, fake) = fake_session_in(registry);
        let (events, handle) = run(&session, false);
        assert_eq!(registry.len(), 1);

        // console window closed
        assert_eq!(registry.run_all(), 1);

        assert_eq!(handle.join().unwrap().unwrap(), Some(1));
        let (_, code) = drain(&events);
        assert_eq!(code, Some(1));
        assert_eq!(fake.child.terminations(), 1);
        assert!(fake.console.is_disposed());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_hook_removed_after_exit() {
        let registry = leaked_registry();
        let (session, fake) = fake_session_in(registry);
        let (events, handle) = run(&session, false);

        fake.child.exit(0);
        handle.join().unwrap().unwrap();
        drain(&events);
        assert!(registry.is_empty());

        // a late close event finds nothing to run
        assert_eq!(registry.run_all(), 0);
        session.close();
        assert_eq!(fake.child.terminations(), 0);
        assert!(events.try_recv().is_err());
    }

    #[cfg(windows)]
    #[test]
    fn test_echo_round_trip() {
        let session = TerminalSession::new(SessionOptions::default());
        let events = session.subscribe();
        let runner = session.clone();
        let handle = thread::spawn(move || runner.start("cmd.exe", ConsoleSize::new(80, 25), true));
        assert_eq!(events.recv_timeout(TIMEOUT).unwrap(), SessionEvent::Ready);

        session.write_str("echo conterm-42\r").unwrap();

        // once for the echoed command line, once for its output
        let mut seen = String::new();
        while text::strip_control_sequences(&seen).matches("conterm-42").count() < 2 {
            match events.recv_timeout(TIMEOUT).unwrap() {
                SessionEvent::Output(text) => seen.push_str(&text),
                other => panic!("unexpected event {:?}", other),
            }
        }

        session.write_str("exit\r").unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), Some(0));
        assert!(session.console_text(true).contains("conterm-42"));
    }
}
