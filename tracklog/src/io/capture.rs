//! Process-wide interception of stdout/stderr writes.
//!
//! The [`Interceptor`] owns the active write function for each output stream.
//! Everything that should end up in a terminal log writes through
//! [`stdout()`]/[`stderr()`] (or the tracing writer installed by
//! [`crate::logging::init`]), which call the active function.
//!
//! While at least one [`CaptureBuffer`] is registered, the active functions are
//! wrappers that forward to the original sink first and then fan the bytes out
//! to every live buffer. When the last registration goes away the original
//! functions are restored, so unregistered writes are observably unwrapped.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::trace;

/// A sink write function: writes all of `data` or fails.
pub type SinkFn = Arc<dyn Fn(&[u8]) -> io::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Append-only, resettable byte accumulator shared between producers and one drainer.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        lock(&self.bytes).extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move everything buffered so far into `out` and reset the buffer.
    ///
    /// The buffer keeps its allocation for reuse. Returns the number of bytes moved.
    pub fn drain_into(&self, out: &mut Vec<u8>) -> usize {
        let mut bytes = lock(&self.bytes);
        let n = bytes.len();
        out.extend_from_slice(&bytes);
        bytes.clear();
        n
    }
}

#[derive(Clone)]
struct SinkPair {
    stdout: SinkFn,
    stderr: SinkFn,
}

impl SinkPair {
    fn get(&self, stream: Stream) -> &SinkFn {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    buffers: BTreeMap<u64, Weak<CaptureBuffer>>,
}

impl Registry {
    fn snapshot(&self) -> Vec<Arc<CaptureBuffer>> {
        self.buffers.values().filter_map(Weak::upgrade).collect()
    }
}

#[derive(Default)]
struct PatchState {
    /// Sinks captured at install time; `Some` iff the wrappers are active.
    originals: Option<SinkPair>,
    installs: u64,
}

/// Shared stdout/stderr interception point.
pub struct Interceptor {
    active: RwLock<SinkPair>,
    registry: Arc<Mutex<Registry>>,
    /// Serializes register/unregister and the install/uninstall decision.
    patch: Mutex<PatchState>,
}

static GLOBAL: LazyLock<Arc<Interceptor>> = LazyLock::new(|| {
    Interceptor::with_sinks(real_sink(Stream::Stdout), real_sink(Stream::Stderr))
});

fn real_sink(stream: Stream) -> SinkFn {
    match stream {
        Stream::Stdout => Arc::new(|data: &[u8]| -> io::Result<()> {
            let mut out = io::stdout().lock();
            out.write_all(data)?;
            out.flush()
        }),
        Stream::Stderr => Arc::new(|data: &[u8]| -> io::Result<()> {
            let mut err = io::stderr().lock();
            err.write_all(data)?;
            err.flush()
        }),
    }
}

impl Interceptor {
    /// The process-wide interceptor wrapping the real stdout and stderr.
    pub fn global() -> Arc<Interceptor> {
        Arc::clone(&GLOBAL)
    }

    /// An isolated interceptor over caller-provided sinks.
    pub fn with_sinks(stdout: SinkFn, stderr: SinkFn) -> Arc<Interceptor> {
        Arc::new(Interceptor {
            active: RwLock::new(SinkPair { stdout, stderr }),
            registry: Arc::new(Mutex::new(Registry::default())),
            patch: Mutex::new(PatchState::default()),
        })
    }

    /// Write `data` through the currently active sink for `stream`.
    pub fn write(&self, stream: Stream, data: &[u8]) -> io::Result<()> {
        let sink = self.current_sink(stream);
        sink(data)
    }

    /// The write function currently installed for `stream`.
    pub fn current_sink(&self, stream: Stream) -> SinkFn {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(active.get(stream))
    }

    /// Add `buffer` to the fan-out set, installing the wrappers on the first registration.
    pub fn register(self: &Arc<Self>, buffer: &Arc<CaptureBuffer>) -> Registration {
        let mut patch = lock(&self.patch);
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.buffers.insert(id, Arc::downgrade(buffer));
            id
        };
        self.install(&mut patch);
        trace!(id, "capture buffer registered");
        Registration {
            id,
            interceptor: Arc::clone(self),
            released: false,
        }
    }

    fn unregister(&self, id: u64) {
        let mut patch = lock(&self.patch);
        let now_empty = {
            let mut registry = lock(&self.registry);
            registry.buffers.remove(&id);
            registry.buffers.is_empty()
        };
        if now_empty {
            self.uninstall(&mut patch);
        }
        trace!(id, "capture buffer unregistered");
    }

    fn install(&self, patch: &mut PatchState) {
        if patch.originals.is_some() {
            return;
        }
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        let originals = active.clone();
        active.stdout = self.wrap(Arc::clone(&originals.stdout));
        active.stderr = self.wrap(Arc::clone(&originals.stderr));
        patch.originals = Some(originals);
        patch.installs += 1;
    }

    fn uninstall(&self, patch: &mut PatchState) {
        let Some(originals) = patch.originals.take() else {
            return;
        };
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = originals;
    }

    fn wrap(&self, original: SinkFn) -> SinkFn {
        let registry = Arc::clone(&self.registry);
        Arc::new(move |data: &[u8]| -> io::Result<()> {
            original(data)?;
            let targets = lock(&registry).snapshot();
            for buffer in targets {
                buffer.append(data);
            }
            Ok(())
        })
    }

    pub fn is_installed(&self) -> bool {
        lock(&self.patch).originals.is_some()
    }

    /// Number of times the wrappers have been installed over this interceptor's life.
    pub fn install_count(&self) -> u64 {
        lock(&self.patch).installs
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        lock(&self.registry).buffers.len()
    }

    pub fn stdout(self: &Arc<Self>) -> CapturedStream {
        CapturedStream {
            interceptor: Arc::clone(self),
            stream: Stream::Stdout,
        }
    }

    pub fn stderr(self: &Arc<Self>) -> CapturedStream {
        CapturedStream {
            interceptor: Arc::clone(self),
            stream: Stream::Stderr,
        }
    }
}

/// Handle for one registered buffer. Dropping it unregisters the buffer.
#[must_use = "dropping a registration stops capture immediately"]
pub struct Registration {
    id: u64,
    interceptor: Arc<Interceptor>,
    released: bool,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.interceptor.unregister(self.id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// `io::Write` adapter over one stream of an [`Interceptor`].
#[derive(Clone)]
pub struct CapturedStream {
    interceptor: Arc<Interceptor>,
    stream: Stream,
}

impl Write for CapturedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.interceptor.write(self.stream, buf)?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.interceptor.write(self.stream, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer for the process-wide captured stdout.
pub fn stdout() -> CapturedStream {
    Interceptor::global().stdout()
}

/// Writer for the process-wide captured stderr.
pub fn stderr() -> CapturedStream {
    Interceptor::global().stderr()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
