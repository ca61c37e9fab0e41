//! A single named stream of a [`LogMux`](super::LogMux).

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use colored::Color;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{Output, Style};

/// Writer for one named log source.
///
/// Writes are buffered and never fail. The first write into an empty
/// buffer arms a flush timer; when it fires, everything accumulated so far
/// goes to the shared sink in a single `write_all`. Bursts from one source
/// therefore land as one contiguous block instead of being interleaved
/// with other streams line by line.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct LogStream {
    /// Shared stream state.
    inner: Arc<Inner>,
}

/// State behind a [`LogStream`] handle.
struct Inner {
    /// Stream name, unique within its mux.
    name: String,
    /// Current prefix color. Reassigned by the mux on refresh.
    color: Mutex<Color>,
    /// Buffer and timer bookkeeping. Shared by writers and the flush task.
    state: Mutex<State>,
    /// Sink and flush settings shared with the owning mux.
    output: Arc<Output>,
}

/// Mutable part of a stream.
#[derive(Default)]
struct State {
    /// Bytes written since the last flush.
    buf: Vec<u8>,
    /// The armed flush timer, if any.
    pending: Option<Pending>,
    /// Counter used to tell a live timer from a superseded one.
    epoch: u64,
    /// The last flushed block ended without a newline.
    mid_line: bool,
}

/// An armed flush timer.
struct Pending {
    /// Epoch the timer was armed in.
    epoch: u64,
    /// The sleeping flush task.
    task: JoinHandle<()>,
}

impl LogStream {
    /// Creates a stream writing to `output`.
    pub(super) fn new(name: String, color: Color, output: Arc<Output>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                color: Mutex::new(color),
                state: Mutex::new(State::default()),
                output,
            }),
        }
    }

    /// Returns the stream's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the stream's current prefix color.
    pub fn color(&self) -> Color {
        *self.inner.color.lock()
    }

    /// Replaces the prefix color.
    pub(super) fn set_color(&self, color: Color) {
        *self.inner.color.lock() = color;
    }

    /// Appends `bytes` to the buffer, arming a flush if none is pending.
    fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let mut state = self.inner.state.lock();
        state.buf.extend_from_slice(bytes);
        if state.pending.is_some() {
            return;
        }

        state.epoch = state.epoch.wrapping_add(1);
        let epoch = state.epoch;
        let inner = Arc::clone(&self.inner);
        let window = self.inner.output.window;
        let task = self.inner.output.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            inner.fire(epoch);
        });
        state.pending = Some(Pending { epoch, task });
    }

    /// Cancels any pending timer and writes the buffer out immediately.
    pub(super) fn flush_now(&self) {
        let mut state = self.inner.state.lock();
        if let Some(pending) = state.pending.take() {
            pending.task.abort();
        }
        self.inner.drain(&mut state);
    }
}

impl Inner {
    /// Timer callback: flushes if the timer armed in `epoch` is still current.
    fn fire(&self, epoch: u64) {
        let mut state = self.state.lock();
        if !state.pending.as_ref().is_some_and(|p| p.epoch == epoch) {
            return;
        }
        state.pending = None;
        self.drain(&mut state);
    }

    /// Moves the whole buffer to the sink in one write.
    ///
    /// Called with the state lock held so flushes of one stream stay in
    /// write order.
    fn drain(&self, state: &mut State) {
        if state.buf.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut state.buf);
        let block = match self.output.style {
            Style::Plain => bytes,
            Style::Prefixed => self.prefix_lines(&bytes, &mut state.mid_line),
        };
        if let Err(e) = self.output.sink.lock().write_all(&block) {
            warn!(stream = %self.name, error = %e, "dropping log output");
        }
    }

    /// Prefixes every line start in `bytes` with the colored stream name.
    fn prefix_lines(&self, bytes: &[u8], mid_line: &mut bool) -> Vec<u8> {
        let prefix = if self.output.colorize {
            let color = *self.color.lock();
            format!("\x1b[1;{}m{}\x1b[0m | ", color.to_fg_str(), self.name)
        } else {
            format!("{} | ", self.name)
        };

        let mut out = Vec::with_capacity(bytes.len() + prefix.len() * 4);
        for line in bytes.split_inclusive(|&b| b == b'\n') {
            if !*mid_line {
                out.extend_from_slice(prefix.as_bytes());
            }
            out.extend_from_slice(line);
            *mid_line = line.last() != Some(&b'\n');
        }
        out
    }
}

impl Drop for Inner {
    /// Hands whatever is still buffered to the sink once the last handle,
    /// including a timer task dropped by a shut-down runtime, goes away.
    fn drop(&mut self) {
        let mut state = std::mem::take(self.state.get_mut());
        self.drain(&mut state);
    }
}

impl Write for LogStream {
    /// Buffers `buf`. Always accepts every byte.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    /// Writes any buffered bytes now and flushes the shared sink.
    fn flush(&mut self) -> io::Result<()> {
        self.flush_now();
        self.inner.output.sink.lock().flush()
    }
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStream")
            .field("name", &self.inner.name)
            .field("color", &self.color())
            .finish_non_exhaustive()
    }
}
