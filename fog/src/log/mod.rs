//! Log multiplexing: many named writers, one output.
//!
//! A [`LogMux`] owns a single sink. Every source that wants to log asks the
//! mux for a [`LogStream`] under a unique name and writes raw bytes into it.
//! Streams buffer briefly and flush whole blocks, prefixed with their name
//! in a color that stays distinguishable from every other stream's.
//!
//! Flush timers run on a tokio runtime, so a mux must be built from inside
//! one or be handed a [`Handle`] explicitly.

mod palette;
mod stream;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

pub use stream::LogStream;

use crate::Result;

/// Default time a stream waits after its first unflushed write.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(10);

/// How flushed blocks are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Style {
    /// Each line is prefixed with the stream's colored name.
    #[default]
    Prefixed,
    /// Bytes are forwarded untouched.
    Plain,
}

/// Whether stream name prefixes carry ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum ColorMode {
    /// Follow `colored`'s detection: stdout is a terminal and neither
    /// `NO_COLOR` nor `CLICOLOR=0` is set. Decided once, when the mux is built.
    #[default]
    Auto,
    /// Always emit color escapes, e.g. for a sink known to be a terminal.
    Always,
    /// Never emit color escapes, e.g. for a file sink.
    Never,
}

impl ColorMode {
    /// Resolves the mode to a yes/no answer.
    fn enabled(self) -> bool {
        match self {
            Self::Auto => colored::control::SHOULD_COLORIZE.should_colorize(),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// Sink and flush settings shared by a mux and all of its streams.
struct Output {
    /// The single destination for every stream.
    sink: Mutex<Box<dyn Write + Send>>,
    /// Coalescing window.
    window: Duration,
    /// Rendering of flushed blocks.
    style: Style,
    /// Prefixes carry color escapes.
    colorize: bool,
    /// Runtime the flush timers are spawned on.
    runtime: Handle,
}

/// Registered streams, in registration order.
#[derive(Default)]
struct Registry {
    /// All streams, oldest first.
    streams: Vec<LogStream>,
    /// Name to position in `streams`.
    index: HashMap<String, usize>,
    /// Colors no longer match the stream population.
    dirty: bool,
}

/// Merges writes from many named [`LogStream`]s into one sink.
///
/// Cloning yields another handle to the same mux.
///
/// # Example
///
/// ```no_run
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> fog::Result<()> {
/// use std::io::Write;
///
/// let mux = fog::LogMux::new(std::io::stderr())?;
/// let mut vm = mux.stream("vm0");
/// writeln!(vm, "booting")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LogMux {
    /// Stream registry and color state.
    registry: Arc<Mutex<Registry>>,
    /// Shared sink.
    output: Arc<Output>,
}

impl LogMux {
    /// Creates a mux over `sink` with default settings.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sink: impl Write + Send + 'static) -> Result<Self> {
        Self::builder(sink).build()
    }

    /// Returns a builder for a mux over `sink`.
    pub fn builder(sink: impl Write + Send + 'static) -> LogMuxBuilder {
        LogMuxBuilder {
            sink: Box::new(sink),
            window: COALESCE_WINDOW,
            style: Style::default(),
            color: ColorMode::default(),
            runtime: None,
        }
    }

    /// Registers a new stream called `name`.
    ///
    /// The stream starts with a random color; call
    /// [`refresh_colors`](Self::refresh_colors) to spread colors across all
    /// registered streams.
    ///
    /// # Panics
    ///
    /// Panics if a stream called `name` is already registered.
    #[allow(clippy::panic)]
    pub fn stream(&self, name: impl Into<String>) -> LogStream {
        let name = name.into();
        let stream = LogStream::new(name.clone(), palette::happy_color(), Arc::clone(&self.output));

        let mut reg = self.registry.lock();
        if reg.index.contains_key(&name) {
            panic!("log stream {name:?} already registered");
        }
        let pos = reg.streams.len();
        reg.streams.push(stream.clone());
        reg.index.insert(name, pos);
        reg.dirty = true;
        stream
    }

    /// Returns the stream registered as `name`.
    pub fn get(&self, name: &str) -> Option<LogStream> {
        let reg = self.registry.lock();
        reg.index.get(name).map(|&i| reg.streams[i].clone())
    }

    /// Returns all stream names in registration order.
    pub fn names(&self) -> Vec<String> {
        let reg = self.registry.lock();
        reg.streams.iter().map(|s| s.name().to_owned()).collect()
    }

    /// Redistributes colors over every registered stream.
    ///
    /// Builds a palette sized to the current stream count and hands it out
    /// in registration order, so a stream keeps its relative position on the
    /// color wheel across refreshes. Does nothing unless a stream was
    /// registered since the last refresh.
    pub fn refresh_colors(&self) {
        let mut reg = self.registry.lock();
        if !reg.dirty {
            return;
        }
        let colors = palette::happy_palette(reg.streams.len());
        for (stream, color) in reg.streams.iter().zip(colors) {
            stream.set_color(color);
        }
        reg.dirty = false;
    }

    /// Writes out every stream's buffer now and flushes the sink.
    pub fn flush(&self) -> io::Result<()> {
        let reg = self.registry.lock();
        for stream in &reg.streams {
            stream.flush_now();
        }
        self.output.sink.lock().flush()
    }
}

impl fmt::Debug for LogMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.lock();
        f.debug_struct("LogMux")
            .field("streams", &reg.streams)
            .field("dirty", &reg.dirty)
            .field("window", &self.output.window)
            .field("style", &self.output.style)
            .field("colorize", &self.output.colorize)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`LogMux`].
#[must_use = "a LogMuxBuilder does nothing until .build() is called"]
pub struct LogMuxBuilder {
    /// Destination for all streams.
    sink: Box<dyn Write + Send>,
    /// Coalescing window.
    window: Duration,
    /// Block rendering.
    style: Style,
    /// Prefix coloring.
    color: ColorMode,
    /// Explicit runtime for flush timers.
    runtime: Option<Handle>,
}

impl LogMuxBuilder {
    /// Sets the coalescing window (default: 10 ms).
    pub const fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Sets how flushed blocks are rendered (default: prefixed).
    pub const fn style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    /// Sets whether prefixes are colored (default: auto-detected).
    ///
    /// Detection looks at stdout, not at the sink, so pick a mode
    /// explicitly when logging to a file or to stderr.
    pub const fn color(mut self, mode: ColorMode) -> Self {
        self.color = mode;
        self
    }

    /// Runs flush timers on `handle` instead of the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Builds the mux.
    ///
    /// Fails if no runtime was given and none is current.
    pub fn build(self) -> Result<LogMux> {
        let runtime = match self.runtime {
            Some(h) => h,
            None => Handle::try_current()?,
        };
        Ok(LogMux {
            registry: Arc::new(Mutex::new(Registry::default())),
            output: Arc::new(Output {
                sink: Mutex::new(self.sink),
                window: self.window,
                style: self.style,
                colorize: self.color.enabled(),
                runtime,
            }),
        })
    }
}

impl fmt::Debug for LogMuxBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMuxBuilder")
            .field("window", &self.window)
            .field("style", &self.style)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Sink doubles shared by the log tests.

    use std::io::{self, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Records every `write` call as a separate entry.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct Capture(Arc<Mutex<Vec<Vec<u8>>>>);

    impl Capture {
        /// Returns a copy of the recorded writes.
        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.0.lock().clone()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Removes SGR escape sequences from `bytes`.
    pub(crate) fn strip_ansi(bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for d in chars.by_ref() {
                    if d == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}
