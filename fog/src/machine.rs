//! QEMU machine supervision.
//!
//! A [`Machine`] turns a [`MachineConfig`] into an emulator command line,
//! launches it, and hands out a connection to the guest's serial socket.
//! The socket is dialed lazily: the emulator creates its listening sockets a
//! moment after it starts, so the first [`Machine::conn`] retries until they
//! appear.
//!
//! # Socket layout
//!
//! ```text
//! $XDG_RUNTIME_DIR/fog/
//!   {id}.sock           — serial console (primary channel)
//!   {id}_tty.sock       — second serial port
//!   {id}_monitor.sock   — QEMU monitor
//! ```

use std::fmt;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{Image, MachineConfig, StartOptions};
use crate::error::{Error, Result};
use crate::id::generate_id;
use crate::launch::{Launcher, SystemLauncher};
use crate::retry::RetryPolicy;

/// Emulator executable looked up on `$PATH`.
const QEMU: &str = "qemu-system-x86_64";

/// Accelerators in order of preference: KVM, then pure emulation.
const ACCEL_PREFERENCE: &[&str] = &["kvm", "tcg"];

/// Directory under the runtime dir that holds machine sockets.
const SOCKET_DIR: &str = "fog";

/// Host address as seen from a guest on QEMU user-mode networking.
const GUEST_HOST_ADDR: &str = "10.0.2.2";

/// A live connection to a machine's serial socket.
///
/// `&UnixStream` implements `Read` and `Write`, so a shared handle can be
/// used by every caller.
pub type Conn = Arc<UnixStream>;

/// Capability to open a client connection to a Unix socket.
pub trait Dial: Send + Sync + fmt::Debug {
    /// Connects to the socket at `path`.
    fn dial(&self, path: &Path) -> io::Result<UnixStream>;
}

/// Dials Unix sockets with [`UnixStream::connect`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixDialer;

impl Dial for UnixDialer {
    fn dial(&self, path: &Path) -> io::Result<UnixStream> {
        UnixStream::connect(path)
    }
}

/// The three socket endpoints of one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketPaths {
    /// Serial console.
    primary: PathBuf,
    /// Second serial port.
    tty: PathBuf,
    /// QEMU monitor.
    monitor: PathBuf,
}

impl SocketPaths {
    /// Derives the socket paths for `id` under `runtime_dir`, creating the
    /// socket directory if needed.
    fn under(runtime_dir: &Path, id: &str) -> Result<Self> {
        let dir = runtime_dir.join(SOCKET_DIR);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|source| Error::SocketPath {
                path: dir.clone(),
                source,
            })?;
        Ok(Self {
            primary: dir.join(format!("{id}.sock")),
            tty: dir.join(format!("{id}_tty.sock")),
            monitor: dir.join(format!("{id}_monitor.sock")),
        })
    }
}

/// Cached connection plus the outcome of the last dial sequence.
#[derive(Debug, Default)]
struct ConnSlot {
    /// Established connection. Never cleared once set.
    conn: Option<Conn>,
    /// Error from the most recent failed dial sequence.
    last_err: Option<Arc<io::Error>>,
}

/// A supervised QEMU guest.
///
/// Construction is pure apart from drawing a random identity. [`start`]
/// launches the emulator; [`conn`] connects to it. There is no stop: the
/// emulator lives until it exits or is killed from outside.
///
/// [`start`]: Machine::start
/// [`conn`]: Machine::conn
#[derive(Debug)]
pub struct Machine {
    /// Random 64-hex-char identity.
    id: String,
    /// Display name.
    name: String,
    /// Resource and network settings.
    config: MachineConfig,
    /// Image the machine boots from.
    image: Image,
    /// Resolved disk image on the host.
    image_path: PathBuf,
    /// Runtime directory override; `None` uses the per-user runtime dir.
    runtime_dir: Option<PathBuf>,
    /// Process launching capability.
    launcher: Arc<dyn Launcher>,
    /// Socket dialing capability.
    dialer: Arc<dyn Dial>,
    /// Retry policy for the first connection.
    retry: RetryPolicy,
    /// Set once `start` has been entered.
    started: AtomicBool,
    /// Socket paths, set by a successful `start`.
    sockets: OnceLock<SocketPaths>,
    /// Guards the cached connection.
    conn: Mutex<ConnSlot>,
    /// Number of finished dial sequences.
    dial_sequences: AtomicU64,
}

impl Machine {
    /// Creates a machine using the host's launcher, dialer and runtime dir.
    pub fn new(
        name: impl Into<String>,
        config: MachineConfig,
        image: Image,
        image_path: impl Into<PathBuf>,
    ) -> Self {
        Self::builder(name, config, image, image_path).build()
    }

    /// Returns a builder for swapping out the machine's collaborators.
    pub fn builder(
        name: impl Into<String>,
        config: MachineConfig,
        image: Image,
        image_path: impl Into<PathBuf>,
    ) -> MachineBuilder {
        MachineBuilder {
            name: name.into(),
            config,
            image,
            image_path: image_path.into(),
            runtime_dir: None,
            launcher: Arc::new(SystemLauncher),
            dialer: Arc::new(UnixDialer),
            retry: RetryPolicy::default(),
        }
    }

    /// Returns the machine's random identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the machine configuration.
    pub const fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Returns the image reference.
    pub const fn image(&self) -> &Image {
        &self.image
    }

    /// Returns the host path of the boot image.
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Returns the serial socket path, once the machine has been started.
    pub fn socket_path(&self) -> Option<&Path> {
        self.sockets.get().map(|s| s.primary.as_path())
    }

    /// URL of this machine's entry on the metadata service, as reached from
    /// inside the guest.
    pub fn metadata_url(&self, imds_port: u16) -> String {
        format!("http://{GUEST_HOST_ADDR}:{imds_port}/{}/", self.id)
    }

    /// Boots the machine.
    ///
    /// Resolves the emulator, derives the socket paths and spawns the
    /// process. Returns once the process exists; the guest keeps booting in
    /// the background and [`conn`](Self::conn) waits for its socket.
    ///
    /// # Panics
    ///
    /// Panics if the machine was already started successfully.
    #[allow(clippy::panic)]
    pub fn start(&self, opts: &StartOptions) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            panic!("machine {} ({}) started twice", self.name, self.id);
        }
        let res = self.launch(opts);
        if res.is_err() {
            self.started.store(false, Ordering::Release);
        }
        res
    }

    /// Body of [`start`](Self::start).
    fn launch(&self, opts: &StartOptions) -> Result<()> {
        let bin = self
            .launcher
            .resolve(QEMU)
            .map_err(|source| Error::Binary {
                program: QEMU,
                source,
            })?;

        let sockets = SocketPaths::under(&self.runtime_dir()?, &self.id)?;
        let args = self.launch_args(&sockets, opts.imds_port)?;

        debug!(
            name = %self.name,
            sock = %sockets.primary.display(),
            mon = %sockets.monitor.display(),
            "starting machine"
        );

        self.launcher
            .spawn(&bin, &args, opts.output.clone())
            .map_err(Error::Spawn)?;

        // `started` guarantees this is the only successful launch.
        let _ = self.sockets.set(sockets);
        Ok(())
    }

    /// Returns the directory socket files live under.
    fn runtime_dir(&self) -> Result<PathBuf> {
        match &self.runtime_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::runtime_dir().ok_or(Error::NoRuntimeDir),
        }
    }

    /// Builds the emulator command line.
    fn launch_args(&self, sockets: &SocketPaths, imds_port: u16) -> Result<Vec<String>> {
        let mut args: Vec<String> = Vec::with_capacity(40);
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| (*s).to_owned()));

        // TODO: check /dev/kvm access up front instead of relying on QEMU's fallback order.
        let accel = format!("accel={}", ACCEL_PREFERENCE.join(":"));
        push(&["-machine", accel.as_str()]);
        push(&["-cpu", "host", "-m", self.config.memory.as_str()]);
        if let Some(cpus) = self.config.cpus {
            push(&["-smp", cpus.to_string().as_str()]);
        }

        push(&["-nographic", "-vga", "none"]);

        // Snapshot mode keeps the backing image untouched.
        let image = qemu_opt_value(&self.image_path)?;
        push(&["-hda", image.as_str(), "-snapshot"]);

        let mut user_net = String::from("user");
        if !self.config.ports.is_empty() {
            user_net.push_str(",hostfwd=");
            user_net.push_str(&self.config.ports.join(","));
        }
        push(&["-net", "nic", "-net", user_net.as_str()]);

        for (id, path, attach) in [
            ("serial", &sockets.primary, "-serial"),
            ("tty", &sockets.tty, "-serial"),
            ("monitor", &sockets.monitor, "-monitor"),
        ] {
            let chardev = format!("socket,id={id},path={},server,nowait", qemu_opt_value(path)?);
            let backend = format!("chardev:{id}");
            push(&["-chardev", chardev.as_str(), attach, backend.as_str()]);
        }

        let smbios = format!(
            "type=1,serial=ds=nocloud-net;s={}",
            self.metadata_url(imds_port)
        );
        push(&["-smbios", smbios.as_str()]);

        Ok(args)
    }

    /// Returns a connection to the machine's serial socket.
    ///
    /// The first successful dial is cached and returned to every later
    /// caller without a liveness check. Until then each call dials under a
    /// per-machine lock, retrying per the machine's [`RetryPolicy`]. Callers
    /// that queued behind a failing dial sequence receive its error rather
    /// than starting another one.
    pub fn conn(&self) -> Result<Conn> {
        let path = self
            .sockets
            .get()
            .map(|s| s.primary.clone())
            .ok_or(Error::NotStarted)?;
        let seen = self.dial_sequences.load(Ordering::Acquire);

        let mut slot = self.conn.lock();
        if let Some(conn) = &slot.conn {
            return Ok(Arc::clone(conn));
        }
        if self.dial_sequences.load(Ordering::Acquire) != seen {
            if let Some(err) = &slot.last_err {
                return Err(self.connect_error(path, Arc::clone(err)));
            }
        }

        let res = self.retry.run(|attempt| {
            self.dialer.dial(&path).inspect_err(|e| {
                debug!(name = %self.name, attempt, error = %e, "machine socket not ready");
            })
        });
        self.dial_sequences.fetch_add(1, Ordering::AcqRel);

        match res {
            Ok(stream) => {
                let conn = Arc::new(stream);
                slot.conn = Some(Arc::clone(&conn));
                slot.last_err = None;
                Ok(conn)
            }
            Err(e) => {
                let err = Arc::new(e);
                slot.last_err = Some(Arc::clone(&err));
                Err(self.connect_error(path, err))
            }
        }
    }

    /// Wraps a dial failure.
    fn connect_error(&self, path: PathBuf, source: Arc<io::Error>) -> Error {
        Error::Connect {
            path,
            attempts: self.retry.max_attempts(),
            source,
        }
    }
}

/// Builder for a [`Machine`] with non-default collaborators.
#[derive(Debug)]
#[must_use = "a MachineBuilder does nothing until .build() is called"]
pub struct MachineBuilder {
    /// Display name.
    name: String,
    /// Resource and network settings.
    config: MachineConfig,
    /// Image reference.
    image: Image,
    /// Resolved disk image.
    image_path: PathBuf,
    /// Runtime directory override.
    runtime_dir: Option<PathBuf>,
    /// Process launcher.
    launcher: Arc<dyn Launcher>,
    /// Socket dialer.
    dialer: Arc<dyn Dial>,
    /// First-connection retry policy.
    retry: RetryPolicy,
}

impl MachineBuilder {
    /// Places sockets under `dir` instead of the per-user runtime dir.
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// Uses `launcher` to start the emulator.
    pub fn launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    /// Uses `dialer` to connect to the serial socket.
    pub fn dialer(mut self, dialer: impl Dial + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Sets the retry policy for the first connection (default: 3 × 1 s).
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the machine, drawing a fresh identity.
    pub fn build(self) -> Machine {
        Machine {
            id: generate_id(),
            name: self.name,
            config: self.config,
            image: self.image,
            image_path: self.image_path,
            runtime_dir: self.runtime_dir,
            launcher: self.launcher,
            dialer: self.dialer,
            retry: self.retry,
            started: AtomicBool::new(false),
            sockets: OnceLock::new(),
            conn: Mutex::new(ConnSlot::default()),
            dial_sequences: AtomicU64::new(0),
        }
    }
}

/// Renders `path` for use inside a QEMU option string.
///
/// QEMU splits option values on `,` and reads `,,` as a literal comma.
/// Paths that are not valid UTF-8 cannot be passed through and are refused.
fn qemu_opt_value(path: &Path) -> Result<String> {
    let s = path.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: path.to_path_buf(),
    })?;
    Ok(s.replace(',', ",,"))
}
