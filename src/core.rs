use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::config::Config;

/// A 32-byte BLAKE3 hash used for content fingerprints.
///
/// In `tsumiki` this serves two purposes:
/// 1. It is the fingerprint of a module's source text, used to decide whether
///    a changed file actually needs recompiling.
/// 2. It identifies a compiled fragment or an assembled artifact, so that
///    unchanged output can be detected without comparing whole strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First eight hex digits, enough to tell builds apart in logs.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// The pipeline flavour to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum Mode {
    /// Incremental development build, served and watched.
    Dev,
    /// Lint and run the test suite once.
    Test,
    /// Minified production build, served.
    Prod,
    /// Every asset rebuilt from scratch, then served and watched.
    Full,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Dev => "dev",
            Mode::Test => "test",
            Mode::Prod => "prod",
            Mode::Full => "full",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global configuration and state available to all tasks.
#[derive(Debug, Clone)]
pub struct Environment {
    /// The name of the generator.
    pub generator: &'static str,
    pub mode: Mode,
    /// Whether file changes are watched after the initial build.
    pub watch: bool,
    /// Port of the live-reload WebSocket, if it is running.
    pub reload_port: Option<u16>,
    pub config: Arc<Config>,
}

impl Environment {
    pub fn new(mode: Mode, config: Config) -> Self {
        Self {
            generator: "tsumiki",
            mode,
            watch: false,
            reload_port: None,
            config: Arc::new(config),
        }
    }

    /// Returns a JavaScript snippet to enable live-reloading.
    ///
    /// If the live-reload socket is running, this returns a script that
    /// connects to it and reloads the page on every `"reload"` message.
    pub fn refresh_script(&self) -> Option<String> {
        self.reload_port.map(|port| {
            format!(
                r#"
const socket = new WebSocket("ws://localhost:{port}");
socket.addEventListener("message", event => {{
    if (event.data === "reload") window.location.reload();
}});
"#
            )
        })
    }
}

/// The context passed to every task execution.
pub struct TaskContext<'a> {
    pub env: &'a Environment,
    /// Project-relative paths whose change triggered this run. Empty for
    /// the initial build.
    pub changed: &'a [Utf8PathBuf],
    /// Tracing span assigned to this task.
    pub(crate) span: tracing::Span,
}

impl TaskContext<'_> {
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }
}
