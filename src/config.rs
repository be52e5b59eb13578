//! Pipeline configuration.
//!
//! Every field has a default that matches the classic single-page app layout
//! (`js/app` sources, `static` output), so an empty `tsumiki.toml`, or none
//! at all, is a valid configuration.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "tsumiki.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Project root, every other path is relative to it.
    pub root: Utf8PathBuf,
    /// Output directory served by the HTTP server.
    pub dist: Utf8PathBuf,
    /// Directory holding test and coverage reports.
    pub reports: Utf8PathBuf,
    pub server: ServerConfig,
    pub bundle: BundleConfig,
    pub styles: StylesConfig,
    pub lint: LintConfig,
    pub images: CopyConfig,
    pub fonts: CopyConfig,
    pub index: CopyConfig,
    pub favicon: CopyConfig,
    pub vendor: VendorConfig,
    pub test: TestConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    /// Port of the live-reload WebSocket.
    pub reload_port: u16,
    /// Document served for any path that doesn't match a file.
    pub fallback: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleConfig {
    pub entries: Vec<Utf8PathBuf>,
    pub watch: Vec<String>,
    pub ignore: Vec<String>,
    pub output: Utf8PathBuf,
    /// Use the content-aware invalidation policy instead of the conservative one.
    pub content_aware: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StylesConfig {
    pub entry: Utf8PathBuf,
    pub watch: Vec<String>,
    pub output: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LintConfig {
    pub sources: Vec<String>,
    pub ignore: Vec<String>,
    pub max_line_length: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopyConfig {
    pub source: String,
    pub watch: Vec<String>,
    /// Destination directory, relative to `dist`.
    pub dest: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VendorConfig {
    pub sources: Vec<Utf8PathBuf>,
    pub output: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestConfig {
    /// Program and arguments of the external test runner.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            dist: Utf8PathBuf::from("static"),
            reports: Utf8PathBuf::from("reports"),
            server: ServerConfig::default(),
            bundle: BundleConfig::default(),
            styles: StylesConfig::default(),
            lint: LintConfig::default(),
            images: CopyConfig {
                source: "js/app/assets/images/**/*".into(),
                watch: vec!["js/app/assets/images/**/*".into()],
                dest: "images".into(),
            },
            fonts: CopyConfig {
                source: "js/libs/font-awesome/fonts/*".into(),
                watch: vec![],
                dest: "fonts".into(),
            },
            index: CopyConfig {
                source: "js/app/index.html".into(),
                watch: vec!["js/app/index.html".into()],
                dest: "".into(),
            },
            favicon: CopyConfig {
                source: "js/app/favicon.png".into(),
                watch: vec![],
                dest: "".into(),
            },
            vendor: VendorConfig::default(),
            test: TestConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            reload_port: 35729,
            fallback: "index.html".into(),
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            entries: vec!["js/app/app.js".into()],
            watch: vec![
                "js/app/*.js".into(),
                "js/app/**/*.js".into(),
                "js/app/**/*.html".into(),
            ],
            ignore: vec![
                "js/app/assets/libs/**/*.js".into(),
                "js/app/**/*.spec.js".into(),
                "js/app/index.html".into(),
            ],
            output: "bundle.js".into(),
            content_aware: false,
        }
    }
}

impl Default for StylesConfig {
    fn default() -> Self {
        Self {
            entry: "js/app/app.scss".into(),
            watch: vec!["js/app/app.scss".into(), "js/app/**/*.scss".into()],
            output: "app.css".into(),
        }
    }
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            sources: vec!["js/app/*.js".into(), "js/app/**/*.js".into()],
            ignore: vec!["js/app/assets/libs/**/*.js".into()],
            max_line_length: 120,
        }
    }
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            sources: [
                "js/libs/angular/angular.js",
                "js/libs/angular-animate/angular-animate.js",
                "js/libs/angular-resource/angular-resource.js",
                "js/libs/angular-sanitize/angular-sanitize.js",
                "js/libs/angular-ui-router/release/angular-ui-router.js",
                "js/libs/jquery/dist/jquery.js",
                "js/libs/lodash/lodash.js",
            ]
            .into_iter()
            .map(Utf8PathBuf::from)
            .collect(),
            output: "vendor.js".into(),
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: ["karma", "start", "karma.conf.js", "--single-run"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 250 }
    }
}

impl Config {
    /// Parses a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the configuration from `path`, falling back to the defaults when
    /// the file doesn't exist.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(%path, "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Read(path.to_owned(), e)),
        }
    }

    /// Resolves a project-relative path against the root.
    pub fn path(&self, relative: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.root.join(relative)
    }

    /// Resolves a path relative to the output directory.
    pub fn dist_path(&self, relative: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.root.join(&self.dist).join(relative)
    }
}
