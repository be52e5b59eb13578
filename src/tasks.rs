//! The build steps of the front-end pipeline and the stage plan of every
//! mode.

use std::fs;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use crate::blueprint::Blueprint;
use crate::bundle::{BuildArtifact, Bundler, FsSource, InvalidationPolicy, minify};
use crate::config::Config;
use crate::core::Mode;
use crate::engine::StagePlan;
use crate::error::{BundleError, ConfigError};
use crate::lint::{self, Checker, Checkstyle, Lint};
use crate::utils::as_overhead;
use crate::watch::{ChangeWatcher, Subscription};
use crate::{TaskContext, assets, styles};

/// Long-lived state shared by the task actions.
pub(crate) struct Services {
    /// The development bundler. Its module graph cache survives between
    /// watched rebuilds.
    pub(crate) bundler: Mutex<Bundler>,
    /// Set once the `watch` task has run.
    pub(crate) watching: AtomicBool,
    #[cfg(feature = "server")]
    pub(crate) server: Mutex<Option<crate::server::ServerHandle>>,
}

impl Services {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            bundler: Mutex::new(bundler(config)),
            watching: AtomicBool::new(false),
            #[cfg(feature = "server")]
            server: Mutex::new(None),
        }
    }
}

fn bundler(config: &Config) -> Bundler {
    let policy = match config.bundle.content_aware {
        true => InvalidationPolicy::ContentAware,
        false => InvalidationPolicy::Conservative,
    };

    Bundler::new(config.bundle.entries.clone(), FsSource::new(config.root.clone()))
        .with_policy(policy)
        .with_output_name(config.bundle.output.as_str())
}

/// Registers every task and the stage plans of all modes.
pub(crate) fn blueprint(services: &Arc<Services>) -> Blueprint {
    let mut blueprint = Blueprint::new();

    blueprint.task("clean-dev").exclusive().run(|ctx| {
        let config = ctx.config();
        let vendor = config.vendor.output.as_str();
        let removed = assets::clean(
            &config.path(&config.dist),
            &["*.js", "*.css", "*.map", "*.html", "*.png", "*.ico"],
            &[vendor, "vendor.css"],
        )?;
        assets::remove_dir(&config.path(&config.reports))?;
        tracing::debug!(removed, "cleaned output, kept vendor bundles");
        Ok(())
    });

    blueprint.task("clean-full").exclusive().run(|ctx| {
        let config = ctx.config();
        let removed = assets::clean(&config.path(&config.dist), &["*"], &[])?;
        assets::remove_dir(&config.path(&config.reports))?;
        tracing::debug!(removed, "cleaned output");
        Ok(())
    });

    blueprint.task("lint").run(|ctx| {
        let config = ctx.config();
        run_checker(ctx, &Lint, &config.lint.sources, &config.lint.ignore)
    });

    blueprint.task("checkstyle").run(|ctx| {
        let config = ctx.config();
        let checker = Checkstyle {
            max_line_length: config.lint.max_line_length,
        };
        run_checker(ctx, &checker, &config.lint.sources, &config.lint.ignore)
    });

    let shared = services.clone();
    blueprint.task("bundle-dev").run(move |ctx| {
        let config = ctx.config();
        let s = Instant::now();
        let mut bundler = shared.bundler.lock().unwrap();
        let previous = bundler.artifact().map(|artifact| artifact.hash);

        let artifact = match rebuild_changed(&mut bundler, &config.root, ctx.changed) {
            Ok(artifact) => artifact,
            Err(e) if ctx.changed.len() > 1 => {
                tracing::debug!("incremental pass failed, resolving the whole graph: {e}");
                bundler.rebuild(None)?
            }
            Err(e) => return Err(e.into()),
        };

        let output = config.dist_path(&config.bundle.output);
        if previous == Some(artifact.hash) && output.exists() {
            tracing::debug!("bundle unchanged");
            return Ok(());
        }

        write_bundle(&output, &artifact)?;
        tracing::info!(
            modules = artifact.modules.len(),
            recompiled = bundler.last_compiled().len(),
            "bundled {} {}",
            artifact.hash,
            as_overhead(s)
        );
        Ok(())
    });

    blueprint.task("bundle-prod").run(|ctx| {
        let config = ctx.config();
        let artifact = bundler(config).bundle_once()?;
        write(&config.dist_path(&config.bundle.output), &artifact.code)?;
        tracing::info!(modules = artifact.modules.len(), "bundled {}", artifact.hash);
        Ok(())
    });

    blueprint.task("styles-dev").run(|ctx| {
        let config = ctx.config();
        let css = styles::compile(&config.path(&config.styles.entry))?;
        write(&config.dist_path(&config.styles.output), &css)
    });

    blueprint.task("styles-prod").run(|ctx| {
        let config = ctx.config();
        let css = styles::compile_compressed(&config.path(&config.styles.entry))?;
        write(&config.dist_path(&config.styles.output), &css)
    });

    blueprint.task("images").run(|ctx| {
        let config = ctx.config();
        let count = assets::copy(&config.root, &config.images.source, &config.dist_path(&config.images.dest))?;
        tracing::debug!(count, "copied images");
        Ok(())
    });

    blueprint.task("fonts").run(|ctx| {
        let config = ctx.config();
        let count = assets::copy(&config.root, &config.fonts.source, &config.dist_path(&config.fonts.dest))?;
        tracing::debug!(count, "copied fonts");
        Ok(())
    });

    blueprint.task("vendor-js").run(|ctx| {
        let config = ctx.config();
        let code = assets::concat_scripts(&config.root, &config.vendor.sources)?;
        write(&config.dist_path(&config.vendor.output), &minify(&code))
    });

    blueprint.task("copy-index").run(|ctx| {
        let config = ctx.config();
        let dest = config.dist_path(&config.index.dest);
        assets::copy(&config.root, &config.index.source, &dest)?;

        let Some(script) = ctx.env.refresh_script() else {
            return Ok(());
        };
        let name = Utf8Path::new(&config.index.source)
            .file_name()
            .context("index document has no file name")?;
        let path = dest.join(name);
        let html = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        write(&path, &inject_script(&html, &script))
    });

    blueprint.task("copy-favicon").run(|ctx| {
        let config = ctx.config();
        assets::copy(&config.root, &config.favicon.source, &config.dist_path(&config.favicon.dest))?;
        Ok(())
    });

    blueprint.task("test").run(|ctx| {
        let config = ctx.config();
        let Some((program, args)) = config.test.command.split_first() else {
            anyhow::bail!("no test command configured");
        };

        let status = Command::new(program)
            .args(args)
            .current_dir(&config.root)
            .status()
            .with_context(|| format!("couldn't start test runner '{program}'"))?;

        if !status.success() {
            anyhow::bail!("test runner failed ({status})");
        }
        Ok(())
    });

    let shared = services.clone();
    blueprint
        .task("server")
        .after(["copy-index"])
        .run(move |ctx| serve(&shared, ctx));

    let shared = services.clone();
    blueprint
        .task("watch")
        .after(["bundle-dev", "styles-dev"])
        .run(move |_| {
            shared.watching.store(true, Ordering::SeqCst);
            Ok(())
        });

    for (mode, plan) in plans() {
        blueprint.plan(mode, plan);
    }

    blueprint
}

#[cfg(feature = "server")]
fn serve(services: &Services, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
    let mut server = services.server.lock().unwrap();
    if server.is_some() {
        return Ok(());
    }

    let config = ctx.config();
    let handle = crate::server::start(
        &config.path(&config.dist),
        &config.server.fallback,
        config.server.port,
    )
    .with_context(|| format!("couldn't bind port {}", config.server.port))?;

    *server = Some(handle);
    Ok(())
}

#[cfg(not(feature = "server"))]
fn serve(_: &Services, _: &TaskContext<'_>) -> anyhow::Result<()> {
    tracing::warn!("tsumiki was built without the `server` feature, nothing will be served");
    Ok(())
}

/// The stage plans, one per mode.
pub fn plans() -> Vec<(Mode, StagePlan)> {
    vec![
        (
            Mode::Dev,
            StagePlan::new("dev")
                .then(["clean-dev", "lint", "checkstyle"])
                .then(["bundle-dev", "styles-dev", "copy-index", "copy-favicon"])
                .then(["server", "watch"]),
        ),
        (
            Mode::Test,
            StagePlan::new("test")
                .then(["clean-full", "lint", "checkstyle"])
                .then(["test"]),
        ),
        (
            Mode::Prod,
            StagePlan::new("prod")
                .then(["clean-full", "lint", "checkstyle"])
                .then([
                    "bundle-prod",
                    "styles-prod",
                    "images",
                    "fonts",
                    "vendor-js",
                    "copy-index",
                    "copy-favicon",
                ])
                .then(["server"]),
        ),
        (
            Mode::Full,
            StagePlan::new("full")
                .then(["clean-full", "lint", "checkstyle"])
                .then([
                    "bundle-dev",
                    "styles-dev",
                    "images",
                    "fonts",
                    "vendor-js",
                    "copy-index",
                    "copy-favicon",
                ])
                .then(["server", "watch"]),
        ),
    ]
}

/// The watch subscriptions: which source changes re-run which task.
pub fn subscriptions(config: &Config) -> Result<ChangeWatcher, ConfigError> {
    let none: &[String] = &[];
    let vendor: Vec<String> = config.vendor.sources.iter().map(ToString::to_string).collect();

    let subscriptions = [
        Subscription::new(&config.bundle.watch, &config.bundle.ignore, ["bundle-dev"])?,
        Subscription::new(&config.styles.watch, none, ["styles-dev"])?,
        Subscription::new(&config.images.watch, none, ["images"])?,
        Subscription::new(&config.fonts.watch, none, ["fonts"])?,
        Subscription::new(&config.index.watch, none, ["copy-index"])?,
        Subscription::new(&vendor, none, ["vendor-js"])?,
        Subscription::new(&config.lint.sources, &config.lint.ignore, ["checkstyle"])?,
    ];

    ChangeWatcher::new(
        subscriptions.into_iter().collect(),
        Duration::from_millis(config.watch.debounce_ms),
    )
    .ignore(&[
        format!("{}/**", config.dist),
        format!("{}/**", config.reports),
    ])
}

/// Feeds one batch of changed paths to the bundler. The batch reflects a
/// tree that already holds every edit, so paths that are gone are handled
/// last: by then the importers that dropped them have been rebuilt. An empty
/// batch resolves the whole graph.
fn rebuild_changed(
    bundler: &mut Bundler,
    root: &Utf8Path,
    changed: &[Utf8PathBuf],
) -> Result<Arc<BuildArtifact>, BundleError> {
    let (present, removed): (Vec<&Utf8PathBuf>, Vec<&Utf8PathBuf>) =
        changed.iter().partition(|path| root.join(path).is_file());

    let mut artifact = None;
    for path in present.into_iter().chain(removed) {
        artifact = Some(bundler.rebuild(Some(path.as_path()))?);
    }

    match artifact {
        Some(artifact) => Ok(artifact),
        None => bundler.rebuild(None),
    }
}

/// Runs an advisory checker. Diagnostics are logged, never returned as an
/// error. On a watched rebuild only the changed files are checked.
fn run_checker(
    ctx: &TaskContext<'_>,
    checker: &dyn Checker,
    sources: &[String],
    ignore: &[String],
) -> anyhow::Result<()> {
    let config = ctx.config();
    let mut files = assets::expand(&config.root, sources, ignore)?;
    if !ctx.changed.is_empty() {
        files.retain(|file| ctx.changed.contains(file));
    }

    let diagnostics = lint::check(&config.root, &files, checker);
    for diagnostic in &diagnostics {
        tracing::warn!("{diagnostic}");
    }

    match diagnostics.len() {
        0 => tracing::debug!(files = files.len(), "{}: no problems", checker.name()),
        n => tracing::warn!(files = files.len(), "{}: {n} problem(s)", checker.name()),
    }
    Ok(())
}

fn write(path: &Utf8Path, text: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {parent}"))?;
    }
    fs::write(path, text).with_context(|| format!("writing {path}"))
}

fn write_bundle(path: &Utf8Path, artifact: &BuildArtifact) -> anyhow::Result<()> {
    let Some(map) = &artifact.source_map else {
        return write(path, &artifact.code);
    };

    let name = path.file_name().unwrap_or("bundle.js");
    let mut code = artifact.code.clone();
    if !code.ends_with('\n') {
        code.push('\n');
    }
    code.push_str(&format!("//# sourceMappingURL={name}.map\n"));

    write(path, &code)?;
    write(&path.with_file_name(format!("{name}.map")), &map.to_json()?)
}

/// Puts the live reload snippet right before `</body>`, or at the end of the
/// document when there is none.
fn inject_script(html: &str, script: &str) -> String {
    let tag = format!("<script>{script}</script>");

    match html.rfind("</body>") {
        Some(at) => format!("{}{tag}{}", &html[..at], &html[at..]),
        None => format!("{html}{tag}"),
    }
}
