//! Mapping filesystem changes to the tasks that have to run again.
//!
//! Watch mode is split in two parts:
//!
//! 1. **Change watcher**: [`ChangeWatcher`] holds a static table of
//!    subscriptions and turns a single change event into the narrowest set
//!    of task names. It knows nothing about the OS and is driven by plain
//!    `(path, kind, instant)` triples, so it can be tested directly.
//! 2. **Event source**: with the `live` feature, `listen` feeds it from
//!    `notify`, behind `notify-debouncer-full` which merges the bursts of
//!    events editors produce when saving a single file.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::assets::glob_base;
use crate::blueprint::TaskGraph;
use crate::bundle::normalize_path;
use crate::engine::TaskName;
use crate::error::ConfigError;

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// Access and other events that don't change content.
    Other,
}

#[cfg(feature = "live")]
impl From<&notify::EventKind> for ChangeKind {
    fn from(kind: &notify::EventKind) -> Self {
        match kind {
            notify::EventKind::Create(_) => ChangeKind::Created,
            notify::EventKind::Modify(_) => ChangeKind::Modified,
            notify::EventKind::Remove(_) => ChangeKind::Removed,
            _ => ChangeKind::Other,
        }
    }
}

/// Binds a set of project-relative globs to the tasks that consume the
/// matching files. Exclusions win over inclusions.
#[derive(Debug, Clone)]
pub struct Subscription {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    tasks: Vec<TaskName>,
}

impl Subscription {
    pub fn new<S, T>(include: &[S], exclude: &[S], tasks: T) -> Result<Self, ConfigError>
    where
        S: AsRef<str>,
        T: IntoIterator,
        T::Item: Into<TaskName>,
    {
        let compile = |globs: &[S]| {
            globs
                .iter()
                .map(|glob| {
                    let glob = glob.as_ref();
                    Pattern::new(glob.strip_prefix("./").unwrap_or(glob))
                })
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            tasks: tasks.into_iter().map(Into::into).collect(),
        })
    }

    pub fn matches(&self, path: &Utf8Path) -> bool {
        let path = path.as_std_path();
        self.include.iter().any(|p| p.matches_path_with(path, MATCH))
            && !self.exclude.iter().any(|p| p.matches_path_with(path, MATCH))
    }

    pub fn tasks(&self) -> &[TaskName] {
        &self.tasks
    }
}

/// Maps change events to task names.
#[derive(Debug)]
pub struct ChangeWatcher {
    subscriptions: Vec<Subscription>,
    ignore: Vec<Pattern>,
    debounce: Duration,
    /// When each path last triggered.
    last: HashMap<Utf8PathBuf, Instant>,
    /// Changes that arrived inside the window of an earlier trigger. They
    /// are released by [`ChangeWatcher::flush`] once the window closes.
    pending: BTreeMap<Utf8PathBuf, BTreeSet<TaskName>>,
}

impl ChangeWatcher {
    pub fn new(subscriptions: Vec<Subscription>, debounce: Duration) -> Self {
        Self {
            subscriptions,
            ignore: vec![],
            debounce,
            last: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Paths that never trigger anything, like generated output.
    pub fn ignore<S: AsRef<str>>(mut self, globs: &[S]) -> Result<Self, ConfigError> {
        for glob in globs {
            self.ignore.push(Pattern::new(glob.as_ref())?);
        }
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Checks that every bound task exists in the graph.
    pub fn validate(&self, graph: &TaskGraph) -> Result<(), ConfigError> {
        for task in self.subscriptions.iter().flat_map(Subscription::tasks) {
            if graph.node(task).is_none() {
                return Err(ConfigError::UnknownSubscriber(task.to_string()));
            }
        }
        Ok(())
    }

    /// Returns the tasks that must run because of a change to `path`.
    ///
    /// The first event for a path triggers immediately. Further events for
    /// the same path within the debounce window are collapsed into one
    /// pending trigger, which [`ChangeWatcher::flush`] hands out once the
    /// window has passed, so the last edit of a burst is always built.
    pub fn on_filesystem_event(
        &mut self,
        path: &Utf8Path,
        kind: ChangeKind,
        now: Instant,
    ) -> BTreeSet<TaskName> {
        if kind == ChangeKind::Other {
            return BTreeSet::new();
        }

        let path = normalize_path(path);
        if self
            .ignore
            .iter()
            .any(|p| p.matches_path_with(path.as_std_path(), MATCH))
        {
            return BTreeSet::new();
        }

        let tasks: BTreeSet<TaskName> = self
            .subscriptions
            .iter()
            .filter(|sub| sub.matches(&path))
            .flat_map(|sub| sub.tasks.iter().cloned())
            .collect();

        if tasks.is_empty() {
            return tasks;
        }

        if self.in_window(&path, now) {
            tracing::debug!(%path, "change collapsed into a pending trigger");
            self.pending.entry(path).or_default().extend(tasks);
            return BTreeSet::new();
        }

        self.trigger(path, now);
        tasks
    }

    /// Releases the collapsed changes whose debounce window has passed,
    /// as `(path, tasks)` pairs.
    pub fn flush(&mut self, now: Instant) -> Vec<(Utf8PathBuf, BTreeSet<TaskName>)> {
        let due: Vec<Utf8PathBuf> = self
            .pending
            .keys()
            .filter(|path| !self.in_window(path, now))
            .cloned()
            .collect();

        let mut released = vec![];
        for path in due {
            if let Some(tasks) = self.pending.remove(&path) {
                self.trigger(path.clone(), now);
                released.push((path, tasks));
            }
        }
        released
    }

    /// Whether some collapsed change is still waiting for its window.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn in_window(&self, path: &Utf8Path, now: Instant) -> bool {
        self.last
            .get(path)
            .is_some_and(|&last| now.saturating_duration_since(last) < self.debounce)
    }

    fn trigger(&mut self, path: Utf8PathBuf, now: Instant) {
        let debounce = self.debounce;
        let pending = &self.pending;
        self.last.retain(|path, &mut seen| {
            now.saturating_duration_since(seen) < debounce || pending.contains_key(path)
        });
        self.pending.remove(&path);
        self.last.insert(path, now);
    }

    /// Directories to watch recursively, relative to the project root. Each
    /// include glob contributes its static prefix, and nested roots are
    /// dropped in favour of their parent.
    pub fn roots(&self) -> Vec<Utf8PathBuf> {
        let roots = self
            .subscriptions
            .iter()
            .flat_map(|sub| &sub.include)
            .map(|pattern| {
                let base = glob_base(pattern.as_str());
                let concrete = !pattern.as_str().contains(['*', '?', '[']);
                match concrete {
                    // A concrete file is watched through its directory, so
                    // that atomic saves are caught.
                    true => base.parent().map(Utf8Path::to_path_buf).unwrap_or_default(),
                    false => base,
                }
            })
            .map(|base| match base.as_str() {
                "" => Utf8PathBuf::from("."),
                _ => base,
            })
            .collect();

        collapse_watch_paths(roots)
    }
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive. This function sorts the paths and filters
/// out any path that is a subdirectory of a previously accepted path.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && (path.starts_with(last) || last.as_str() == ".")
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}

/// Blocks forever, handing batches of project-relative changes to
/// `handle`. Events that pile up while `handle` is busy are drained and
/// handed over together as one batch. When nothing arrives for a whole
/// debounce interval `handle` gets an empty batch, so that collapsed
/// changes can be released.
#[cfg(feature = "live")]
pub(crate) fn listen<F>(
    root: &Utf8Path,
    roots: &[Utf8PathBuf],
    debounce: Duration,
    mut handle: F,
) -> Result<(), crate::error::WatchError>
where
    F: FnMut(Vec<(Utf8PathBuf, ChangeKind)>, Instant),
{
    use std::sync::mpsc::{RecvError, RecvTimeoutError};

    use notify::RecursiveMode;
    use notify_debouncer_full::new_debouncer;

    let root = root.canonicalize_utf8()?;
    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(debounce, None, tx)?;

    for path in roots {
        let path = root.join(path);
        if !path.exists() {
            tracing::warn!(%path, "watch root doesn't exist, skipping");
            continue;
        }
        tracing::info!("watching {}", path);
        debouncer.watch(&path, RecursiveMode::Recursive)?;
    }

    loop {
        let first = match rx.recv_timeout(debounce) {
            Ok(first) => Some(first),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => return Err(RecvError.into()),
        };

        let mut changes = vec![];
        for batch in first.into_iter().chain(rx.try_iter()) {
            match batch {
                Ok(events) => {
                    for de in events {
                        let kind = ChangeKind::from(&de.event.kind);
                        for path in &de.event.paths {
                            let Some(path) = Utf8Path::from_path(path) else {
                                continue;
                            };
                            match path.strip_prefix(&root) {
                                Ok(relative) => changes.push((relative.to_path_buf(), kind)),
                                Err(_) => tracing::debug!(%path, "change outside of the project root"),
                            }
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        tracing::error!("watch error: {e}");
                    }
                }
            }
        }

        handle(changes, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;

    const DEBOUNCE: Duration = Duration::from_millis(250);

    fn watcher() -> ChangeWatcher {
        let config = Config::default();
        let bundle = &config.bundle;
        ChangeWatcher::new(
            vec![
                Subscription::new(&bundle.watch, &bundle.ignore, ["bundle-dev"]).unwrap(),
                Subscription::new(&config.styles.watch, &[], ["styles-dev"]).unwrap(),
                Subscription::new(&config.index.watch, &[], ["copy-index"]).unwrap(),
                Subscription::new(&config.lint.sources, &config.lint.ignore, ["checkstyle"]).unwrap(),
            ],
            DEBOUNCE,
        )
        .ignore(&["static/**", "reports/**"])
        .unwrap()
    }

    fn names(set: &BTreeSet<TaskName>) -> Vec<&str> {
        set.iter().map(|name| name.as_ref()).collect()
    }

    #[test]
    fn template_change_maps_only_to_bundle() {
        let mut watcher = watcher();
        let tasks = watcher.on_filesystem_event(
            Utf8Path::new("js/app/users/list.html"),
            ChangeKind::Modified,
            Instant::now(),
        );
        assert_eq!(names(&tasks), vec!["bundle-dev"]);
    }

    #[test]
    fn stylesheet_change_maps_only_to_styles() {
        let mut watcher = watcher();
        let tasks = watcher.on_filesystem_event(
            Utf8Path::new("js/app/users/list.scss"),
            ChangeKind::Modified,
            Instant::now(),
        );
        assert_eq!(names(&tasks), vec!["styles-dev"]);
    }

    #[test]
    fn script_change_maps_to_bundle_and_checkstyle() {
        let mut watcher = watcher();
        let tasks = watcher.on_filesystem_event(
            Utf8Path::new("./js/app/app.js"),
            ChangeKind::Created,
            Instant::now(),
        );
        assert_eq!(names(&tasks), vec!["bundle-dev", "checkstyle"]);
    }

    #[test]
    fn index_change_is_not_a_template() {
        let mut watcher = watcher();
        let tasks = watcher.on_filesystem_event(
            Utf8Path::new("js/app/index.html"),
            ChangeKind::Modified,
            Instant::now(),
        );
        assert_eq!(names(&tasks), vec!["copy-index"]);
    }

    #[test]
    fn exclusions_drop_events() {
        let mut watcher = watcher();
        let now = Instant::now();

        // Specs are checked for style but never bundled.
        let tasks = watcher.on_filesystem_event(
            Utf8Path::new("js/app/users/list.spec.js"),
            ChangeKind::Modified,
            now,
        );
        assert_eq!(names(&tasks), vec!["checkstyle"]);

        for path in [
            "static/bundle.js",
            "reports/coverage/index.html",
            "README.md",
        ] {
            let tasks = watcher.on_filesystem_event(Utf8Path::new(path), ChangeKind::Modified, now);
            assert!(tasks.is_empty(), "{path} should not trigger anything");
        }

        let tasks = watcher.on_filesystem_event(
            Utf8Path::new("js/app/assets/libs/vendor.js"),
            ChangeKind::Modified,
            now,
        );
        assert!(tasks.is_empty());
    }

    #[test]
    fn access_events_are_ignored() {
        let mut watcher = watcher();
        let tasks = watcher.on_filesystem_event(
            Utf8Path::new("js/app/app.js"),
            ChangeKind::Other,
            Instant::now(),
        );
        assert!(tasks.is_empty());
    }

    #[test]
    fn bursts_for_one_path_collapse_into_one_trigger() {
        let mut watcher = watcher();
        let path = Utf8Path::new("js/app/app.scss");
        let start = Instant::now();
        let ms = Duration::from_millis;

        assert!(!watcher.on_filesystem_event(path, ChangeKind::Modified, start).is_empty());
        assert!(watcher.on_filesystem_event(path, ChangeKind::Modified, start + ms(100)).is_empty());
        assert!(watcher.on_filesystem_event(path, ChangeKind::Modified, start + ms(150)).is_empty());
        assert!(watcher.has_pending());

        // A different path inside the window still triggers.
        let other = Utf8Path::new("js/app/users/list.scss");
        assert!(!watcher.on_filesystem_event(other, ChangeKind::Modified, start + ms(100)).is_empty());

        // Nothing is released while the window is open.
        assert!(watcher.flush(start + ms(200)).is_empty());

        // The collapsed edits come back as a single trigger afterwards.
        let released = watcher.flush(start + DEBOUNCE);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, path);
        assert_eq!(names(&released[0].1), vec!["styles-dev"]);
        assert!(!watcher.has_pending());
        assert!(watcher.flush(start + DEBOUNCE * 4).is_empty());
    }

    #[test]
    fn new_trigger_absorbs_pending_change() {
        let mut watcher = watcher();
        let path = Utf8Path::new("js/app/app.scss");
        let start = Instant::now();

        watcher.on_filesystem_event(path, ChangeKind::Modified, start);
        watcher.on_filesystem_event(path, ChangeKind::Modified, start + Duration::from_millis(100));

        // An event after the window triggers directly and covers the
        // collapsed one.
        let tasks = watcher.on_filesystem_event(path, ChangeKind::Modified, start + DEBOUNCE);
        assert_eq!(names(&tasks), vec!["styles-dev"]);
        assert!(!watcher.has_pending());
    }

    #[test]
    fn unknown_subscriber_is_a_config_error() {
        let graph = crate::Blueprint::new().finish().unwrap();
        let err = watcher().validate(&graph).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSubscriber(_)));
    }

    #[test]
    fn roots_are_static_prefixes() {
        assert_eq!(watcher().roots(), vec![Utf8PathBuf::from("js/app")]);

        let watcher = ChangeWatcher::new(
            vec![
                Subscription::new(&["*.scss"], &[], ["styles-dev"]).unwrap(),
                Subscription::new(&["js/app/index.html"], &[], ["copy-index"]).unwrap(),
            ],
            DEBOUNCE,
        );
        assert_eq!(watcher.roots(), vec![Utf8PathBuf::from(".")]);
    }

    #[test]
    fn test_collapse_watch_paths() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/a"));
        paths.insert(Utf8PathBuf::from("/a/b"));
        paths.insert(Utf8PathBuf::from("/a/b/c"));
        paths.insert(Utf8PathBuf::from("/b"));
        paths.insert(Utf8PathBuf::from("/c/d"));

        let collapsed = collapse_watch_paths(paths);

        assert_eq!(
            collapsed,
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/b"),
                Utf8PathBuf::from("/c/d")
            ]
        );
    }

    #[test]
    fn test_collapse_watch_paths_similar_names() {
        let mut paths = HashSet::new();
        paths.insert(Utf8PathBuf::from("/foo"));
        paths.insert(Utf8PathBuf::from("/foo-bar"));

        let collapsed = collapse_watch_paths(paths);

        // /foo-bar is not a subdirectory of /foo
        assert_eq!(
            collapsed,
            vec![Utf8PathBuf::from("/foo"), Utf8PathBuf::from("/foo-bar")]
        );
    }
}
