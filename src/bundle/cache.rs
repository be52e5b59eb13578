use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::bundle::source::Import;

/// Everything the bundler knows about one module.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// Resolved, normalized path of the module.
    pub path: Utf8PathBuf,
    /// Hash of the raw source bytes.
    pub fingerprint: Hash32,
    /// Imports in source order, bare ones included.
    pub imports: Vec<Import>,
    /// Resolved direct dependencies in source order.
    pub dependencies: Vec<Utf8PathBuf>,
    pub source: Arc<str>,
    pub fragment: Arc<str>,
    pub fragment_hash: Hash32,
    /// Line of `fragment` where the embedded source starts, if any.
    pub source_line: Option<u32>,
}

/// Module records keyed by path, plus a reverse index from each module to the
/// modules importing it.
///
/// The reverse index never names a module that has no record, and records are
/// only ever replaced as a whole.
#[derive(Debug, Default)]
pub struct ModuleGraphCache {
    records: HashMap<Utf8PathBuf, ModuleRecord>,
    importers: HashMap<Utf8PathBuf, BTreeSet<Utf8PathBuf>>,
    generation: u64,
}

impl ModuleGraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Utf8Path) -> Option<&ModuleRecord> {
        self.records.get(path)
    }

    pub fn contains(&self, path: &Utf8Path) -> bool {
        self.records.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.records.keys().map(Utf8PathBuf::as_path)
    }

    /// Advances on every write, stays put otherwise.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Modules that import `path` directly.
    pub fn importers(&self, path: &Utf8Path) -> impl Iterator<Item = &Utf8Path> {
        self.importers
            .get(path)
            .into_iter()
            .flatten()
            .map(Utf8PathBuf::as_path)
    }

    /// Replaces the record for `record.path`, keeping the reverse index in
    /// step with the new dependency list.
    pub fn insert(&mut self, record: ModuleRecord) {
        let path = record.path.clone();

        if let Some(old) = self.records.get(&path) {
            let stale: Vec<_> = old
                .dependencies
                .iter()
                .filter(|dep| !record.dependencies.contains(dep))
                .cloned()
                .collect();
            for dep in stale {
                self.unlink(&dep, &path);
            }
        }

        for dep in &record.dependencies {
            self.importers
                .entry(dep.clone())
                .or_default()
                .insert(path.clone());
        }

        self.records.insert(path, record);
        self.generation += 1;
    }

    /// Drops a module and every reverse edge it took part in.
    pub fn remove(&mut self, path: &Utf8Path) -> Option<ModuleRecord> {
        let record = self.records.remove(path)?;

        for dep in &record.dependencies {
            self.unlink(dep, path);
        }
        self.importers.remove(path);
        self.generation += 1;

        Some(record)
    }

    /// Replaces the whole cache content in one step.
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = ModuleRecord>) {
        self.records.clear();
        self.importers.clear();

        for record in records {
            for dep in &record.dependencies {
                self.importers
                    .entry(dep.clone())
                    .or_default()
                    .insert(record.path.clone());
            }
            self.records.insert(record.path.clone(), record);
        }

        self.generation += 1;
    }

    /// Every module that depends on `path`, directly or transitively. The
    /// module itself is not included unless it sits on an import cycle.
    pub fn dependents_closure(&self, path: &Utf8Path) -> BTreeSet<Utf8PathBuf> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([path.to_path_buf()]);

        while let Some(next) = queue.pop_front() {
            for importer in self.importers(&next) {
                if seen.insert(importer.to_path_buf()) {
                    queue.push_back(importer.to_path_buf());
                }
            }
        }

        seen
    }

    /// Checks that the reverse index and the records agree with each other.
    pub fn is_coherent(&self) -> bool {
        let index_known = self.importers.iter().all(|(dep, importers)| {
            self.records.contains_key(dep)
                && importers.iter().all(|importer| {
                    self.records
                        .get(importer)
                        .is_some_and(|record| record.dependencies.contains(dep))
                })
        });

        let edges_indexed = self.records.values().all(|record| {
            record.dependencies.iter().all(|dep| {
                self.records.contains_key(dep)
                    && self
                        .importers
                        .get(dep)
                        .is_some_and(|importers| importers.contains(&record.path))
            })
        });

        index_known && edges_indexed
    }

    fn unlink(&mut self, dep: &Utf8Path, importer: &Utf8Path) {
        if let Some(importers) = self.importers.get_mut(dep) {
            importers.remove(importer);
            if importers.is_empty() {
                self.importers.remove(dep);
            }
        }
    }
}
