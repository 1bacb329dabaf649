use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, SystemTime};

use crate::config::ScriptsConfig;
use crate::diagnostics::{Diagnostic, DiagnosticCode, SourceLocation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub raw_content: String,
    pub last_modified: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchStatus {
    ChangeDetected(ChangeSet),
    NoChange,
}

impl WatchStatus {
    pub fn changed(&self) -> bool {
        matches!(self, WatchStatus::ChangeDetected(_))
    }
}

/// Sources read for one compile cycle, plus notes about files that vanished or could not
/// be read.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub files: Vec<SourceFile>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Metadata-only poller for the script directory. Contents are read separately by
/// [`SourceWatcher::load_sources`] after a change has been reported.
pub struct SourceWatcher {
    root: PathBuf,
    extension: String,
    recursive: bool,
    snapshot: BTreeMap<PathBuf, SystemTime>,
    nudge: Option<NotifyNudge>,
}

impl SourceWatcher {
    pub fn new(root: impl AsRef<Path>, extension: impl Into<String>, recursive: bool) -> Self {
        let extension = extension.into().trim_start_matches('.').to_string();
        Self { root: root.as_ref().to_path_buf(), extension, recursive, snapshot: BTreeMap::new(), nudge: None }
    }

    pub fn from_config(config: &ScriptsConfig) -> Self {
        let mut watcher = Self::new(&config.root, config.extension.clone(), config.recursive);
        if config.use_notify {
            if let Err(err) = watcher.enable_notify(config.notify_rescan_interval) {
                tracing::warn!(root = %config.root.display(), "notify unavailable, falling back to polling: {err:#}");
            }
        }
        watcher
    }

    /// Only rescan after the OS watcher reported activity, or every `rescan_interval` quiet
    /// polls. The metadata scan stays the source of truth.
    pub fn enable_notify(&mut self, rescan_interval: u32) -> Result<()> {
        self.nudge = Some(NotifyNudge::new(&self.root, self.recursive, rescan_interval)?);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tracked_files(&self) -> impl Iterator<Item = &Path> {
        self.snapshot.keys().map(PathBuf::as_path)
    }

    pub fn poll(&mut self) -> WatchStatus {
        if let Some(nudge) = self.nudge.as_mut() {
            if !nudge.should_rescan() {
                return WatchStatus::NoChange;
            }
        }
        let current = match self.scan() {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(root = %self.root.display(), "script directory scan failed: {err:#}");
                return WatchStatus::NoChange;
            }
        };
        let changes = diff_snapshots(&self.snapshot, &current);
        if changes.is_empty() {
            return WatchStatus::NoChange;
        }
        tracing::debug!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            "script sources changed"
        );
        // Taken before the compile starts: edits landing during the compile show up on the
        // next poll instead of being folded into this cycle.
        self.snapshot = current;
        WatchStatus::ChangeDetected(changes)
    }

    /// Rescans regardless of notify state and adopts the result as the new snapshot.
    pub fn rescan(&mut self) -> Result<ChangeSet> {
        let current = self.scan()?;
        let changes = diff_snapshots(&self.snapshot, &current);
        self.snapshot = current;
        Ok(changes)
    }

    pub fn load_sources(&self) -> SourceBatch {
        let mut batch = SourceBatch::default();
        for (path, modified) in &self.snapshot {
            let raw_content = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    batch.diagnostics.push(Diagnostic::new(
                        DiagnosticCode::SourceVanished,
                        SourceLocation::file_start(path),
                        "file disappeared before it could be read; compiled as an empty module",
                    ));
                    String::new()
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), "failed to read script: {err}");
                    batch.diagnostics.push(Diagnostic::new(
                        DiagnosticCode::SourceUnreadable,
                        SourceLocation::file_start(path),
                        format!("file could not be read: {err}"),
                    ));
                    String::new()
                }
            };
            batch.files.push(SourceFile { path: path.clone(), raw_content, last_modified: *modified });
        }
        batch
    }

    fn scan(&self) -> Result<BTreeMap<PathBuf, SystemTime>> {
        let mut listing = BTreeMap::new();
        if !self.root.exists() {
            return Ok(listing);
        }
        self.scan_dir(&self.root, &mut listing)?;
        Ok(listing)
    }

    fn scan_dir(&self, dir: &Path, listing: &mut BTreeMap<PathBuf, SystemTime>) -> Result<()> {
        let entries = fs::read_dir(dir).with_context(|| format!("Reading '{}'", dir.display()))?;
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else { continue };
            if metadata.is_dir() {
                if self.recursive {
                    self.scan_dir(&path, listing)?;
                }
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            listing.insert(path, modified);
        }
        Ok(())
    }
}

fn diff_snapshots(previous: &BTreeMap<PathBuf, SystemTime>, current: &BTreeMap<PathBuf, SystemTime>) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (path, modified) in current {
        match previous.get(path) {
            None => changes.added.push(path.clone()),
            Some(prev) if prev != modified => changes.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            changes.removed.push(path.clone());
        }
    }
    changes
}

struct NotifyNudge {
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    rescan_interval: u32,
    quiet_polls: u32,
    primed: bool,
}

impl NotifyNudge {
    fn new(root: &Path, recursive: bool, rescan_interval: u32) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(
                NotifyConfig::default().with_compare_contents(false).with_poll_interval(Duration::from_millis(300)),
            )
            .context("configure script watcher")?;
        if root.exists() {
            let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
            watcher.watch(root, mode).with_context(|| format!("watch {}", root.display()))?;
        }
        Ok(Self { _watcher: watcher, rx, rescan_interval, quiet_polls: 0, primed: false })
    }

    fn should_rescan(&mut self) -> bool {
        let mut relevant = !self.primed;
        self.primed = true;
        while let Ok(event) = self.rx.try_recv() {
            match event {
                Ok(event) => relevant |= Self::is_relevant(&event.kind),
                Err(err) => {
                    tracing::warn!("script watcher error: {err}");
                    relevant = true;
                }
            }
        }
        if relevant {
            self.quiet_polls = 0;
            return true;
        }
        self.quiet_polls += 1;
        if self.rescan_interval > 0 && self.quiet_polls >= self.rescan_interval {
            self.quiet_polls = 0;
            return true;
        }
        false
    }

    fn is_relevant(kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::Modify(ModifyKind::Data(_))
                | EventKind::Modify(ModifyKind::Name(_))
                | EventKind::Modify(ModifyKind::Any)
                | EventKind::Create(_)
                | EventKind::Remove(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stamp(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn diff_reports_added_modified_and_removed() {
        let previous = BTreeMap::from([
            (PathBuf::from("a.ks"), stamp(1)),
            (PathBuf::from("b.ks"), stamp(1)),
            (PathBuf::from("c.ks"), stamp(1)),
        ]);
        let current = BTreeMap::from([
            (PathBuf::from("a.ks"), stamp(1)),
            (PathBuf::from("b.ks"), stamp(2)),
            (PathBuf::from("d.ks"), stamp(1)),
        ]);
        let changes = diff_snapshots(&previous, &current);
        assert_eq!(changes.added, vec![PathBuf::from("d.ks")]);
        assert_eq!(changes.modified, vec![PathBuf::from("b.ks")]);
        assert_eq!(changes.removed, vec![PathBuf::from("c.ks")]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn identical_snapshots_produce_no_changes() {
        let snapshot = BTreeMap::from([(PathBuf::from("a.ks"), stamp(5))]);
        assert!(diff_snapshots(&snapshot, &snapshot).is_empty());
    }

    fn write(path: &Path, text: &[u8], secs: u64) {
        fs::write(path, text).expect("write script");
        let file = fs::File::options().write(true).open(path).expect("open script");
        file.set_modified(stamp(secs)).expect("set mtime");
    }

    #[test]
    fn file_removed_after_poll_loads_as_empty_module() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keep = dir.path().join("keep.ks");
        let gone = dir.path().join("gone.ks");
        write(&keep, b"type Keep : Behaviour { fn update(ctx, dt) {} }", 1);
        write(&gone, b"type Gone : Behaviour { fn update(ctx, dt) {} }", 1);
        let mut watcher = SourceWatcher::new(dir.path(), "ks", false);
        assert!(watcher.poll().changed());

        fs::remove_file(&gone).expect("remove");
        let batch = watcher.load_sources();
        assert_eq!(batch.files.len(), 2);
        let vanished = batch.files.iter().find(|file| file.path == gone).expect("vanished entry");
        assert!(vanished.raw_content.is_empty());
        assert!(!batch.files.iter().find(|file| file.path == keep).expect("kept").raw_content.is_empty());
        assert_eq!(batch.diagnostics.len(), 1);
        assert_eq!(batch.diagnostics[0].code, DiagnosticCode::SourceVanished);
        assert!(!batch.diagnostics[0].is_error());

        match watcher.poll() {
            WatchStatus::ChangeDetected(changes) => {
                assert_eq!(changes.removed, vec![gone]);
                assert!(changes.added.is_empty() && changes.modified.is_empty());
            }
            WatchStatus::NoChange => panic!("removal not reported"),
        }
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bad = dir.path().join("bad.ks");
        write(&bad, &[0xFF, 0xFE, b'\n'], 1);
        let mut watcher = SourceWatcher::new(dir.path(), "ks", false);
        assert!(watcher.poll().changed());
        let batch = watcher.load_sources();
        assert_eq!(batch.diagnostics.len(), 1);
        assert_eq!(batch.diagnostics[0].code, DiagnosticCode::SourceUnreadable);
        assert!(batch.diagnostics[0].is_error());
        assert_eq!(batch.diagnostics[0].location.path, bad);
    }

    #[test]
    fn missing_root_reports_no_change() {
        let mut watcher = SourceWatcher::new("definitely/not/a/real/dir", "ks", false);
        assert_eq!(watcher.poll(), WatchStatus::NoChange);
        assert!(watcher.load_sources().files.is_empty());
    }
}
