//! Content-addressed artifact cache.
//!
//! Entries are staged under `<root>/tmp/` and published with a single
//! directory rename into `<root>/entries/<fingerprint>/`, so a lookup in this
//! or any other process sharing the root never sees a partial entry. Eviction
//! is the reverse: rename out of `entries/`, then delete.
//!
//! The in-memory LRU index mirrors what this process has published, looked up
//! or found at startup. Entries published by other processes are adopted on
//! first lookup.
//!
//! Every handle holds an advisory lock on `<root>/tmp/<owner>.lock` for its
//! lifetime and prefixes everything it stages with `<owner>.`. A sweep removes
//! staging paths whose owner lock can be taken, so leftovers from a crashed
//! writer go on the next sweep while live writers are left alone.

pub mod entry;
pub mod lru;

pub use entry::{CacheEntry, Manifest};
pub use lru::LruIndex;

use crate::error::{Result, SeparationError};
use crate::fingerprint::Fingerprint;
use crate::stems::{EncodedStems, StemLabel};
use entry::{MANIFEST_FILE, stem_file_name};
use fs2::FileExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

const ENTRIES_DIR: &str = "entries";
const STAGING_DIR: &str = "tmp";
const LOCK_SUFFIX: &str = ".lock";

/// Result of a `store` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// This call published the entry.
    Published,
    /// Another writer published first; our copy was discarded.
    AlreadyPresent,
    /// Not stored: the entry cannot fit under the byte ceiling.
    Skipped { reason: String },
}

/// What to evict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Drop least recently used entries until the total is at most `target_bytes`.
    LeastRecentlyUsed { target_bytes: u64 },
    /// Drop one entry.
    Entry(Fingerprint),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed_staging: usize,
    pub removed_corrupt: usize,
    pub entries: usize,
    pub total_bytes: u64,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub root: PathBuf,
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub pinned: usize,
    /// Bytes promised to stores that are still being written
    pub reserved_bytes: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    index: LruIndex,
    /// In-flight reader counts
    pins: HashMap<Fingerprint, usize>,
    /// Dropped from the index, directory not yet discarded
    evicting: HashSet<Fingerprint>,
    /// Bytes held by in-progress stores; counted against the ceiling
    reserved: u64,
}

/// Exclusive lock marking this handle's staging paths as live.
#[derive(Debug)]
struct OwnerLock {
    id: String,
    path: PathBuf,
    file: File,
}

impl OwnerLock {
    fn acquire(staging: &Path) -> Result<Self> {
        for _ in 0..3 {
            let id = uuid::Uuid::new_v4().simple().to_string();
            let path = staging.join(format!("{}{}", id, LOCK_SUFFIX));
            let file = File::options().write(true).create_new(true).open(&path)?;
            match file.try_lock_exclusive() {
                Ok(()) if path.exists() => return Ok(Self { id, path, file }),
                // A sweep took the lock between create and lock and unlinked it.
                Ok(()) => {
                    FileExt::unlock(&file).ok();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(SeparationError::Other(format!(
            "could not lock a staging owner under {}",
            staging.display()
        )))
    }
}

impl Drop for OwnerLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
        FileExt::unlock(&self.file).ok();
    }
}

/// Bytes counted against the ceiling for one store until it publishes or fails.
struct Reservation<'a> {
    cache: &'a ArtifactCache,
    size: u64,
}

impl Reservation<'_> {
    /// Turn the reservation into an index entry under one lock.
    fn commit(mut self, fingerprint: Fingerprint) {
        {
            let mut state = self.cache.state();
            state.reserved -= self.size;
            state.index.insert(fingerprint, self.size);
        }
        self.size = 0;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.size > 0 {
            self.cache.state().reserved -= self.size;
        }
    }
}

/// Shared handle to a cache root. Cheap to clone.
///
/// All methods do blocking filesystem I/O; async callers should use
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
    max_bytes: u64,
    state: Arc<Mutex<CacheState>>,
    owner: Arc<OwnerLock>,
}

impl ArtifactCache {
    /// Open (creating if needed) a cache root and run the startup sweep.
    pub fn open(root: &Path, max_bytes: u64) -> Result<Self> {
        Self::open_with_report(root, max_bytes).map(|(cache, _)| cache)
    }

    /// Like [`ArtifactCache::open`], also returning what the startup sweep did.
    pub fn open_with_report(root: &Path, max_bytes: u64) -> Result<(Self, SweepReport)> {
        fs::create_dir_all(root.join(ENTRIES_DIR))?;
        fs::create_dir_all(root.join(STAGING_DIR))?;
        let owner = OwnerLock::acquire(&root.join(STAGING_DIR))?;

        let cache = Self {
            root: root.to_path_buf(),
            max_bytes,
            state: Arc::new(Mutex::new(CacheState::default())),
            owner: Arc::new(owner),
        };
        let report = cache.sweep()?;
        tracing::info!(
            root = %root.display(),
            entries = report.entries,
            total_bytes = report.total_bytes,
            removed_staging = report.removed_staging,
            removed_corrupt = report.removed_corrupt,
            evicted = report.evicted,
            "artifact cache ready"
        );
        Ok((cache, report))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join(ENTRIES_DIR)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.entries_dir().join(fingerprint.to_hex())
    }

    /// A fresh path under the staging dir owned by this handle.
    fn staging_path(&self, tag: &str) -> PathBuf {
        self.staging_dir().join(format!(
            "{}.{}.{}",
            self.owner.id,
            tag,
            uuid::Uuid::new_v4().simple()
        ))
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Discard abandoned staging paths, drop corrupt entries and rebuild
    /// the LRU index from disk, oldest access first.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            removed_staging: self.sweep_staging()?,
            ..SweepReport::default()
        };

        let mut found: Vec<CacheEntry> = Vec::new();
        for dirent in fs::read_dir(self.entries_dir())? {
            let path = dirent?.path();
            let parsed = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<Fingerprint>().ok());
            let Some(fingerprint) = parsed else {
                tracing::warn!(path = %path.display(), "removing foreign file from cache entries");
                remove_path(&path);
                report.removed_corrupt += 1;
                continue;
            };
            match CacheEntry::load(fingerprint, &path) {
                Ok(entry) => found.push(entry),
                Err(e) => {
                    tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "removing corrupt cache entry");
                    self.discard(&path);
                    report.removed_corrupt += 1;
                }
            }
        }
        found.sort_by_key(|e| e.last_access);

        {
            let mut state = self.state();
            state.index.clear();
            for entry in &found {
                state.index.insert(entry.fingerprint, entry.size);
            }
            report.entries = state.index.len();
            report.total_bytes = state.index.total_size();
        }

        let evicted = self.evict(EvictionPolicy::LeastRecentlyUsed {
            target_bytes: self.max_bytes,
        })?;
        report.evicted = evicted.len();
        if !evicted.is_empty() {
            let state = self.state();
            report.entries = state.index.len();
            report.total_bytes = state.index.total_size();
        }
        Ok(report)
    }

    /// Remove staging paths whose owner no longer holds its lock. Returns
    /// how many were removed.
    pub fn sweep_staging(&self) -> Result<usize> {
        let mut live: HashMap<String, bool> = HashMap::new();
        let mut removed = 0;
        for dirent in fs::read_dir(self.staging_dir())? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            let (owner, is_lock) = match name.strip_suffix(LOCK_SUFFIX) {
                Some(owner) => (owner, true),
                None => (name.split('.').next().unwrap_or(""), false),
            };
            let alive = match live.get(owner) {
                Some(&alive) => alive,
                None => {
                    let alive = self.owner_is_live(owner);
                    live.insert(owner.to_string(), alive);
                    alive
                }
            };
            // Dead owners' lock files are retired by `owner_is_live`.
            if alive || is_lock {
                continue;
            }
            tracing::debug!(path = %dirent.path().display(), "removing abandoned staging path");
            remove_path(&dirent.path());
            removed += 1;
        }
        Ok(removed)
    }

    fn owner_is_live(&self, owner: &str) -> bool {
        if owner == self.owner.id {
            return true;
        }
        let path = self.staging_dir().join(format!("{}{}", owner, LOCK_SUFFIX));
        let file = match File::options().write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot inspect staging owner lock");
                return true;
            }
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                // Unlink while still holding the lock.
                fs::remove_file(&path).ok();
                FileExt::unlock(&file).ok();
                false
            }
            Err(_) => true,
        }
    }

    /// Find a published entry and mark it as used.
    ///
    /// A corrupt entry is treated as a miss and evicted.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        if self.state().evicting.contains(fingerprint) {
            return Ok(None);
        }
        let dir = self.entry_dir(fingerprint);
        if !dir.exists() {
            self.state().index.remove(fingerprint);
            return Ok(None);
        }

        let entry = match CacheEntry::load(*fingerprint, &dir) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "corrupt cache entry treated as miss");
                self.evict(EvictionPolicy::Entry(*fingerprint))?;
                return Ok(None);
            }
        };

        {
            let mut state = self.state();
            if state.evicting.contains(fingerprint) {
                return Ok(None);
            }
            if !state.index.touch(fingerprint) {
                // Published by another process.
                state.index.insert(*fingerprint, entry.size);
            }
        }
        touch_manifest(&dir);
        Ok(Some(entry))
    }

    /// True when the entry is in the index and not being evicted. No I/O.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let state = self.state();
        state.index.contains(fingerprint) && !state.evicting.contains(fingerprint)
    }

    /// Look up and pin an entry for reading. Pinned entries are never evicted.
    pub fn open_reader(&self, fingerprint: &Fingerprint) -> Result<Option<EntryReader>> {
        let Some(entry) = self.lookup(fingerprint)? else {
            return Ok(None);
        };
        {
            // Eviction picks victims and checks pins under this same lock, so
            // an entry still indexed here cannot be discarded while pinned.
            let mut state = self.state();
            if !state.index.contains(fingerprint) || state.evicting.contains(fingerprint) {
                return Ok(None);
            }
            *state.pins.entry(*fingerprint).or_insert(0) += 1;
        }
        Ok(Some(EntryReader {
            entry,
            cache: self.clone(),
        }))
    }

    fn unpin(&self, fingerprint: &Fingerprint) {
        let mut state = self.state();
        if let Some(count) = state.pins.get_mut(fingerprint) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(fingerprint);
            }
        }
    }

    pub fn is_pinned(&self, fingerprint: &Fingerprint) -> bool {
        self.state().pins.contains_key(fingerprint)
    }

    /// Atomically publish encoded stems under `fingerprint`.
    ///
    /// The first publish wins: when the entry already exists this call's data
    /// is discarded. Least recently used entries are evicted first when the
    /// new entry would push the total over the ceiling.
    pub fn store(&self, fingerprint: &Fingerprint, stems: &EncodedStems) -> Result<StoreOutcome> {
        let target = self.entry_dir(fingerprint);
        if target.exists() {
            if CacheEntry::load(*fingerprint, &target).is_ok() {
                self.lookup(fingerprint)?;
                return Ok(StoreOutcome::AlreadyPresent);
            }
            self.evict(EvictionPolicy::Entry(*fingerprint))?;
        }

        let manifest = Manifest::for_stems(*fingerprint, stems);
        let manifest_json = manifest.to_json()?;
        let size = manifest.payload_bytes() + manifest_json.len() as u64;
        if size > self.max_bytes {
            return Ok(StoreOutcome::Skipped {
                reason: format!(
                    "entry is {} bytes, cache ceiling is {}",
                    size, self.max_bytes
                ),
            });
        }

        let Some(reservation) = self.reserve(size) else {
            return Ok(StoreOutcome::Skipped {
                reason: "not enough unpinned entries to evict".to_string(),
            });
        };

        let staging = self.staging_path(&fingerprint.to_hex());
        if let Err(e) = write_staged(&staging, stems, &manifest_json) {
            remove_path(&staging);
            return Err(e);
        }

        match fs::rename(&staging, &target) {
            Ok(()) => {
                sync_dir(&self.entries_dir());
                reservation.commit(*fingerprint);
                tracing::debug!(fingerprint = %fingerprint.short(), bytes = size, "published cache entry");
                Ok(StoreOutcome::Published)
            }
            Err(e) => {
                remove_path(&staging);
                drop(reservation);
                if CacheEntry::load(*fingerprint, &target).is_ok() {
                    self.lookup(fingerprint)?;
                    Ok(StoreOutcome::AlreadyPresent)
                } else {
                    Err(SeparationError::Io(e))
                }
            }
        }
    }

    /// Make room for `size` more bytes and hold them for one store.
    ///
    /// Victim selection, the ceiling check and the reservation happen under
    /// one lock, so concurrent stores cannot all pass the check. `None` when
    /// pinned entries and other reservations leave no room.
    fn reserve(&self, size: u64) -> Option<Reservation<'_>> {
        let (victims, fits) = {
            let mut state = self.state();
            let budget = self.max_bytes.saturating_sub(state.reserved + size);
            let victims = state
                .index
                .victims(budget, |fp| state.pins.contains_key(fp));
            for fingerprint in &victims {
                state.index.remove(fingerprint);
                state.evicting.insert(*fingerprint);
            }
            let fits = state.index.total_size() + state.reserved + size <= self.max_bytes;
            if fits {
                state.reserved += size;
            }
            (victims, fits)
        };
        self.discard_victims(&victims);
        if fits {
            Some(Reservation { cache: self, size })
        } else {
            None
        }
    }

    /// Remove entries per `policy`, skipping pinned entries. Returns what was removed.
    pub fn evict(&self, policy: EvictionPolicy) -> Result<Vec<Fingerprint>> {
        let victims = {
            let mut state = self.state();
            let victims = match policy {
                EvictionPolicy::LeastRecentlyUsed { target_bytes } => state
                    .index
                    .victims(target_bytes, |fp| state.pins.contains_key(fp)),
                EvictionPolicy::Entry(fingerprint) => {
                    if state.pins.contains_key(&fingerprint) {
                        Vec::new()
                    } else {
                        vec![fingerprint]
                    }
                }
            };
            for fingerprint in &victims {
                state.index.remove(fingerprint);
                state.evicting.insert(*fingerprint);
            }
            victims
        };
        self.discard_victims(&victims);
        Ok(victims)
    }

    fn discard_victims(&self, victims: &[Fingerprint]) {
        for fingerprint in victims {
            let dir = self.entry_dir(fingerprint);
            if dir.exists() {
                self.discard(&dir);
                tracing::debug!(fingerprint = %fingerprint.short(), "evicted cache entry");
            }
            self.state().evicting.remove(fingerprint);
        }
    }

    /// Rename an entry out of the namespace, then delete it.
    fn discard(&self, dir: &Path) {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry");
        let grave = self.staging_path(&format!("evict-{}", name));
        match fs::rename(dir, &grave) {
            Ok(()) => remove_path(&grave),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "rename before delete failed");
                remove_path(dir);
            }
        }
    }

    /// Write and delete a scratch file under the root.
    pub fn is_writable(&self) -> bool {
        let scratch = self.staging_path("writable");
        let written = File::create(&scratch).and_then(|mut f| f.write_all(b"ok"));
        fs::remove_file(&scratch).ok();
        written.is_ok()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        CacheStats {
            root: self.root.clone(),
            entries: state.index.len(),
            total_bytes: state.index.total_size(),
            max_bytes: self.max_bytes,
            pinned: state.pins.len(),
            reserved_bytes: state.reserved,
        }
    }

    /// Entries from least to most recently used.
    pub fn lru_order(&self) -> Vec<Fingerprint> {
        self.state().index.oldest_first().copied().collect()
    }
}

/// A pinned entry. Eviction skips it until the reader is dropped.
#[derive(Debug)]
pub struct EntryReader {
    entry: CacheEntry,
    cache: ArtifactCache,
}

impl EntryReader {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn read_stem(&self, label: StemLabel) -> Result<Vec<u8>> {
        self.entry.read_stem(label)
    }

    pub fn read_all(&self) -> Result<EncodedStems> {
        self.entry.read_all()
    }
}

impl Drop for EntryReader {
    fn drop(&mut self) {
        self.cache.unpin(&self.entry.fingerprint);
    }
}

fn write_staged(staging: &Path, stems: &EncodedStems, manifest_json: &[u8]) -> Result<()> {
    fs::create_dir_all(staging)?;
    for stem in &stems.stems {
        write_synced(&staging.join(stem_file_name(stem.label, stems.format)), &stem.bytes)?;
    }
    // Manifest last: a staged dir without one is never valid.
    write_synced(&staging.join(MANIFEST_FILE), manifest_json)?;
    sync_dir(staging);
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        handle.sync_all().ok();
    }
}

fn touch_manifest(dir: &Path) {
    let result = File::options()
        .write(true)
        .open(dir.join(MANIFEST_FILE))
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        tracing::debug!(path = %dir.display(), error = %e, "could not update access time");
    }
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove cache path");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFormat, OutputFormat};
    use crate::stems::{EncodedStem, StemPreset};
    use tempfile::TempDir;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::compute(&[n], AudioFormat::Wav, StemPreset::Two, "v1", OutputFormat::Wav)
    }

    fn disk_bytes(dir: &Path) -> u64 {
        let mut total = 0;
        for dirent in fs::read_dir(dir).unwrap() {
            let path = dirent.unwrap().path();
            total += if path.is_dir() {
                disk_bytes(&path)
            } else {
                fs::metadata(&path).unwrap().len()
            };
        }
        total
    }

    fn stems(fill: u8, len: usize) -> EncodedStems {
        EncodedStems {
            format: OutputFormat::Wav,
            stems: vec![
                EncodedStem {
                    label: StemLabel::Vocals,
                    bytes: vec![fill; len],
                },
                EncodedStem {
                    label: StemLabel::Accompaniment,
                    bytes: vec![fill.wrapping_add(1); len],
                },
            ],
        }
    }

    #[test]
    fn test_store_then_lookup() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 1 << 20).unwrap();

        assert!(cache.lookup(&fp(1)).unwrap().is_none());
        assert_eq!(cache.store(&fp(1), &stems(7, 100)).unwrap(), StoreOutcome::Published);

        let entry = cache.lookup(&fp(1)).unwrap().unwrap();
        assert_eq!(entry.read_all().unwrap(), stems(7, 100));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_first_publish_wins() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 1 << 20).unwrap();

        cache.store(&fp(1), &stems(1, 50)).unwrap();
        assert_eq!(
            cache.store(&fp(1), &stems(2, 50)).unwrap(),
            StoreOutcome::AlreadyPresent
        );
        let entry = cache.lookup(&fp(1)).unwrap().unwrap();
        assert_eq!(entry.read_all().unwrap(), stems(1, 50));
    }

    #[test]
    fn test_oversized_entry_is_skipped() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 100).unwrap();
        assert!(matches!(
            cache.store(&fp(1), &stems(1, 500)).unwrap(),
            StoreOutcome::Skipped { .. }
        ));
        assert!(cache.lookup(&fp(1)).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss_and_removed() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 1 << 20).unwrap();
        cache.store(&fp(1), &stems(1, 50)).unwrap();

        let dir = temp.path().join("entries").join(fp(1).to_hex());
        fs::write(dir.join(MANIFEST_FILE), b"{ not json").unwrap();

        assert!(cache.lookup(&fp(1)).unwrap().is_none());
        assert!(!dir.exists());
        assert_eq!(cache.stats().entries, 0);

        // Recomputation can publish again.
        assert_eq!(cache.store(&fp(1), &stems(3, 50)).unwrap(), StoreOutcome::Published);
    }

    #[test]
    fn test_lru_eviction_before_store() {
        let temp = TempDir::new().unwrap();
        let sizing = ArtifactCache::open(&temp.path().join("sizing"), 1 << 20).unwrap();
        sizing.store(&fp(0), &stems(0, 1000)).unwrap();
        let entry_size = sizing.stats().total_bytes;

        // Room for two entries, not three.
        let ceiling = entry_size * 2 + entry_size / 2;
        let cache = ArtifactCache::open(&temp.path().join("cache"), ceiling).unwrap();
        cache.store(&fp(1), &stems(1, 1000)).unwrap();
        cache.store(&fp(2), &stems(2, 1000)).unwrap();
        cache.lookup(&fp(1)).unwrap();

        cache.store(&fp(3), &stems(3, 1000)).unwrap();
        assert!(cache.lookup(&fp(2)).unwrap().is_none(), "least recently used goes first");
        assert!(cache.lookup(&fp(1)).unwrap().is_some());
        assert!(cache.lookup(&fp(3)).unwrap().is_some());
        assert!(cache.stats().total_bytes <= cache.max_bytes());
    }

    #[test]
    fn test_pinned_entry_survives_eviction() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 1 << 20).unwrap();
        cache.store(&fp(1), &stems(1, 100)).unwrap();
        cache.store(&fp(2), &stems(2, 100)).unwrap();

        let reader = cache.open_reader(&fp(1)).unwrap().unwrap();
        cache.lookup(&fp(2)).unwrap();
        let evicted = cache
            .evict(EvictionPolicy::LeastRecentlyUsed { target_bytes: 0 })
            .unwrap();
        assert_eq!(evicted, vec![fp(2)]);
        assert_eq!(reader.read_stem(StemLabel::Vocals).unwrap(), vec![1u8; 100]);
        assert!(cache.is_pinned(&fp(1)));

        drop(reader);
        assert!(!cache.is_pinned(&fp(1)));
        let evicted = cache
            .evict(EvictionPolicy::LeastRecentlyUsed { target_bytes: 0 })
            .unwrap();
        assert_eq!(evicted, vec![fp(1)]);
    }

    #[test]
    fn test_reopen_rebuilds_index_and_drops_partials() {
        let temp = TempDir::new().unwrap();
        {
            let cache = ArtifactCache::open(temp.path(), 1 << 20).unwrap();
            cache.store(&fp(1), &stems(1, 100)).unwrap();
            cache.store(&fp(2), &stems(2, 100)).unwrap();
        }
        // Crash leftovers: a fresh staging dir with no live owner, and a foreign file.
        let staging = temp.path().join("tmp").join(format!("{}.crashed", fp(3).to_hex()));
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("vocals.wav"), b"half").unwrap();
        fs::write(temp.path().join("entries").join("junk"), b"x").unwrap();

        let (cache, report) = ArtifactCache::open_with_report(temp.path(), 1 << 20).unwrap();
        assert_eq!(report.removed_staging, 1);
        assert!(!staging.exists());
        assert_eq!(report.entries, 2);
        assert_eq!(cache.stats().entries, 2);
        assert!(!temp.path().join("entries").join("junk").exists());
    }

    #[test]
    fn test_sweep_keeps_staging_of_live_handle() {
        let temp = TempDir::new().unwrap();
        let writer = ArtifactCache::open(temp.path(), 1 << 20).unwrap();
        let in_progress = writer.staging_path("in-progress");
        fs::create_dir_all(&in_progress).unwrap();

        let (other, report) = ArtifactCache::open_with_report(temp.path(), 1 << 20).unwrap();
        assert_eq!(report.removed_staging, 0);
        assert!(in_progress.exists());

        drop(writer);
        assert_eq!(other.sweep_staging().unwrap(), 1);
        assert!(!in_progress.exists());
        // The dead owner's lock file is gone too; only ours remains.
        let leftovers: Vec<_> = fs::read_dir(temp.path().join("tmp")).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_concurrent_stores_respect_ceiling() {
        let temp = TempDir::new().unwrap();
        let sizing = ArtifactCache::open(&temp.path().join("sizing"), 1 << 30).unwrap();
        sizing.store(&fp(0), &stems(0, 20_000)).unwrap();
        let entry_size = sizing.stats().total_bytes;

        let ceiling = entry_size * 2 + entry_size / 2;
        let cache = ArtifactCache::open(&temp.path().join("cache"), ceiling).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let workers: Vec<_> = (1..=8u8)
            .map(|n| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.store(&fp(n), &stems(n, 20_000)).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<StoreOutcome> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert!(outcomes.contains(&StoreOutcome::Published));
        let stats = cache.stats();
        assert!(stats.total_bytes <= ceiling, "{} > {}", stats.total_bytes, ceiling);
        assert_eq!(stats.reserved_bytes, 0);
        assert!(disk_bytes(&temp.path().join("cache").join("entries")) <= ceiling);
    }

    #[test]
    fn test_concurrent_stores_of_one_fingerprint_publish_once() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 1 << 30).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let workers: Vec<_> = [10u8, 20u8]
            .into_iter()
            .map(|fill| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    (fill, cache.store(&fp(1), &stems(fill, 50_000)).unwrap())
                })
            })
            .collect();
        let outcomes: Vec<(u8, StoreOutcome)> =
            workers.into_iter().map(|w| w.join().unwrap()).collect();

        let winners: Vec<u8> = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == StoreOutcome::Published)
            .map(|(fill, _)| *fill)
            .collect();
        assert_eq!(winners.len(), 1, "outcomes: {outcomes:?}");
        assert!(outcomes
            .iter()
            .all(|(_, o)| matches!(o, StoreOutcome::Published | StoreOutcome::AlreadyPresent)));

        let entry = cache.lookup(&fp(1)).unwrap().unwrap();
        assert_eq!(entry.read_all().unwrap(), stems(winners[0], 50_000));
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().reserved_bytes, 0);
    }

    #[test]
    fn test_entry_being_evicted_cannot_be_pinned() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 1 << 20).unwrap();
        cache.store(&fp(1), &stems(1, 100)).unwrap();

        // Victim chosen, directory not yet discarded.
        {
            let mut state = cache.state();
            state.index.remove(&fp(1));
            state.evicting.insert(fp(1));
        }
        assert!(cache.open_reader(&fp(1)).unwrap().is_none());
        assert!(!cache.is_pinned(&fp(1)));
        assert!(!cache.contains(&fp(1)));

        cache.discard_victims(&[fp(1)]);
        assert!(cache.lookup(&fp(1)).unwrap().is_none());
    }

    #[test]
    fn test_adopts_entries_from_another_handle() {
        let temp = TempDir::new().unwrap();
        let a = ArtifactCache::open(temp.path(), 1 << 20).unwrap();
        let b = ArtifactCache::open(temp.path(), 1 << 20).unwrap();

        a.store(&fp(1), &stems(1, 10)).unwrap();
        assert_eq!(b.stats().entries, 0);
        assert!(b.lookup(&fp(1)).unwrap().is_some());
        assert_eq!(b.stats().entries, 1);
        assert_eq!(b.store(&fp(1), &stems(9, 10)).unwrap(), StoreOutcome::AlreadyPresent);
    }

    #[test]
    fn test_is_writable() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::open(temp.path(), 1 << 20).unwrap();
        assert!(cache.is_writable());

        fs::remove_dir_all(temp.path()).unwrap();
        assert!(!cache.is_writable());
    }
}
