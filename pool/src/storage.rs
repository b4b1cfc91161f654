use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::models::*;

pub const DONATIONS_FILE: &str = "donations.json";
pub const ALLOCATIONS_FILE: &str = "allocations.json";
pub const STEWARDS_FILE: &str = "stewards.json";
pub const META_FILE: &str = "ledger.json";

const META_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("{} is not valid ledger JSON: {source}", .path.display())]
    Corrupt { path: PathBuf, source: serde_json::Error },
    #[error("failed to encode {name}: {source}")]
    Encode { name: &'static str, source: serde_json::Error },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Donations keyed by platform. Every platform always has a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<Platform, Vec<Donation>>",
    into = "BTreeMap<Platform, Vec<Donation>>"
)]
pub struct DonationBuckets(BTreeMap<Platform, Vec<Donation>>);

impl Default for DonationBuckets {
    fn default() -> Self {
        Self::from(BTreeMap::new())
    }
}

impl From<BTreeMap<Platform, Vec<Donation>>> for DonationBuckets {
    fn from(mut map: BTreeMap<Platform, Vec<Donation>>) -> Self {
        for platform in Platform::ALL {
            map.entry(platform).or_default();
        }
        Self(map)
    }
}

impl From<DonationBuckets> for BTreeMap<Platform, Vec<Donation>> {
    fn from(buckets: DonationBuckets) -> Self {
        buckets.0
    }
}

impl DonationBuckets {
    pub fn bucket(&self, platform: Platform) -> &[Donation] {
        self.0.get(&platform).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bucket_mut(&mut self, platform: Platform) -> &mut Vec<Donation> {
        self.0.entry(platform).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Platform, &[Donation])> {
        self.0.iter().map(|(p, d)| (*p, d.as_slice()))
    }
}

/// Everything the ledger persists, loaded and saved as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub donations: DonationBuckets,
    pub allocations: Vec<Allocation>,
    pub stewards: Vec<Steward>,
    pub next_steward_id: u32,
}

impl Default for LedgerSnapshot {
    fn default() -> Self {
        Self {
            donations: DonationBuckets::default(),
            allocations: Vec::new(),
            stewards: Vec::new(),
            next_steward_id: 1,
        }
    }
}

impl LedgerSnapshot {
    /// Lowest id above every loaded steward. `u32::MAX` once the id space is
    /// used up, which the ledger refuses to hand out.
    fn first_free_steward_id(&self) -> u32 {
        self.stewards.iter().map(|s| s.id).max().map_or(1, |id| id.saturating_add(1))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerMeta {
    version: u32,
    next_steward_id: u32,
}

pub trait LedgerStore {
    fn load(&self) -> Result<LedgerSnapshot, StorageError>;
    fn save(&mut self, snapshot: &LedgerSnapshot) -> Result<(), StorageError>;
}

/// Ledger documents as pretty-printed JSON files in one directory.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_doc<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|source| StorageError::Corrupt { path, source }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read { path, source }),
        }
    }

    /// Write `value` next to its final location and fsync it.
    fn stage<T: Serialize>(&self, name: &'static str, value: &T) -> Result<PathBuf, StorageError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|source| StorageError::Encode { name, source })?;
        let tmp = self.dir.join(format!("{name}.tmp"));
        let write = |path: &Path| -> io::Result<()> {
            let mut file = fs::File::create(path)?;
            file.write_all(&bytes)?;
            file.sync_all()
        };
        write(&tmp).map_err(|source| StorageError::Write { path: tmp.clone(), source })?;
        Ok(tmp)
    }
}

impl LedgerStore for JsonDirStore {
    fn load(&self) -> Result<LedgerSnapshot, StorageError> {
        let mut snapshot = LedgerSnapshot {
            donations: self.read_doc(DONATIONS_FILE)?.unwrap_or_default(),
            allocations: self.read_doc(ALLOCATIONS_FILE)?.unwrap_or_default(),
            stewards: self.read_doc(STEWARDS_FILE)?.unwrap_or_default(),
            next_steward_id: 1,
        };
        let meta: Option<LedgerMeta> = self.read_doc(META_FILE)?;
        // Never hand out an id that is already on disk, even if the
        // counter was edited or lost.
        let floor = snapshot.first_free_steward_id();
        snapshot.next_steward_id = meta.map_or(floor, |m| m.next_steward_id.max(floor));
        tracing::debug!(
            dir = %self.dir.display(),
            stewards = snapshot.stewards.len(),
            allocations = snapshot.allocations.len(),
            "Loaded ledger"
        );
        Ok(snapshot)
    }

    fn save(&mut self, snapshot: &LedgerSnapshot) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(|source| StorageError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let meta = LedgerMeta {
            version: META_VERSION,
            next_steward_id: snapshot.next_steward_id,
        };

        // Stage every document before touching the live files so a failure
        // here leaves the previous state intact.
        let mut staged = Vec::with_capacity(4);
        let result = (|| {
            staged.push((self.stage(DONATIONS_FILE, &snapshot.donations)?, DONATIONS_FILE));
            staged.push((self.stage(ALLOCATIONS_FILE, &snapshot.allocations)?, ALLOCATIONS_FILE));
            staged.push((self.stage(STEWARDS_FILE, &snapshot.stewards)?, STEWARDS_FILE));
            staged.push((self.stage(META_FILE, &meta)?, META_FILE));
            Ok::<(), StorageError>(())
        })();
        if let Err(e) = result {
            for (tmp, _) in &staged {
                let _ = fs::remove_file(tmp);
            }
            return Err(e);
        }

        for (tmp, name) in staged {
            let path = self.dir.join(name);
            fs::rename(&tmp, &path).map_err(|source| StorageError::Write { path, source })?;
        }
        tracing::debug!(dir = %self.dir.display(), "Saved ledger");
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Option<LedgerSnapshot>,
    saves: usize,
    fail_saves: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> Option<&LedgerSnapshot> {
        self.snapshot.as_ref()
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        self.saves
    }

    pub fn set_fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self) -> Result<LedgerSnapshot, StorageError> {
        Ok(self.snapshot.clone().unwrap_or_default())
    }

    fn save(&mut self, snapshot: &LedgerSnapshot) -> Result<(), StorageError> {
        if self.fail_saves {
            return Err(StorageError::Unavailable("memory store set to fail".into()));
        }
        self.snapshot = Some(snapshot.clone());
        self.saves += 1;
        Ok(())
    }
}
