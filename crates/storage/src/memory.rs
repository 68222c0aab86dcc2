//! In-memory `HatchStorage` backend.
//!
//! Committed state lives behind a mutex. A snapshot works on a private copy
//! of that state and remembers every resource it touched; commit publishes
//! only those resources, after checking that none of them was committed by
//! another snapshot since this one began (first committer wins).
//!
//! [`MemoryStorage::open`] additionally writes the committed state to a JSON
//! file after every commit and reloads it on start, which is enough for a
//! single-process deployment or local development.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use hatch_core::{
    Application, BucketRange, ChangeLogEntry, ExperimentRecord, IsolationGroup, PublishStatus,
};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::traits::HatchStorage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    experiments: BTreeMap<String, ExperimentRecord>,
    #[serde(default)]
    changelog: BTreeMap<String, Vec<ChangeLogEntry>>,
    /// Group instances by name, ordered by instance.
    #[serde(default)]
    groups: BTreeMap<String, Vec<IsolationGroup>>,
    /// Ranges by owning experiment.
    #[serde(default)]
    ranges: BTreeMap<String, BucketRange>,
    #[serde(default)]
    next_changelog_id: u64,
}

impl State {
    fn group_ranges(&self, name: &str, instance: u32) -> Vec<BucketRange> {
        let mut ranges: Vec<BucketRange> = self
            .ranges
            .values()
            .filter(|r| r.group_name == name && r.group_instance == instance)
            .cloned()
            .collect();
        ranges.sort_by_key(|r| r.start);
        ranges
    }
}

/// Unit of conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Resource {
    /// The record, its history and its bucket range.
    Experiment(String),
    /// All instances of an isolation group.
    Group(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Experiment(slug) => write!(f, "experiment/{slug}"),
            Resource::Group(name) => write!(f, "isolation-group/{name}"),
        }
    }
}

struct Committed {
    state: State,
    /// Generation at which each resource was last committed.
    stamps: HashMap<Resource, u64>,
    generation: u64,
}

/// Transaction handle for [`MemoryStorage`].
pub struct MemorySnapshot {
    working: State,
    base_generation: u64,
    touched: BTreeSet<Resource>,
}

impl MemorySnapshot {
    fn touch_experiment(&mut self, slug: &str) {
        self.touched.insert(Resource::Experiment(slug.to_string()));
    }

    fn touch_group(&mut self, name: &str) {
        self.touched.insert(Resource::Group(name.to_string()));
    }
}

/// In-memory storage, optionally persisted to a JSON file.
pub struct MemoryStorage {
    committed: Mutex<Committed>,
    path: Option<PathBuf>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Empty, purely in-memory storage.
    pub fn new() -> Self {
        Self::with_state(State::default(), None)
    }

    /// Storage persisted at `path`. Loads the file if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                StorageError::Backend(format!("failed to read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&text).map_err(|e| {
                StorageError::Backend(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            State::default()
        };
        tracing::debug!(path = %path.display(), "opened file-backed storage");
        Ok(Self::with_state(state, Some(path)))
    }

    fn with_state(state: State, path: Option<PathBuf>) -> Self {
        Self {
            committed: Mutex::new(Committed {
                state,
                stamps: HashMap::new(),
                generation: 0,
            }),
            path,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Committed>, StorageError> {
        self.committed
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }
}

fn persist(path: &Path, state: &State) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| StorageError::Backend(format!("failed to serialize state: {e}")))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .and_then(|()| std::fs::rename(&tmp, path))
        .map_err(|e| StorageError::Backend(format!("failed to write {}: {e}", path.display())))
}

fn move_entry<V>(from: &mut BTreeMap<String, V>, to: &mut BTreeMap<String, V>, key: &str) {
    match from.remove(key) {
        Some(value) => {
            to.insert(key.to_string(), value);
        }
        None => {
            to.remove(key);
        }
    }
}

fn not_found(slug: &str) -> StorageError {
    StorageError::ExperimentNotFound {
        slug: slug.to_string(),
    }
}

#[async_trait]
impl HatchStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let committed = self.lock()?;
        Ok(MemorySnapshot {
            working: committed.state.clone(),
            base_generation: committed.generation,
            touched: BTreeSet::new(),
        })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let MemorySnapshot {
            mut working,
            base_generation,
            touched,
        } = snapshot;
        if touched.is_empty() {
            return Ok(());
        }

        let mut guard = self.lock()?;
        let committed = &mut *guard;

        if let Some(resource) = touched
            .iter()
            .find(|r| committed.stamps.get(*r).is_some_and(|g| *g > base_generation))
        {
            return Err(StorageError::SerializationFailure {
                resource: resource.to_string(),
            });
        }

        // Build the next state aside; nothing is visible until it is on disk.
        let mut state = committed.state.clone();
        for resource in &touched {
            match resource {
                Resource::Experiment(slug) => {
                    if let Some(mut entries) = working.changelog.remove(slug) {
                        for entry in entries.iter_mut().filter(|e| e.id == 0) {
                            state.next_changelog_id += 1;
                            entry.id = state.next_changelog_id;
                        }
                        state.changelog.insert(slug.clone(), entries);
                    }
                    move_entry(&mut working.experiments, &mut state.experiments, slug);
                    move_entry(&mut working.ranges, &mut state.ranges, slug);
                }
                Resource::Group(name) => {
                    move_entry(&mut working.groups, &mut state.groups, name);
                }
            }
        }

        if let Some(path) = &self.path {
            persist(path, &state)?;
        }

        committed.state = state;
        committed.generation += 1;
        let generation = committed.generation;
        for resource in touched {
            committed.stamps.insert(resource, generation);
        }
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_experiment(
        &self,
        snapshot: &mut MemorySnapshot,
        mut record: ExperimentRecord,
    ) -> Result<(), StorageError> {
        snapshot.touch_experiment(&record.slug);
        if snapshot.working.experiments.contains_key(&record.slug) {
            return Err(StorageError::AlreadyExists {
                resource: format!("experiment/{}", record.slug),
            });
        }
        record.version = 0;
        snapshot
            .working
            .experiments
            .insert(record.slug.clone(), record);
        Ok(())
    }

    async fn get_experiment_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        slug: &str,
    ) -> Result<ExperimentRecord, StorageError> {
        snapshot.touch_experiment(slug);
        snapshot
            .working
            .experiments
            .get(slug)
            .cloned()
            .ok_or_else(|| not_found(slug))
    }

    async fn update_experiment(
        &self,
        snapshot: &mut MemorySnapshot,
        record: &ExperimentRecord,
    ) -> Result<i64, StorageError> {
        snapshot.touch_experiment(&record.slug);
        let stored = snapshot
            .working
            .experiments
            .get_mut(&record.slug)
            .ok_or_else(|| not_found(&record.slug))?;
        if stored.version != record.version {
            return Err(StorageError::VersionConflict {
                slug: record.slug.clone(),
                expected_version: record.version,
            });
        }
        *stored = ExperimentRecord {
            version: record.version + 1,
            ..record.clone()
        };
        Ok(stored.version)
    }

    async fn latest_changelog_entry(
        &self,
        snapshot: &mut MemorySnapshot,
        slug: &str,
    ) -> Result<Option<ChangeLogEntry>, StorageError> {
        snapshot.touch_experiment(slug);
        Ok(snapshot
            .working
            .changelog
            .get(slug)
            .and_then(|entries| entries.last())
            .cloned())
    }

    async fn append_changelog(
        &self,
        snapshot: &mut MemorySnapshot,
        mut entry: ChangeLogEntry,
    ) -> Result<(), StorageError> {
        snapshot.touch_experiment(&entry.experiment);
        entry.id = 0;
        snapshot
            .working
            .changelog
            .entry(entry.experiment.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn get_bucket_range_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        experiment: &str,
    ) -> Result<Option<BucketRange>, StorageError> {
        snapshot.touch_experiment(experiment);
        Ok(snapshot.working.ranges.get(experiment).cloned())
    }

    async fn latest_isolation_group_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        name: &str,
    ) -> Result<Option<(IsolationGroup, Vec<BucketRange>)>, StorageError> {
        snapshot.touch_group(name);
        let working = &snapshot.working;
        Ok(working
            .groups
            .get(name)
            .and_then(|instances| instances.iter().max_by_key(|g| g.instance))
            .map(|group| (group.clone(), working.group_ranges(name, group.instance))))
    }

    async fn insert_isolation_group(
        &self,
        snapshot: &mut MemorySnapshot,
        group: IsolationGroup,
    ) -> Result<(), StorageError> {
        snapshot.touch_group(&group.name);
        let instances = snapshot
            .working
            .groups
            .entry(group.name.clone())
            .or_default();
        if instances.iter().any(|g| g.instance == group.instance) {
            return Err(StorageError::AlreadyExists {
                resource: format!("isolation-group/{}", group.namespace()),
            });
        }
        instances.push(group);
        instances.sort_by_key(|g| g.instance);
        Ok(())
    }

    async fn insert_bucket_range(
        &self,
        snapshot: &mut MemorySnapshot,
        range: BucketRange,
    ) -> Result<(), StorageError> {
        snapshot.touch_group(&range.group_name);
        snapshot.touch_experiment(&range.experiment);
        let working = &mut snapshot.working;

        let group_exists = working
            .groups
            .get(&range.group_name)
            .is_some_and(|instances| instances.iter().any(|g| g.instance == range.group_instance));
        if !group_exists {
            return Err(StorageError::GroupNotFound {
                name: range.group_name.clone(),
                instance: range.group_instance,
            });
        }
        if working.ranges.contains_key(&range.experiment) {
            return Err(StorageError::AlreadyExists {
                resource: format!("bucket-range/{}", range.experiment),
            });
        }
        if working
            .group_ranges(&range.group_name, range.group_instance)
            .iter()
            .any(|existing| existing.overlaps(&range))
        {
            return Err(StorageError::RangeOverlap {
                name: range.group_name.clone(),
                instance: range.group_instance,
                start: range.start,
                count: range.count,
            });
        }
        working.ranges.insert(range.experiment.clone(), range);
        Ok(())
    }

    async fn get_experiment(&self, slug: &str) -> Result<ExperimentRecord, StorageError> {
        self.lock()?
            .state
            .experiments
            .get(slug)
            .cloned()
            .ok_or_else(|| not_found(slug))
    }

    async fn list_experiments(
        &self,
        application: Option<Application>,
        publish_status: Option<PublishStatus>,
    ) -> Result<Vec<ExperimentRecord>, StorageError> {
        let committed = self.lock()?;
        Ok(committed
            .state
            .experiments
            .values()
            .filter(|r| application.map_or(true, |a| r.application == a))
            .filter(|r| publish_status.map_or(true, |p| r.publish_status == p))
            .cloned()
            .collect())
    }

    async fn list_changelog(&self, slug: &str) -> Result<Vec<ChangeLogEntry>, StorageError> {
        Ok(self
            .lock()?
            .state
            .changelog
            .get(slug)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_bucket_range(
        &self,
        experiment: &str,
    ) -> Result<Option<BucketRange>, StorageError> {
        Ok(self.lock()?.state.ranges.get(experiment).cloned())
    }

    async fn get_isolation_group(
        &self,
        name: &str,
        instance: u32,
    ) -> Result<Option<IsolationGroup>, StorageError> {
        Ok(self
            .lock()?
            .state
            .groups
            .get(name)
            .and_then(|instances| instances.iter().find(|g| g.instance == instance))
            .cloned())
    }

    async fn list_bucket_ranges(
        &self,
        name: &str,
        instance: u32,
    ) -> Result<Vec<BucketRange>, StorageError> {
        Ok(self.lock()?.state.group_ranges(name, instance))
    }
}
