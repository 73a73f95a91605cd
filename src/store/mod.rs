//! Local hierarchical record storage
//!
//! Records are laid out as file → date group → minute dataset. The
//! [`HierarchicalStore`] trait hides whether that hierarchy lives in HDF5
//! files ([`hdf5_store::Hdf5Store`]) or in memory ([`MemoryStore`]).

pub mod hdf5_store;
pub mod mount;
pub mod remote;

use crate::error::{Result, StationError};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub use hdf5_store::Hdf5Store;

/// Extension of every store file
pub const FILE_EXTENSION: &str = "h5";

/// Metadata attached to every stored capture
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetAttrs {
    pub channels: Vec<u8>,
    pub samples_per_channel: u64,
    pub sampling_rate: f64,
    pub address: u8,
    pub actual_sampling_rate: f64,
    /// `%Y-%m-%d:%H-%M-%S`
    pub timestamp: String,
}

/// Interleaved capture data plus its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDataset {
    pub data: Vec<f64>,
    pub attrs: DatasetAttrs,
}

/// File → group → dataset storage
pub trait HierarchicalStore: Send {
    /// Names of every store file, sorted
    fn list_files(&self) -> Result<Vec<String>>;

    /// Group names inside `file`, sorted
    fn groups(&self, file: &str) -> Result<Vec<String>>;

    /// Dataset names inside `file/group`, sorted
    fn datasets(&self, file: &str, group: &str) -> Result<Vec<String>>;

    /// Create `file` and `group` if either is missing
    fn ensure_group(&mut self, file: &str, group: &str) -> Result<()>;

    fn contains_dataset(&self, file: &str, group: &str, name: &str) -> Result<bool>;

    /// Write a new dataset. Fails if `name` already exists in the group.
    fn write_dataset(&mut self, file: &str, group: &str, name: &str, dataset: &StoredDataset) -> Result<()>;

    fn read_dataset(&self, file: &str, group: &str, name: &str) -> Result<StoredDataset>;

    /// Remove a whole file
    fn delete(&mut self, file: &str) -> Result<()>;
}

/// Monthly file name, e.g. `2024-03.h5`
pub fn month_file_name(timestamp: &DateTime<Local>) -> String {
    format!("{}.{}", timestamp.format("%Y-%m"), FILE_EXTENSION)
}

/// File name for a configured override, adding the extension if missing
pub fn named_file(filename: &str) -> String {
    if filename.ends_with(&format!(".{}", FILE_EXTENSION)) {
        filename.to_string()
    } else {
        format!("{}.{}", filename, FILE_EXTENSION)
    }
}

/// Date group name, e.g. `2024-03-07`
pub fn day_group(timestamp: &DateTime<Local>) -> String {
    timestamp.format("%Y-%m-%d").to_string()
}

/// Minute dataset name, e.g. `14-30`
pub fn minute_dataset(timestamp: &DateTime<Local>) -> String {
    timestamp.format("%H-%M").to_string()
}

/// Timestamp attribute string, e.g. `2024-03-07:14-30-05`
pub fn timestamp_attr(timestamp: &DateTime<Local>) -> String {
    timestamp.format("%Y-%m-%d:%H-%M-%S").to_string()
}

type Tree = BTreeMap<String, BTreeMap<String, BTreeMap<String, StoredDataset>>>;

/// In-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total number of datasets across all files
    pub fn dataset_count(&self) -> usize {
        self.lock().values().flat_map(|groups| groups.values()).map(|d| d.len()).sum()
    }

    fn missing(what: &str, path: String) -> StationError {
        StationError::Storage(format!("No {} '{}'", what, path))
    }
}

impl HierarchicalStore for MemoryStore {
    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn groups(&self, file: &str) -> Result<Vec<String>> {
        self.lock()
            .get(file)
            .map(|groups| groups.keys().cloned().collect())
            .ok_or_else(|| Self::missing("file", file.to_string()))
    }

    fn datasets(&self, file: &str, group: &str) -> Result<Vec<String>> {
        self.lock()
            .get(file)
            .and_then(|groups| groups.get(group))
            .map(|datasets| datasets.keys().cloned().collect())
            .ok_or_else(|| Self::missing("group", format!("{}/{}", file, group)))
    }

    fn ensure_group(&mut self, file: &str, group: &str) -> Result<()> {
        self.lock()
            .entry(file.to_string())
            .or_default()
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    fn contains_dataset(&self, file: &str, group: &str, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .get(file)
            .and_then(|groups| groups.get(group))
            .is_some_and(|datasets| datasets.contains_key(name)))
    }

    fn write_dataset(&mut self, file: &str, group: &str, name: &str, dataset: &StoredDataset) -> Result<()> {
        let mut files = self.lock();
        let datasets = files
            .get_mut(file)
            .and_then(|groups| groups.get_mut(group))
            .ok_or_else(|| Self::missing("group", format!("{}/{}", file, group)))?;
        if datasets.contains_key(name) {
            return Err(StationError::Storage(format!(
                "Dataset '{}/{}/{}' already exists",
                file, group, name
            )));
        }
        datasets.insert(name.to_string(), dataset.clone());
        Ok(())
    }

    fn read_dataset(&self, file: &str, group: &str, name: &str) -> Result<StoredDataset> {
        self.lock()
            .get(file)
            .and_then(|groups| groups.get(group))
            .and_then(|datasets| datasets.get(name))
            .cloned()
            .ok_or_else(|| Self::missing("dataset", format!("{}/{}/{}", file, group, name)))
    }

    fn delete(&mut self, file: &str) -> Result<()> {
        self.lock()
            .remove(file)
            .map(|_| ())
            .ok_or_else(|| Self::missing("file", file.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_dataset(value: f64) -> StoredDataset {
        StoredDataset {
            data: vec![value; 4],
            attrs: DatasetAttrs {
                channels: vec![0],
                samples_per_channel: 4,
                sampling_rate: 1000.0,
                address: 0,
                actual_sampling_rate: 1000.0,
                timestamp: "2024-03-07:14-30-05".into(),
            },
        }
    }

    #[test]
    fn test_naming() {
        let ts = Local.with_ymd_and_hms(2024, 3, 7, 14, 30, 5).unwrap();
        assert_eq!(month_file_name(&ts), "2024-03.h5");
        assert_eq!(day_group(&ts), "2024-03-07");
        assert_eq!(minute_dataset(&ts), "14-30");
        assert_eq!(timestamp_attr(&ts), "2024-03-07:14-30-05");
        assert_eq!(named_file("site_d"), "site_d.h5");
        assert_eq!(named_file("site_d.h5"), "site_d.h5");
    }

    #[test]
    fn test_memory_store_never_overwrites() {
        let mut store = MemoryStore::new();
        store.ensure_group("a.h5", "2024-03-07").unwrap();
        store.write_dataset("a.h5", "2024-03-07", "14-30", &sample_dataset(1.0)).unwrap();
        assert!(store
            .write_dataset("a.h5", "2024-03-07", "14-30", &sample_dataset(2.0))
            .is_err());
        let stored = store.read_dataset("a.h5", "2024-03-07", "14-30").unwrap();
        assert_eq!(stored.data[0], 1.0);
    }

    #[test]
    fn test_memory_store_listing_and_delete() {
        let mut store = MemoryStore::new();
        let shared = store.clone();
        store.ensure_group("b.h5", "g").unwrap();
        store.ensure_group("a.h5", "g").unwrap();
        assert_eq!(shared.list_files().unwrap(), vec!["a.h5", "b.h5"]);
        assert!(store.write_dataset("a.h5", "missing", "d", &sample_dataset(0.0)).is_err());
        store.delete("a.h5").unwrap();
        assert_eq!(shared.list_files().unwrap(), vec!["b.h5"]);
        assert!(store.delete("a.h5").is_err());
        assert_eq!(shared.dataset_count(), 0);
    }
}
