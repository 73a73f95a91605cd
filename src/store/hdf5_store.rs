//! HDF5 implementation of the hierarchical store
//!
//! One directory of `.h5` files. Each capture becomes a chunked, compressed
//! 1-D `f64` dataset with its metadata stored as attributes.

use super::{DatasetAttrs, HierarchicalStore, StoredDataset, FILE_EXTENSION};
use crate::error::{Result, StationError};
use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File};
use std::path::{Path, PathBuf};

const CHUNK_SIZE: usize = 1024;

/// Directory of HDF5 record files
#[derive(Debug, Clone)]
pub struct Hdf5Store {
    dir: PathBuf,
}

impl Hdf5Store {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn open(&self, file: &str) -> Result<File> {
        File::open(self.path(file))
            .map_err(|e| StationError::Storage(format!("Failed to open HDF5 file {}: {}", file, e)))
    }

    fn open_rw(&self, file: &str) -> Result<File> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            StationError::Storage(format!("Failed to create store directory {}: {}", self.dir.display(), e))
        })?;
        File::append(self.path(file))
            .map_err(|e| StationError::Storage(format!("Failed to open HDF5 file {} for writing: {}", file, e)))
    }

    fn write_attrs(ds: &Dataset, attrs: &DatasetAttrs) -> Result<()> {
        ds.new_attr::<u8>()
            .shape(attrs.channels.len())
            .create("channels")
            .and_then(|attr| attr.write_raw(attrs.channels.as_slice()))
            .map_err(|e| StationError::Storage(format!("Failed to write channels: {}", e)))?;

        ds.new_attr::<u64>()
            .create("samples_per_channel")
            .and_then(|attr| attr.write_scalar(&attrs.samples_per_channel))
            .map_err(|e| StationError::Storage(format!("Failed to write samples_per_channel: {}", e)))?;

        ds.new_attr::<f64>()
            .create("sampling_rate")
            .and_then(|attr| attr.write_scalar(&attrs.sampling_rate))
            .map_err(|e| StationError::Storage(format!("Failed to write sampling_rate: {}", e)))?;

        ds.new_attr::<u8>()
            .create("address")
            .and_then(|attr| attr.write_scalar(&attrs.address))
            .map_err(|e| StationError::Storage(format!("Failed to write address: {}", e)))?;

        ds.new_attr::<f64>()
            .create("actual_sampling_rate")
            .and_then(|attr| attr.write_scalar(&attrs.actual_sampling_rate))
            .map_err(|e| StationError::Storage(format!("Failed to write actual_sampling_rate: {}", e)))?;

        let timestamp: VarLenUnicode = attrs
            .timestamp
            .parse()
            .map_err(|e| StationError::Storage(format!("Invalid timestamp attribute: {}", e)))?;
        ds.new_attr::<VarLenUnicode>()
            .create("timestamp")
            .and_then(|attr| attr.write_scalar(&timestamp))
            .map_err(|e| StationError::Storage(format!("Failed to write timestamp: {}", e)))?;

        Ok(())
    }

    fn read_attrs(ds: &Dataset) -> Result<DatasetAttrs> {
        let channels = ds
            .attr("channels")
            .and_then(|attr| attr.read_raw::<u8>())
            .map_err(|e| StationError::Storage(format!("Failed to read channels: {}", e)))?;

        let samples_per_channel = ds
            .attr("samples_per_channel")
            .and_then(|attr| attr.read_scalar::<u64>())
            .map_err(|e| StationError::Storage(format!("Failed to read samples_per_channel: {}", e)))?;

        let sampling_rate = ds
            .attr("sampling_rate")
            .and_then(|attr| attr.read_scalar::<f64>())
            .map_err(|e| StationError::Storage(format!("Failed to read sampling_rate: {}", e)))?;

        let address = ds
            .attr("address")
            .and_then(|attr| attr.read_scalar::<u8>())
            .map_err(|e| StationError::Storage(format!("Failed to read address: {}", e)))?;

        let actual_sampling_rate = ds
            .attr("actual_sampling_rate")
            .and_then(|attr| attr.read_scalar::<f64>())
            .map_err(|e| StationError::Storage(format!("Failed to read actual_sampling_rate: {}", e)))?;

        let timestamp = ds
            .attr("timestamp")
            .and_then(|attr| attr.read_scalar::<VarLenUnicode>())
            .map(|s| s.to_string())
            .map_err(|e| StationError::Storage(format!("Failed to read timestamp: {}", e)))?;

        Ok(DatasetAttrs {
            channels,
            samples_per_channel,
            sampling_rate,
            address,
            actual_sampling_rate,
            timestamp,
        })
    }
}

/// Last path component of an HDF5 object name
fn leaf_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

impl HierarchicalStore for Hdf5Store {
    fn list_files(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == FILE_EXTENSION) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn groups(&self, file: &str) -> Result<Vec<String>> {
        let h5 = self.open(file)?;
        let mut names: Vec<String> = h5
            .groups()
            .map_err(|e| StationError::Storage(format!("Failed to list groups in {}: {}", file, e)))?
            .iter()
            .map(|g| leaf_name(&g.name()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn datasets(&self, file: &str, group: &str) -> Result<Vec<String>> {
        let h5 = self.open(file)?;
        let mut names: Vec<String> = h5
            .group(group)
            .and_then(|g| g.datasets())
            .map_err(|e| StationError::Storage(format!("Failed to list datasets in {}/{}: {}", file, group, e)))?
            .iter()
            .map(|ds| leaf_name(&ds.name()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn ensure_group(&mut self, file: &str, group: &str) -> Result<()> {
        let h5 = self.open_rw(file)?;
        if !h5.link_exists(group) {
            h5.create_group(group)
                .map_err(|e| StationError::Storage(format!("Failed to create group {}/{}: {}", file, group, e)))?;
        }
        Ok(())
    }

    fn contains_dataset(&self, file: &str, group: &str, name: &str) -> Result<bool> {
        if !self.path(file).is_file() {
            return Ok(false);
        }
        let h5 = self.open(file)?;
        if !h5.link_exists(group) {
            return Ok(false);
        }
        let g = h5
            .group(group)
            .map_err(|e| StationError::Storage(format!("Failed to open group {}/{}: {}", file, group, e)))?;
        Ok(g.link_exists(name))
    }

    fn write_dataset(&mut self, file: &str, group: &str, name: &str, dataset: &StoredDataset) -> Result<()> {
        let h5 = self.open_rw(file)?;
        let g = h5
            .group(group)
            .map_err(|e| StationError::Storage(format!("Failed to open group {}/{}: {}", file, group, e)))?;
        if g.link_exists(name) {
            return Err(StationError::Storage(format!(
                "Dataset '{}/{}/{}' already exists",
                file, group, name
            )));
        }

        let len = dataset.data.len();
        let builder = g.new_dataset::<f64>().shape((len,));
        let builder = if len > 0 {
            builder.chunk((len.min(CHUNK_SIZE),)).deflate(4)
        } else {
            builder
        };
        let ds = builder
            .create(name)
            .map_err(|e| StationError::Storage(format!("Failed to create dataset {}: {}", name, e)))?;
        ds.write_raw(dataset.data.as_slice())
            .map_err(|e| StationError::Storage(format!("Failed to write dataset {}: {}", name, e)))?;
        Self::write_attrs(&ds, &dataset.attrs)?;

        h5.flush()
            .map_err(|e| StationError::Storage(format!("Failed to flush HDF5 file {}: {}", file, e)))?;
        Ok(())
    }

    fn read_dataset(&self, file: &str, group: &str, name: &str) -> Result<StoredDataset> {
        let h5 = self.open(file)?;
        let ds = h5
            .group(group)
            .and_then(|g| g.dataset(name))
            .map_err(|e| StationError::Storage(format!("Failed to open dataset {}/{}/{}: {}", file, group, name, e)))?;
        let data = ds
            .read_raw::<f64>()
            .map_err(|e| StationError::Storage(format!("Failed to read dataset {}: {}", name, e)))?;
        let attrs = Self::read_attrs(&ds)?;
        Ok(StoredDataset { data, attrs })
    }

    fn delete(&mut self, file: &str) -> Result<()> {
        std::fs::remove_file(self.path(file))
            .map_err(|e| StationError::Storage(format!("Failed to delete {}: {}", file, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> StoredDataset {
        StoredDataset {
            data: (0..3000).map(|i| (i as f64 * 0.01).sin()).collect(),
            attrs: DatasetAttrs {
                channels: vec![0, 1],
                samples_per_channel: 1500,
                sampling_rate: 1000.0,
                address: 0,
                actual_sampling_rate: 1000.0,
                timestamp: "2024-03-07:14-30-05".into(),
            },
        }
    }

    #[test]
    fn test_write_read_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Hdf5Store::new(dir.path().join("records"));
        assert!(store.list_files().unwrap().is_empty());

        store.ensure_group("2024-03.h5", "2024-03-07").unwrap();
        store.ensure_group("2024-03.h5", "2024-03-07").unwrap();
        assert!(!store.contains_dataset("2024-03.h5", "2024-03-07", "14-30").unwrap());

        let written = capture();
        store.write_dataset("2024-03.h5", "2024-03-07", "14-30", &written).unwrap();
        assert!(store.contains_dataset("2024-03.h5", "2024-03-07", "14-30").unwrap());

        let read = store.read_dataset("2024-03.h5", "2024-03-07", "14-30").unwrap();
        assert_eq!(read, written);
        assert_eq!(store.groups("2024-03.h5").unwrap(), vec!["2024-03-07"]);
        assert_eq!(store.datasets("2024-03.h5", "2024-03-07").unwrap(), vec!["14-30"]);
    }

    #[test]
    fn test_existing_dataset_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Hdf5Store::new(dir.path());
        store.ensure_group("a.h5", "g").unwrap();
        store.write_dataset("a.h5", "g", "d", &capture()).unwrap();
        assert!(store.write_dataset("a.h5", "g", "d", &capture()).is_err());
    }

    #[test]
    fn test_list_sorted_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Hdf5Store::new(dir.path());
        store.ensure_group("2024-04.h5", "g").unwrap();
        store.ensure_group("2024-03.h5", "g").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a store file").unwrap();

        assert_eq!(store.list_files().unwrap(), vec!["2024-03.h5", "2024-04.h5"]);
        store.delete("2024-03.h5").unwrap();
        assert_eq!(store.list_files().unwrap(), vec!["2024-04.h5"]);
        assert!(!store.contains_dataset("2024-03.h5", "g", "d").unwrap());
    }
}
