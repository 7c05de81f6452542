//! Per-file persistence shape (spec §4.8 "per-file"): one sidecar file
//! `<name>.<ext>.atbu` beside each data file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{PersistentFileInfo, PersistentInfoSink};
use crate::error::{BackupError, Result};

const SIDECAR_EXTENSION: &str = "atbu";

pub struct PerFileSink {
    root: PathBuf,
}

impl PerFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sidecar_path(data_path: &Path) -> PathBuf {
        let mut name = data_path.as_os_str().to_os_string();
        name.push(".");
        name.push(SIDECAR_EXTENSION);
        PathBuf::from(name)
    }

    fn is_sidecar(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(SIDECAR_EXTENSION)
    }
}

impl PersistentInfoSink for PerFileSink {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self) -> Result<BTreeMap<PathBuf, PersistentFileInfo>> {
        let mut out = BTreeMap::new();
        for data_path in self.discover_data_files()? {
            let sidecar = Self::sidecar_path(&data_path);
            if !sidecar.exists() {
                continue;
            }
            let bytes = fs::read(&sidecar).map_err(BackupError::Io)?;
            let info: PersistentFileInfo = serde_json::from_slice(&bytes)?;
            let rel = data_path.strip_prefix(&self.root).unwrap_or(&data_path).to_path_buf();
            out.insert(rel, info);
        }
        Ok(out)
    }

    fn save(&self, records: &BTreeMap<PathBuf, PersistentFileInfo>) -> Result<()> {
        for (rel, info) in records {
            let data_path = self.root.join(rel);
            let sidecar = Self::sidecar_path(&data_path);
            let bytes = serde_json::to_vec_pretty(info)?;
            let tmp_path = sidecar.with_extension("tmp");
            fs::write(&tmp_path, &bytes).map_err(BackupError::Io)?;
            fs::rename(&tmp_path, &sidecar).map_err(BackupError::Io)?;
        }
        Ok(())
    }

    fn discover_data_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if Self::is_sidecar(entry.path()) {
                continue;
            }
            out.push(entry.path().to_path_buf());
        }
        Ok(out)
    }

    fn remove_data_file(&self, rel: &Path) -> Result<()> {
        let data_path = self.root.join(rel);
        let sidecar = Self::sidecar_path(&data_path);
        if sidecar.exists() {
            fs::remove_file(&sidecar).map_err(BackupError::Io)?;
        }
        if data_path.exists() {
            fs::remove_file(&data_path).map_err(BackupError::Io)?;
        }
        Ok(())
    }

    fn move_data_file(&self, rel: &Path, dest_root: &Path) -> Result<()> {
        let src_data = self.root.join(rel);
        let dest_data = dest_root.join(rel);
        if let Some(parent) = dest_data.parent() {
            fs::create_dir_all(parent).map_err(BackupError::Io)?;
        }
        let src_sidecar = Self::sidecar_path(&src_data);
        fs::rename(&src_data, &dest_data).map_err(BackupError::Io)?;
        if src_sidecar.exists() {
            let dest_sidecar = Self::sidecar_path(&dest_data);
            fs::rename(&src_sidecar, &dest_sidecar).map_err(BackupError::Io)?;
        }
        Ok(())
    }
}
