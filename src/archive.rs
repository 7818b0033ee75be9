//! Local archive of fetched documents.
//!
//! One JSON file per `(date, parameter)` unit, laid out as
//! `<root>/<parameter>/<YYYYMMDD>_<parameter>.json`. Ingest writes every
//! validated document here when an archive is configured; `weatherflow load`
//! reads the files back into the raw store, skipping any whose SHA-256 matches
//! the hash recorded in `weather_data_metadata` at the last load.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ArchiveError;
use crate::models::{Parameter, RawKey, SourceFile};

// ---

const DATE_FORMAT: &str = "%Y%m%d";

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A file found in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFile {
    pub key: RawKey,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Archive {
    // ---
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Archive { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, key: RawKey) -> PathBuf {
        // ---
        let parameter = key.parameter.as_str();
        self.root.join(parameter).join(format!(
            "{}_{}.json",
            key.date.format(DATE_FORMAT),
            parameter
        ))
    }

    /// Write `document` for `key`, replacing any earlier file.
    pub async fn write(&self, key: RawKey, document: &Value) -> Result<SourceFile, ArchiveError> {
        // ---
        let path = self.path_of(key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
        }
        let bytes = serde_json::to_vec_pretty(document).map_err(|source| ArchiveError::Json {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&path, &bytes).await.map_err(io_error(&path))?;
        debug!("Archived {} to {}", key, path.display());

        Ok(SourceFile {
            path: path.display().to_string(),
            hash: content_hash(&bytes),
        })
    }

    /// Contents of an archived file.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, ArchiveError> {
        tokio::fs::read(path).await.map_err(io_error(path))
    }

    /// Archived files of `parameters` dated within `[start, end]`, ordered by
    /// date then parameter. Files whose names do not follow the layout are
    /// ignored; a parameter without a directory has no files.
    pub async fn list(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        parameters: &[Parameter],
    ) -> Result<Vec<ArchivedFile>, ArchiveError> {
        // ---
        let mut files = Vec::new();
        for parameter in parameters {
            let dir = self.root.join(parameter.as_str());
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir)(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
                let name = entry.file_name();
                let Some(date) = name.to_str().and_then(|n| file_date(n, *parameter)) else {
                    continue;
                };
                if date >= start && date <= end {
                    files.push(ArchivedFile {
                        key: RawKey::new(date, *parameter),
                        path: entry.path(),
                    });
                }
            }
        }
        files.sort_by_key(|f| f.key);
        Ok(files)
    }
}

/// Date of a file named `<YYYYMMDD>_<parameter>.json`.
fn file_date(name: &str, parameter: Parameter) -> Option<NaiveDate> {
    // ---
    let stem = name.strip_suffix(".json")?;
    let date = stem.strip_suffix(parameter.as_str())?.strip_suffix('_')?;
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn scratch(name: &str) -> PathBuf {
        // ---
        let dir = std::env::temp_dir().join(format!(
            "weatherflow-archive-{}-{}",
            name,
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    #[test]
    fn test_layout_and_file_names() {
        // ---
        let archive = Archive::new("/data/raw");
        let path = archive.path_of(RawKey::new(day(19), Parameter::WindSpeed));
        assert_eq!(path, PathBuf::from("/data/raw/wind-speed/20240719_wind-speed.json"));

        assert_eq!(file_date("20240719_wind-speed.json", Parameter::WindSpeed), Some(day(19)));
        assert_eq!(file_date("20240719_psi.json", Parameter::WindSpeed), None);
        assert_eq!(file_date("2024-07-19_psi.json", Parameter::Psi), None);
        assert_eq!(file_date("notes.txt", Parameter::Psi), None);
    }

    #[test]
    fn test_content_hash_is_hex_sha256() {
        // ---
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"{\"items\":[]}"), content_hash(b"{\"items\":[1]}"));
    }

    #[tokio::test]
    async fn test_written_files_are_listed_in_range() {
        // ---
        let root = scratch("list");
        let archive = Archive::new(&root);
        for d in [18, 19, 20] {
            archive
                .write(RawKey::new(day(d), Parameter::Psi), &json!({"items": [d]}))
                .await
                .unwrap();
        }
        let source = archive
            .write(RawKey::new(day(19), Parameter::Pm25), &json!({"items": []}))
            .await
            .unwrap();
        std::fs::write(root.join("psi").join("README"), "not an archive file").unwrap();

        let files = archive
            .list(day(19), day(20), &[Parameter::Psi, Parameter::Pm25, Parameter::Wbgt])
            .await
            .unwrap();
        let keys: Vec<_> = files.iter().map(|f| (f.key.date, f.key.parameter)).collect();
        assert_eq!(
            keys,
            vec![
                (day(19), Parameter::Pm25),
                (day(19), Parameter::Psi),
                (day(20), Parameter::Psi)
            ]
        );

        let bytes = archive.read(&files[0].path).await.unwrap();
        assert_eq!(content_hash(&bytes), source.hash);

        std::fs::remove_dir_all(root).unwrap();
    }
}
