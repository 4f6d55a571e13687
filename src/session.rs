use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, RecordError, SessionError};
use crate::jobs::JobKind;
use crate::recorder::{load_csv_table, load_recording, SignalTable};
use crate::results::{ExperimentResult, ProcessedResult};

/// How a dataset file is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// Structured `.data` recording export.
    Recording,
    /// Single CSV table.
    Table,
    /// Anything else, handed to routines by path only.
    File,
}

impl DatasetKind {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("data") => DatasetKind::Recording,
            Some(ext) if ext.eq_ignore_ascii_case("csv") => DatasetKind::Table,
            _ => DatasetKind::File,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub label: String,
    pub path: PathBuf,
    pub kind: DatasetKind,
}

impl Dataset {
    /// Tables keyed by signal name (`eeg`, `imu`, `ppg` for recordings, `data` for CSV).
    pub fn tables(&self) -> Result<BTreeMap<String, SignalTable>, RecordError> {
        let mut tables = BTreeMap::new();
        match self.kind {
            DatasetKind::Recording => {
                let file = load_recording(&self.path)?;
                for (kind, table) in file.tables() {
                    tables.insert(kind.key().to_owned(), table.clone());
                }
            }
            DatasetKind::Table => {
                tables.insert("data".to_owned(), load_csv_table(&self.path)?);
            }
            DatasetKind::File => {}
        }
        Ok(tables)
    }
}

/// Results derived from one dataset. Guarded by the dataset's own lock, which
/// is only held to copy results in or out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DerivedResults {
    pub processed: Option<ProcessedResult>,
    pub experiments: Vec<ExperimentResult>,
}

pub struct DatasetEntry {
    dataset: Dataset,
    derived: Mutex<DerivedResults>,
}

impl DatasetEntry {
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn lock(&self) -> MutexGuard<'_, DerivedResults> {
        self.derived.lock()
    }
}

/// Last routine references used for each job kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRefs {
    #[serde(default)]
    pub processing: Option<String>,
    #[serde(default)]
    pub experiment: Option<String>,
}

/// Plain-data form of a session, used for persistence and comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub dataset: Dataset,
    #[serde(default)]
    pub processed: Option<ProcessedResult>,
    #[serde(default)]
    pub experiments: Vec<ExperimentResult>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContents {
    pub datasets: Vec<DatasetRecord>,
    #[serde(default)]
    pub scripts: ScriptRefs,
}

/// Loaded datasets and everything derived from them.
///
/// The label map lock is held only to look entries up or change membership.
/// Derived results sit behind one short-lived lock per dataset. Keeping jobs
/// over the same dataset apart is up to the worker pool.
#[derive(Default)]
pub struct AnalysisSession {
    datasets: RwLock<BTreeMap<String, Arc<DatasetEntry>>>,
    scripts: RwLock<ScriptRefs>,
}

impl AnalysisSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the file at `path`. The label defaults to the file stem.
    pub fn add_dataset(&self, label: Option<&str>, path: &Path) -> Result<String, SessionError> {
        std::fs::metadata(path).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let label = match label {
            Some(label) => label.trim().to_owned(),
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let dataset = Dataset {
            label: label.clone(),
            path: path.to_path_buf(),
            kind: DatasetKind::for_path(path),
        };
        self.insert(dataset, DerivedResults::default())?;
        info!("dataset `{label}` loaded from {}", path.display());
        Ok(label)
    }

    fn insert(&self, dataset: Dataset, derived: DerivedResults) -> Result<(), SessionError> {
        if dataset.label.is_empty() {
            return Err(SessionError::EmptyLabel);
        }
        let mut datasets = self.datasets.write();
        if datasets.contains_key(&dataset.label) {
            return Err(SessionError::DuplicateLabel(dataset.label));
        }
        datasets.insert(
            dataset.label.clone(),
            Arc::new(DatasetEntry {
                dataset,
                derived: Mutex::new(derived),
            }),
        );
        Ok(())
    }

    /// Removes a dataset. A job still running over it keeps its entry alive,
    /// but its results are no longer reachable from the session.
    pub fn remove_dataset(&self, label: &str) -> Result<Dataset, SessionError> {
        let entry = self
            .datasets
            .write()
            .remove(label)
            .ok_or_else(|| SessionError::UnknownLabel(label.to_owned()))?;
        info!("dataset `{label}` removed");
        Ok(entry.dataset.clone())
    }

    pub fn labels(&self) -> Vec<String> {
        self.datasets.read().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.read().is_empty()
    }

    pub fn dataset(&self, label: &str) -> Option<Dataset> {
        self.datasets.read().get(label).map(|e| e.dataset.clone())
    }

    pub fn entry(&self, label: &str) -> Option<Arc<DatasetEntry>> {
        self.datasets.read().get(label).cloned()
    }

    /// Resolves `labels` to entries, sorted by label with duplicates removed.
    pub fn entries(&self, labels: &[String]) -> Result<Vec<Arc<DatasetEntry>>, JobError> {
        let wanted: BTreeSet<&String> = labels.iter().collect();
        let datasets = self.datasets.read();
        wanted
            .into_iter()
            .map(|label| {
                datasets
                    .get(label)
                    .cloned()
                    .ok_or_else(|| JobError::UnknownDataset(label.clone()))
            })
            .collect()
    }

    pub fn processed(&self, label: &str) -> Option<ProcessedResult> {
        let entry = self.entry(label)?;
        let derived = entry.lock();
        derived.processed.clone()
    }

    pub fn experiments(&self, label: &str) -> Vec<ExperimentResult> {
        let Some(entry) = self.entry(label) else {
            return Vec::new();
        };
        let derived = entry.lock();
        derived.experiments.clone()
    }

    pub fn set_script(&self, kind: JobKind, reference: impl Into<String>) {
        let mut scripts = self.scripts.write();
        let slot = match kind {
            JobKind::Processing => &mut scripts.processing,
            JobKind::Experiment => &mut scripts.experiment,
        };
        *slot = Some(reference.into());
    }

    pub fn scripts(&self) -> ScriptRefs {
        self.scripts.read().clone()
    }

    /// Copies the session out. Each dataset is locked briefly, one at a time.
    pub fn contents(&self) -> SessionContents {
        let entries: Vec<Arc<DatasetEntry>> = self.datasets.read().values().cloned().collect();
        let datasets = entries
            .iter()
            .map(|entry| {
                let derived = entry.lock();
                DatasetRecord {
                    dataset: entry.dataset.clone(),
                    processed: derived.processed.clone(),
                    experiments: derived.experiments.clone(),
                }
            })
            .collect();
        SessionContents {
            datasets,
            scripts: self.scripts(),
        }
    }

    /// Rebuilds a session. Fails without side effects on empty or repeated labels.
    pub fn from_contents(contents: SessionContents) -> Result<Self, SessionError> {
        let session = Self::new();
        for record in contents.datasets {
            session.insert(
                record.dataset,
                DerivedResults {
                    processed: record.processed,
                    experiments: record.experiments,
                },
            )?;
        }
        *session.scripts.write() = contents.scripts;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "timestamp,time_rel,A\n1,0,5\n").unwrap();
        path
    }

    #[test]
    fn labels_default_to_file_stem_and_stay_unique() {
        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        let path = touch(dir.path(), "rest.csv");

        assert_eq!(session.add_dataset(None, &path).unwrap(), "rest");
        assert!(matches!(
            session.add_dataset(None, &path),
            Err(SessionError::DuplicateLabel(label)) if label == "rest"
        ));
        assert_eq!(session.add_dataset(Some("rest-2"), &path).unwrap(), "rest-2");
        assert!(matches!(
            session.add_dataset(Some("  "), &path),
            Err(SessionError::EmptyLabel)
        ));
        assert_eq!(session.labels(), vec!["rest", "rest-2"]);
        assert_eq!(session.dataset("rest").unwrap().kind, DatasetKind::Table);
    }

    #[test]
    fn missing_file_is_rejected() {
        let session = AnalysisSession::new();
        assert!(matches!(
            session.add_dataset(None, Path::new("/nonexistent/run.data")),
            Err(SessionError::Io { .. })
        ));
        assert!(session.is_empty());
    }

    #[test]
    fn remove_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        session.add_dataset(Some("a"), &touch(dir.path(), "a.bin")).unwrap();
        assert_eq!(session.dataset("a").unwrap().kind, DatasetKind::File);
        assert!(matches!(
            session.entries(&["a".into(), "b".into()]),
            Err(JobError::UnknownDataset(l)) if l == "b"
        ));
        session.remove_dataset("a").unwrap();
        assert!(matches!(
            session.remove_dataset("a"),
            Err(SessionError::UnknownLabel(_))
        ));
    }

    #[test]
    fn csv_dataset_exposes_its_table() {
        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        session.add_dataset(None, &touch(dir.path(), "t.csv")).unwrap();
        let tables = session.dataset("t").unwrap().tables().unwrap();
        assert_eq!(tables["data"].column("A"), Some(vec![5.0]));
    }

    #[test]
    fn contents_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        session.add_dataset(Some("x"), &touch(dir.path(), "x.csv")).unwrap();
        session.entry("x").unwrap().lock().processed = Some(ProcessedResult {
            job: 1,
            routine: "bands".into(),
            inputs: vec!["x".into()],
            data: json!({ "alpha": [1.0, 2.0] }),
        });
        session.set_script(JobKind::Processing, "bands");

        let contents = session.contents();
        let rebuilt = AnalysisSession::from_contents(contents.clone()).unwrap();
        assert_eq!(rebuilt.contents(), contents);
        assert_eq!(rebuilt.scripts().processing.as_deref(), Some("bands"));

        let mut duplicated = contents;
        duplicated.datasets.push(duplicated.datasets[0].clone());
        assert!(matches!(
            AnalysisSession::from_contents(duplicated),
            Err(SessionError::DuplicateLabel(_))
        ));
    }
}
