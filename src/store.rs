use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::session::{AnalysisSession, SessionContents};

pub const SESSION_FORMAT: &str = "musepy-session";
pub const SESSION_VERSION: u32 = 1;
pub const SESSION_EXTENSION: &str = "session";

/// Leading fields, read first so a newer layout is reported as a version
/// mismatch instead of a decode error.
#[derive(Deserialize)]
struct Header {
    format: String,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    saved_at: DateTime<Local>,
    session: SessionContents,
}

/// Saves and restores whole analysis sessions as single JSON artifacts.
#[derive(Clone, Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `<dir>/<name>.session`. The file is written next to its final
    /// path and renamed into place, so an interrupted save leaves any older
    /// artifact intact.
    pub fn save(&self, session: &AnalysisSession, name: &str) -> Result<PathBuf, SessionError> {
        fs::create_dir_all(&self.dir).map_err(|source| SessionError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(format!("{name}.{SESSION_EXTENSION}"));
        let tmp = self.dir.join(format!(".{name}.{SESSION_EXTENSION}.tmp"));
        let envelope = Envelope {
            format: SESSION_FORMAT.to_owned(),
            version: SESSION_VERSION,
            saved_at: Local::now(),
            session: session.contents(),
        };
        let json = serde_json::to_vec_pretty(&envelope)?;

        let written = fs::File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &path));
        if let Err(source) = written {
            if tmp.exists() {
                if let Err(e) = fs::remove_file(&tmp) {
                    warn!("could not remove {}: {e}", tmp.display());
                }
            }
            return Err(SessionError::Io { path, source });
        }

        info!(
            "session saved to {} ({} datasets)",
            path.display(),
            envelope.session.datasets.len()
        );
        Ok(path)
    }

    /// Reads a session back. Nothing is returned unless the whole artifact
    /// decodes and every dataset label is valid.
    pub fn load(&self, path: &Path) -> Result<AnalysisSession, SessionError> {
        let incompatible = |reason: String| SessionError::IncompatibleSession {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let header: Header = serde_json::from_str(&text)
            .map_err(|e| incompatible(format!("not a session file: {e}")))?;
        if header.format != SESSION_FORMAT {
            return Err(incompatible(format!("unknown format `{}`", header.format)));
        }
        if header.version != SESSION_VERSION {
            return Err(incompatible(format!(
                "version {} is not supported (expected {SESSION_VERSION})",
                header.version
            )));
        }

        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|e| incompatible(e.to_string()))?;
        let session = AnalysisSession::from_contents(envelope.session)
            .map_err(|e| incompatible(e.to_string()))?;
        info!(
            "session loaded from {} (saved {})",
            path.display(),
            envelope.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use crate::results::{ExperimentOutput, ExperimentResult, ProcessedResult};
    use serde_json::json;

    fn dataset_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "timestamp,time_rel,TP9\n1,0,2\n").unwrap();
        path
    }

    fn round_trip(session: &AnalysisSession) -> AnalysisSession {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        let path = store.save(session, "run").unwrap();
        assert_eq!(path, dir.path().join("sessions").join("run.session"));
        store.load(&path).unwrap()
    }

    #[test]
    fn empty_session_round_trips() {
        let session = AnalysisSession::new();
        let loaded = round_trip(&session);
        assert!(loaded.is_empty());
        assert_eq!(loaded.contents(), session.contents());
    }

    #[test]
    fn processed_dataset_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        session
            .add_dataset(Some("rest"), &dataset_file(dir.path(), "rest.csv"))
            .unwrap();
        session.entry("rest").unwrap().lock().processed = Some(ProcessedResult {
            job: 3,
            routine: "bands".into(),
            inputs: vec!["rest".into()],
            data: json!({ "rest": { "alpha": [1.5, 2.25], "ok": true } }),
        });
        session.set_script(JobKind::Processing, "libbands.so");

        let loaded = round_trip(&session);
        assert_eq!(loaded.labels(), vec!["rest"]);
        assert_eq!(loaded.processed("rest"), session.processed("rest"));
        assert_eq!(loaded.scripts(), session.scripts());
    }

    #[test]
    fn experiment_output_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        session
            .add_dataset(Some("task"), &dataset_file(dir.path(), "task.csv"))
            .unwrap();
        let output = ExperimentOutput::from_value(
            "erp",
            json!({
                "plots": {
                    "mean": {
                        "title": "Mean",
                        "axes": [{ "series": [{ "label": "TP9", "x": [0.0, 0.5], "y": [1.0, -1.0] }] }]
                    }
                },
                "tables": {
                    "summary": { "columns": ["channel", "peak"], "rows": [["TP9", 1.0]] }
                }
            }),
        )
        .unwrap();
        session.entry("task").unwrap().lock().experiments.push(ExperimentResult {
            job: 4,
            routine: "erp".into(),
            inputs: vec!["task".into()],
            output,
        });

        let loaded = round_trip(&session);
        assert_eq!(loaded.experiments("task"), session.experiments("task"));
        assert_eq!(loaded.contents(), session.contents());
    }

    #[test]
    fn floats_survive_exactly() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let dir = tempfile::tempdir().unwrap();
        let session = AnalysisSession::new();
        session
            .add_dataset(Some("noise"), &dataset_file(dir.path(), "noise.csv"))
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let values: Vec<f64> = (0..20_000).map(|_| rng.gen_range(-100.0..100.0)).collect();
        session.entry("noise").unwrap().lock().processed = Some(ProcessedResult {
            job: 1,
            routine: "noise".into(),
            inputs: vec!["noise".into()],
            data: json!({ "values": values }),
        });

        let loaded = round_trip(&session);
        let data = loaded.processed("noise").unwrap().data;
        let back: Vec<f64> = serde_json::from_value(data["values"].clone()).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn version_mismatch_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.session");
        let envelope = json!({
            "format": SESSION_FORMAT,
            "version": SESSION_VERSION + 1,
            "saved_at": Local::now(),
            "session": { "datasets": [] }
        });
        fs::write(&path, envelope.to_string()).unwrap();

        let err = SessionStore::new(dir.path()).load(&path).err().unwrap();
        assert!(matches!(err, SessionError::IncompatibleSession { reason, .. } if reason.contains("version")));
    }

    #[test]
    fn corrupt_or_inconsistent_files_are_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let truncated = dir.path().join("truncated.session");
        fs::write(&truncated, r#"{"format":"musepy-session","version":1,"sess"#).unwrap();
        assert!(matches!(
            store.load(&truncated),
            Err(SessionError::IncompatibleSession { .. })
        ));

        let record = json!({ "dataset": { "label": "a", "path": "a.csv", "kind": "table" } });
        let duplicated = dir.path().join("duplicated.session");
        let envelope = json!({
            "format": SESSION_FORMAT,
            "version": SESSION_VERSION,
            "saved_at": Local::now(),
            "session": { "datasets": [record.clone(), record] }
        });
        fs::write(&duplicated, envelope.to_string()).unwrap();
        assert!(matches!(
            store.load(&duplicated),
            Err(SessionError::IncompatibleSession { reason, .. }) if reason.contains("already in use")
        ));
    }

    #[test]
    fn failed_save_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let path = store.save(&AnalysisSession::new(), "keep").unwrap();
        let before = fs::read_to_string(&path).unwrap();

        // A directory where the temp file should go makes the write fail.
        fs::create_dir(dir.path().join(".keep.session.tmp")).unwrap();
        assert!(matches!(
            store.save(&AnalysisSession::new(), "keep"),
            Err(SessionError::Io { .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }
}
