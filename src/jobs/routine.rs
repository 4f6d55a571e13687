use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};

use libloading::Library;
use log::info;
use serde_json::Value;

use super::{CancelToken, JobKind};
use crate::error::JobError;

/// `{label: file_path}` as handed to every routine.
pub type RoutineInputs = BTreeMap<String, PathBuf>;

pub type ProcessingFn = dyn Fn(&RoutineInputs, &CancelToken) -> Result<Value, String> + Send + Sync;
pub type ExperimentFn =
    dyn Fn(&RoutineInputs, &Value, &CancelToken) -> Result<Value, String> + Send + Sync;

/// A loaded unit of user code exposing processing and/or experiment entry points.
///
/// Errors are returned as display strings; the pool wraps them with job context.
pub trait RoutineModule: Send + Sync {
    fn name(&self) -> &str;
    /// Where the routine can be loaded from again. Recorded in the session.
    fn reference(&self) -> String {
        self.name().to_owned()
    }
    fn provides(&self, kind: JobKind) -> bool;
    fn process(&self, inputs: &RoutineInputs, cancel: &CancelToken) -> Result<Value, String>;
    fn experiment(
        &self,
        inputs: &RoutineInputs,
        processed: &Value,
        cancel: &CancelToken,
    ) -> Result<Value, String>;
}

fn missing(name: &str, kind: JobKind) -> String {
    format!("`{name}` has no `{}` entry point", kind.entry_point())
}

/// In-process routines registered as closures.
pub struct NativeModule {
    name: String,
    reference: Option<String>,
    processing: Option<Box<ProcessingFn>>,
    experiment: Option<Box<ExperimentFn>>,
}

impl NativeModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reference: None,
            processing: None,
            experiment: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_processing(
        mut self,
        f: impl Fn(&RoutineInputs, &CancelToken) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        self.processing = Some(Box::new(f));
        self
    }

    pub fn with_experiment(
        mut self,
        f: impl Fn(&RoutineInputs, &Value, &CancelToken) -> Result<Value, String>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.experiment = Some(Box::new(f));
        self
    }
}

impl RoutineModule for NativeModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn reference(&self) -> String {
        self.reference.clone().unwrap_or_else(|| self.name.clone())
    }

    fn provides(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Processing => self.processing.is_some(),
            JobKind::Experiment => self.experiment.is_some(),
        }
    }

    fn process(&self, inputs: &RoutineInputs, cancel: &CancelToken) -> Result<Value, String> {
        let f = self
            .processing
            .as_ref()
            .ok_or_else(|| missing(&self.name, JobKind::Processing))?;
        f(inputs, cancel)
    }

    fn experiment(
        &self,
        inputs: &RoutineInputs,
        processed: &Value,
        cancel: &CancelToken,
    ) -> Result<Value, String> {
        let f = self
            .experiment
            .as_ref()
            .ok_or_else(|| missing(&self.name, JobKind::Experiment))?;
        f(inputs, processed, cancel)
    }
}

// C ABI. Each entry returns 0 on success and writes a NUL-terminated JSON
// document (or an error message on failure) to `output`, which is released
// with `free_routine_output`.
type ProcessingAbi = unsafe extern "C" fn(*const c_char, *const bool, *mut *mut c_char) -> c_int;
type ExperimentAbi =
    unsafe extern "C" fn(*const c_char, *const c_char, *const bool, *mut *mut c_char) -> c_int;
type FreeAbi = unsafe extern "C" fn(*mut c_char);

/// Routines in a native shared library, loaded at runtime.
pub struct SharedLibraryModule {
    name: String,
    path: PathBuf,
    processing: Option<ProcessingAbi>,
    experiment: Option<ExperimentAbi>,
    free: FreeAbi,
    #[allow(dead_code)]
    lib: Library,
}

impl SharedLibraryModule {
    /// Loads the library and resolves its entry points. A library exporting
    /// neither routine, or no `free_routine_output`, is rejected here.
    pub fn load(path: &Path) -> Result<Self, JobError> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let violation = |detail: String| JobError::ContractViolation {
            routine: name.clone(),
            detail,
        };
        let lib = unsafe { Library::new(path) }
            .map_err(|e| violation(format!("cannot load {}: {e}", path.display())))?;
        // Safety: the symbols are declared with the routine C ABI above.
        let (processing, experiment, free) = unsafe {
            let processing = lib.get::<ProcessingAbi>(b"processing_function\0").ok().map(|s| *s);
            let experiment = lib.get::<ExperimentAbi>(b"experiment_function\0").ok().map(|s| *s);
            let free = lib
                .get::<FreeAbi>(b"free_routine_output\0")
                .map(|s| *s)
                .map_err(|_| violation("no `free_routine_output` export".into()))?;
            (processing, experiment, free)
        };
        if processing.is_none() && experiment.is_none() {
            return Err(violation(
                "exports neither `processing_function` nor `experiment_function`".into(),
            ));
        }
        info!(
            "loaded routine library {} (processing: {}, experiment: {})",
            path.display(),
            processing.is_some(),
            experiment.is_some()
        );
        Ok(Self {
            name,
            path: path.to_path_buf(),
            processing,
            experiment,
            free,
            lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn take_output(&self, code: c_int, output: *mut c_char) -> Result<Value, String> {
        let text = if output.is_null() {
            None
        } else {
            // Safety: the library hands over a NUL-terminated string it allocated.
            let text = unsafe { CStr::from_ptr(output) }.to_string_lossy().into_owned();
            unsafe { (self.free)(output) };
            Some(text)
        };
        match (code, text) {
            (0, Some(text)) => serde_json::from_str(&text)
                .map_err(|e| format!("returned invalid JSON: {e}")),
            (0, None) => Err("returned no output".into()),
            (code, Some(message)) => Err(format!("{message} (code {code})")),
            (code, None) => Err(format!("failed with code {code}")),
        }
    }
}

fn encode(value: &impl serde::Serialize) -> Result<CString, String> {
    let json = serde_json::to_string(value).map_err(|e| e.to_string())?;
    CString::new(json).map_err(|e| e.to_string())
}

impl RoutineModule for SharedLibraryModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn reference(&self) -> String {
        self.path.display().to_string()
    }

    fn provides(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Processing => self.processing.is_some(),
            JobKind::Experiment => self.experiment.is_some(),
        }
    }

    fn process(&self, inputs: &RoutineInputs, cancel: &CancelToken) -> Result<Value, String> {
        let entry = self
            .processing
            .ok_or_else(|| missing(&self.name, JobKind::Processing))?;
        let inputs = encode(inputs)?;
        let mut output: *mut c_char = std::ptr::null_mut();
        let code = unsafe { entry(inputs.as_ptr(), cancel.as_ptr(), &mut output) };
        self.take_output(code, output)
    }

    fn experiment(
        &self,
        inputs: &RoutineInputs,
        processed: &Value,
        cancel: &CancelToken,
    ) -> Result<Value, String> {
        let entry = self
            .experiment
            .ok_or_else(|| missing(&self.name, JobKind::Experiment))?;
        let inputs = encode(inputs)?;
        let processed = encode(processed)?;
        let mut output: *mut c_char = std::ptr::null_mut();
        let code = unsafe {
            entry(
                inputs.as_ptr(),
                processed.as_ptr(),
                cancel.as_ptr(),
                &mut output,
            )
        };
        self.take_output(code, output)
    }
}
