use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};

use super::routine::{RoutineInputs, RoutineModule};
use super::{CancelToken, JobKind, JobOutput, JobStatus};
use crate::error::JobError;
use crate::results::{ExperimentOutput, ExperimentResult, ProcessedResult};
use crate::session::{AnalysisSession, DatasetEntry};

/// Finished jobs kept for `poll`/`take_result` before the oldest are forgotten.
pub const RETAINED_FINISHED: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobInfo {
    pub id: u64,
    pub kind: JobKind,
    pub routine: String,
    pub inputs: Vec<String>,
    pub status: JobStatus,
    pub submitted_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

/// Lifecycle notifications, for control loops that should not poll.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Started { job: u64, kind: JobKind },
    Finished { job: u64, status: JobStatus },
}

struct JobRecord {
    info: JobInfo,
    cancel: CancelToken,
    output: Option<JobOutput>,
}

struct Task {
    id: u64,
    kind: JobKind,
    routine: Arc<dyn RoutineModule>,
    entries: Vec<Arc<DatasetEntry>>,
    inputs: RoutineInputs,
    cancel: CancelToken,
    /// Dataset labels claimed for this task while it runs.
    held: Vec<String>,
}

/// Queued tasks and the datasets claimed by running ones.
struct Dispatch {
    pending: VecDeque<Task>,
    busy: HashSet<String>,
    open: bool,
}

impl Dispatch {
    /// Takes the first task whose datasets are all free and claims them.
    /// A task never overtakes an earlier one that shares a dataset with it.
    /// Cancelled tasks are handed out without claiming anything.
    fn claim(&mut self) -> Option<Task> {
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut pick = None;
        for (idx, task) in self.pending.iter().enumerate() {
            if task.cancel.is_cancelled() {
                pick = Some((idx, false));
                break;
            }
            let free = task
                .inputs
                .keys()
                .all(|label| !self.busy.contains(label) && !blocked.contains(label.as_str()));
            if free {
                pick = Some((idx, true));
                break;
            }
            blocked.extend(task.inputs.keys().map(String::as_str));
        }
        let (idx, claims) = pick?;
        let mut task = self.pending.remove(idx)?;
        if claims {
            task.held = task.inputs.keys().cloned().collect();
            self.busy.extend(task.held.iter().cloned());
        }
        Some(task)
    }
}

struct Shared {
    session: Arc<AnalysisSession>,
    jobs: Mutex<HashMap<u64, JobRecord>>,
    changed: Condvar,
    dispatch: Mutex<Dispatch>,
    ready: Condvar,
    events: Sender<JobEvent>,
    retained: usize,
}

impl Shared {
    fn update(&self, id: u64, f: impl FnOnce(&mut JobRecord)) {
        let mut jobs = self.jobs.lock();
        if let Some(record) = jobs.get_mut(&id) {
            f(record);
        }
        self.changed.notify_all();
    }

    /// Blocks the calling worker until a task can run, or `None` once the
    /// pool is shut down and drained.
    fn next_task(&self) -> Option<Task> {
        let mut dispatch = self.dispatch.lock();
        loop {
            if let Some(task) = dispatch.claim() {
                return Some(task);
            }
            if !dispatch.open && dispatch.pending.is_empty() {
                return None;
            }
            self.ready.wait(&mut dispatch);
        }
    }

    fn release(&self, labels: &[String]) {
        let mut dispatch = self.dispatch.lock();
        for label in labels {
            dispatch.busy.remove(label);
        }
        self.ready.notify_all();
    }

    fn wake_workers(&self) {
        let _dispatch = self.dispatch.lock();
        self.ready.notify_all();
    }
}

/// Fixed set of worker threads running routine jobs off the caller's thread.
///
/// A worker only picks up a task once every dataset it reads is free, so jobs
/// over disjoint datasets never wait on each other and a queued job never
/// occupies a worker.
pub struct WorkerPool {
    shared: Arc<Shared>,
    events: Receiver<JobEvent>,
    workers: Vec<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(threads: usize, session: Arc<AnalysisSession>) -> std::io::Result<Self> {
        Self::with_retention(threads, session, RETAINED_FINISHED)
    }

    /// Like `new`, keeping at most `retained` finished jobs that were never taken.
    pub fn with_retention(
        threads: usize,
        session: Arc<AnalysisSession>,
        retained: usize,
    ) -> std::io::Result<Self> {
        let (events_tx, events) = unbounded();
        let shared = Arc::new(Shared {
            session,
            jobs: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            dispatch: Mutex::new(Dispatch {
                pending: VecDeque::new(),
                busy: HashSet::new(),
                open: true,
            }),
            ready: Condvar::new(),
            events: events_tx,
            retained,
        });
        let workers = (0..threads.max(1))
            .map(|idx| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("musepy-worker-{idx}"))
                    .spawn(move || {
                        while let Some(task) = shared.next_task() {
                            run_task(&shared, task);
                        }
                        debug!("worker {idx} exiting");
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        info!("worker pool started with {} threads", workers.len());
        Ok(Self {
            shared,
            events,
            workers,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn session(&self) -> &Arc<AnalysisSession> {
        &self.shared.session
    }

    /// Validates and queues a job. Nothing in the session changes on rejection.
    pub fn submit(
        &self,
        kind: JobKind,
        routine: Arc<dyn RoutineModule>,
        inputs: &[String],
    ) -> Result<JobHandle, JobError> {
        if !routine.provides(kind) {
            return Err(JobError::ContractViolation {
                routine: routine.name().to_owned(),
                detail: format!("missing `{}` entry point", kind.entry_point()),
            });
        }
        if !self.shared.dispatch.lock().open {
            return Err(JobError::PoolShutDown);
        }
        let entries = self.shared.session.entries(inputs)?;
        let routine_inputs: RoutineInputs = entries
            .iter()
            .map(|e| (e.dataset().label.clone(), e.dataset().path.clone()))
            .collect();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelToken::default();
        let info = JobInfo {
            id,
            kind,
            routine: routine.name().to_owned(),
            inputs: routine_inputs.keys().cloned().collect(),
            status: JobStatus::Pending,
            submitted_at: Instant::now(),
            started_at: None,
            finished_at: None,
        };
        self.shared.jobs.lock().insert(
            id,
            JobRecord {
                info,
                cancel: cancel.clone(),
                output: None,
            },
        );

        let task = Task {
            id,
            kind,
            routine,
            entries,
            inputs: routine_inputs,
            cancel,
            held: Vec::new(),
        };
        let mut dispatch = self.shared.dispatch.lock();
        if !dispatch.open {
            drop(dispatch);
            self.shared.jobs.lock().remove(&id);
            return Err(JobError::PoolShutDown);
        }
        dispatch.pending.push_back(task);
        self.shared.ready.notify_one();
        drop(dispatch);
        info!("job {id} ({kind}) queued over {:?}", inputs);
        Ok(JobHandle(id))
    }

    /// Current status. Finished jobs are kept until taken, up to the newest
    /// `retained` of them; older ones report `UnknownJob`.
    pub fn poll(&self, handle: JobHandle) -> Result<JobStatus, JobError> {
        self.shared
            .jobs
            .lock()
            .get(&handle.0)
            .map(|r| r.info.status.clone())
            .ok_or(JobError::UnknownJob(handle.0))
    }

    pub fn job_info(&self, handle: JobHandle) -> Option<JobInfo> {
        self.shared.jobs.lock().get(&handle.0).map(|r| r.info.clone())
    }

    /// Asks the job to stop. Returns the status after the request: terminal
    /// jobs are unaffected, others report `CancelRequested` until they stop.
    pub fn cancel(&self, handle: JobHandle) -> Result<JobStatus, JobError> {
        let status = {
            let mut jobs = self.shared.jobs.lock();
            let record = jobs.get_mut(&handle.0).ok_or(JobError::UnknownJob(handle.0))?;
            if !record.info.status.is_terminal() {
                record.cancel.cancel();
                record.info.status = JobStatus::CancelRequested;
                info!("cancellation requested for job {}", handle.0);
            }
            record.info.status.clone()
        };
        // A queued task behind a busy dataset can now be dropped.
        self.shared.wake_workers();
        Ok(status)
    }

    /// Blocks until the job is terminal or `timeout` passes. Not for the control path.
    pub fn wait(&self, handle: JobHandle, timeout: Duration) -> Result<JobStatus, JobError> {
        let deadline = Instant::now() + timeout;
        let mut jobs = self.shared.jobs.lock();
        loop {
            let status = jobs
                .get(&handle.0)
                .map(|r| r.info.status.clone())
                .ok_or(JobError::UnknownJob(handle.0))?;
            if status.is_terminal() {
                return Ok(status);
            }
            if self.shared.changed.wait_until(&mut jobs, deadline).timed_out() {
                return Ok(status);
            }
        }
    }

    /// Hands a finished job over to the caller and forgets it.
    ///
    /// `Ok(None)` while the job is still pending or running.
    pub fn take_result(&self, handle: JobHandle) -> Result<Option<JobOutput>, JobError> {
        let mut jobs = self.shared.jobs.lock();
        let status = jobs
            .get(&handle.0)
            .map(|r| r.info.status.clone())
            .ok_or(JobError::UnknownJob(handle.0))?;
        if !status.is_terminal() {
            return Ok(None);
        }
        let record = jobs.remove(&handle.0).ok_or(JobError::UnknownJob(handle.0))?;
        match (status, record.output) {
            (JobStatus::Succeeded, Some(output)) => Ok(Some(output)),
            (JobStatus::Failed(e), _) => Err(e),
            _ => Err(JobError::Cancelled(handle.0)),
        }
    }

    pub fn events(&self) -> Receiver<JobEvent> {
        self.events.clone()
    }

    /// Stops accepting jobs and joins the workers after the queue drains.
    pub fn shutdown(&mut self) {
        {
            let mut dispatch = self.shared.dispatch.lock();
            if !dispatch.open {
                return;
            }
            dispatch.open = false;
            self.shared.ready.notify_all();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a worker thread panicked outside job isolation");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "routine panicked".to_owned()
    }
}

fn run_task(shared: &Shared, task: Task) {
    execute(shared, &task);
    shared.release(&task.held);
}

fn execute(shared: &Shared, task: &Task) {
    let id = task.id;
    let name = task.routine.name().to_owned();

    if task.cancel.is_cancelled() {
        finish(shared, id, JobStatus::Cancelled, None);
        return;
    }
    shared.update(id, |r| {
        if r.info.status == JobStatus::Pending {
            r.info.status = JobStatus::Running;
        }
        r.info.started_at = Some(Instant::now());
    });
    let _ = shared.events.send(JobEvent::Started { job: id, kind: task.kind });
    info!("job {id} running `{name}`");

    // Derived results are locked only to copy inputs out and to commit.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match task.kind {
        JobKind::Processing => task.routine.process(&task.inputs, &task.cancel),
        JobKind::Experiment => {
            let processed = processed_argument(&task.entries);
            task.routine
                .experiment(&task.inputs, &processed, &task.cancel)
        }
    }));

    let failed = |cause: String| {
        JobStatus::Failed(JobError::JobFailed {
            job: id,
            routine: name.clone(),
            cause,
        })
    };
    let result = match outcome {
        Err(payload) => Err(failed(format!("panicked: {}", panic_message(payload)))),
        Ok(Err(cause)) => Err(failed(cause)),
        Ok(Ok(raw)) => build_output(task, &name, raw).map_err(JobStatus::Failed),
    };

    match result {
        Ok(_) if task.cancel.is_cancelled() => {
            info!("job {id} finished after cancellation; results dropped");
            finish(shared, id, JobStatus::Cancelled, None);
        }
        Ok(output) => {
            for entry in &task.entries {
                let mut derived = entry.lock();
                match &output {
                    JobOutput::Processed(p) => derived.processed = Some(p.clone()),
                    JobOutput::Experiment(e) => derived.experiments.push(e.clone()),
                }
            }
            shared
                .session
                .set_script(task.kind, task.routine.reference());
            finish(shared, id, JobStatus::Succeeded, Some(output));
        }
        Err(status) => {
            if let JobStatus::Failed(e) = &status {
                warn!("{e}");
            }
            finish(shared, id, status, None);
        }
    }
}

/// Checks a routine's raw output against what its job kind must return.
fn build_output(task: &Task, name: &str, raw: Value) -> Result<JobOutput, JobError> {
    let inputs: Vec<String> = task.inputs.keys().cloned().collect();
    match task.kind {
        JobKind::Processing => match raw {
            Value::Object(_) => Ok(JobOutput::Processed(ProcessedResult {
                job: task.id,
                routine: name.to_owned(),
                inputs,
                data: raw,
            })),
            _ => Err(JobError::ContractViolation {
                routine: name.to_owned(),
                detail: "processing output must be a mapping".into(),
            }),
        },
        JobKind::Experiment => Ok(JobOutput::Experiment(ExperimentResult {
            job: task.id,
            routine: name.to_owned(),
            inputs,
            output: ExperimentOutput::from_value(name, raw)?,
        })),
    }
}

/// Processed data handed to an experiment: the shared processing result when
/// all inputs came from one job, else `{label: data}` for the inputs that have one.
fn processed_argument(entries: &[Arc<DatasetEntry>]) -> Value {
    let results: Vec<(&str, ProcessedResult)> = entries
        .iter()
        .filter_map(|e| {
            let processed = e.lock().processed.clone();
            processed.map(|p| (e.dataset().label.as_str(), p))
        })
        .collect();
    if let Some((_, first)) = results.first() {
        if results.len() == entries.len() && results.iter().all(|(_, p)| p.job == first.job) {
            return first.data.clone();
        }
    }
    let mut map = Map::new();
    for (label, p) in results {
        map.insert(label.to_owned(), p.data);
    }
    Value::Object(map)
}

/// Drops the oldest finished records beyond `retained`.
fn prune(jobs: &mut HashMap<u64, JobRecord>, retained: usize) {
    let mut finished: Vec<(Instant, u64)> = jobs
        .values()
        .filter_map(|r| r.info.finished_at.map(|at| (at, r.info.id)))
        .collect();
    if finished.len() <= retained {
        return;
    }
    finished.sort_unstable();
    for (_, id) in &finished[..finished.len() - retained] {
        jobs.remove(id);
        debug!("job {id} forgotten");
    }
}

fn finish(shared: &Shared, id: u64, status: JobStatus, output: Option<JobOutput>) {
    info!("job {id} finished: {status:?}");
    let mut jobs = shared.jobs.lock();
    if let Some(r) = jobs.get_mut(&id) {
        r.info.status = status.clone();
        r.info.finished_at = Some(Instant::now());
        r.output = output;
    }
    prune(&mut jobs, shared.retained);
    // Sent under the lock so the event is queued before anyone sees the terminal status.
    let _ = shared.events.send(JobEvent::Finished { job: id, status });
    drop(jobs);
    shared.changed.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NativeModule;
    use serde_json::json;
    use std::path::Path;

    const WAIT: Duration = Duration::from_secs(5);

    fn session_with(dir: &Path, labels: &[&str]) -> Arc<AnalysisSession> {
        let session = Arc::new(AnalysisSession::new());
        for label in labels {
            let path = dir.join(format!("{label}.csv"));
            std::fs::write(&path, "timestamp,A\n0,1\n").unwrap();
            session.add_dataset(None, &path).unwrap();
        }
        session
    }

    fn labels(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sleeper(ms: u64) -> Arc<dyn RoutineModule> {
        Arc::new(NativeModule::new("sleeper").with_processing(move |inputs, _| {
            thread::sleep(Duration::from_millis(ms));
            Ok(json!({ "inputs": inputs.len() }))
        }))
    }

    /// Routine that reports it started, then holds until the gate opens.
    fn gated() -> (Arc<dyn RoutineModule>, Sender<()>, Receiver<()>) {
        let (gate_tx, gate_rx) = unbounded::<()>();
        let (started_tx, started_rx) = unbounded::<()>();
        let routine: Arc<dyn RoutineModule> =
            Arc::new(NativeModule::new("gated").with_processing(move |_, _| {
                let _ = started_tx.send(());
                let _ = gate_rx.recv_timeout(WAIT);
                Ok(json!({ "gated": true }))
            }));
        (routine, gate_tx, started_rx)
    }

    #[test]
    fn missing_entry_point_leaves_session_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(dir.path(), &["a"]);
        let pool = WorkerPool::new(1, session.clone()).unwrap();
        let before = session.contents();

        let routine: Arc<dyn RoutineModule> =
            Arc::new(NativeModule::new("viz_only").with_experiment(|_, _, _| Ok(json!({}))));
        let err = pool
            .submit(JobKind::Processing, routine, &labels(&["a"]))
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::ContractViolation { ref routine, .. } if routine == "viz_only"
        ));
        assert_eq!(session.contents(), before);
    }

    #[test]
    fn unknown_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, session_with(dir.path(), &["a"])).unwrap();
        assert_eq!(
            pool.submit(JobKind::Processing, sleeper(0), &labels(&["zz"])),
            Err(JobError::UnknownDataset("zz".into()))
        );
    }

    #[test]
    fn processing_then_experiment() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(dir.path(), &["a"]);
        let pool = WorkerPool::new(2, session.clone()).unwrap();
        let events = pool.events();

        let module: Arc<dyn RoutineModule> = Arc::new(
            NativeModule::new("bands")
                .with_processing(|inputs, _| Ok(json!({ "alpha": [1.0, 2.0], "n": inputs.len() })))
                .with_experiment(|_, processed, _| {
                    let alpha = processed["alpha"].clone();
                    Ok(json!({
                        "plots": { "alpha": { "axes": [{ "series": [{ "x": [0.0, 1.0], "y": alpha }] }] } },
                        "tables": { "summary": { "columns": ["n"], "rows": [[processed["n"].clone()]] } }
                    }))
                }),
        );

        let job = pool
            .submit(JobKind::Processing, module.clone(), &labels(&["a"]))
            .unwrap();
        assert_eq!(pool.wait(job, WAIT).unwrap(), JobStatus::Succeeded);
        let processed = session.processed("a").unwrap();
        assert_eq!(processed.data["n"], json!(1));
        assert!(matches!(pool.take_result(job), Ok(Some(JobOutput::Processed(_)))));
        assert!(matches!(pool.poll(job), Err(JobError::UnknownJob(_))));

        let job = pool
            .submit(JobKind::Experiment, module, &labels(&["a"]))
            .unwrap();
        assert_eq!(pool.wait(job, WAIT).unwrap(), JobStatus::Succeeded);
        let experiments = session.experiments("a");
        assert_eq!(experiments.len(), 1);
        assert_eq!(
            experiments[0].output.plots["alpha"].axes[0].series[0].y,
            vec![1.0, 2.0]
        );
        assert_eq!(session.scripts().experiment.as_deref(), Some("bands"));

        let seen: Vec<JobEvent> = events.try_iter().collect();
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[0], JobEvent::Started { kind: JobKind::Processing, .. }));
    }

    #[test]
    fn bad_experiment_shape_is_a_contract_violation() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(dir.path(), &["a"]);
        let pool = WorkerPool::new(1, session.clone()).unwrap();
        let module: Arc<dyn RoutineModule> = Arc::new(
            NativeModule::new("flat").with_experiment(|_, _, _| Ok(json!({ "plots": {} }))),
        );
        let job = pool.submit(JobKind::Experiment, module, &labels(&["a"])).unwrap();
        assert!(matches!(
            pool.wait(job, WAIT).unwrap(),
            JobStatus::Failed(JobError::ContractViolation { .. })
        ));
        assert!(session.experiments("a").is_empty());
    }

    #[test]
    fn routine_errors_and_panics_stay_in_their_job() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, session_with(dir.path(), &["a", "b"])).unwrap();
        let failing: Arc<dyn RoutineModule> =
            Arc::new(NativeModule::new("bad").with_processing(|_, _| Err("file not found".into())));
        let panicking: Arc<dyn RoutineModule> =
            Arc::new(NativeModule::new("boom").with_processing(|_, _| panic!("index out of range")));

        let j1 = pool.submit(JobKind::Processing, failing, &labels(&["a"])).unwrap();
        let j2 = pool.submit(JobKind::Processing, panicking, &labels(&["b"])).unwrap();
        let j3 = pool.submit(JobKind::Processing, sleeper(0), &labels(&["a", "b"])).unwrap();

        match pool.wait(j1, WAIT).unwrap() {
            JobStatus::Failed(JobError::JobFailed { cause, routine, .. }) => {
                assert_eq!(cause, "file not found");
                assert_eq!(routine, "bad");
            }
            other => panic!("unexpected {other:?}"),
        }
        match pool.wait(j2, WAIT).unwrap() {
            JobStatus::Failed(JobError::JobFailed { cause, .. }) => {
                assert!(cause.contains("index out of range"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.wait(j3, WAIT).unwrap(), JobStatus::Succeeded);
        assert!(matches!(pool.take_result(j1), Err(JobError::JobFailed { .. })));
    }

    #[test]
    fn disjoint_jobs_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(2, session_with(dir.path(), &["a", "b"])).unwrap();
        let j1 = pool.submit(JobKind::Processing, sleeper(300), &labels(&["a"])).unwrap();
        let j2 = pool.submit(JobKind::Processing, sleeper(300), &labels(&["b"])).unwrap();
        assert_eq!(pool.wait(j1, WAIT).unwrap(), JobStatus::Succeeded);
        assert_eq!(pool.wait(j2, WAIT).unwrap(), JobStatus::Succeeded);

        let (a, b) = (pool.job_info(j1).unwrap(), pool.job_info(j2).unwrap());
        assert!(a.started_at.unwrap() < b.finished_at.unwrap());
        assert!(b.started_at.unwrap() < a.finished_at.unwrap());
    }

    #[test]
    fn same_dataset_jobs_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(2, session_with(dir.path(), &["a"])).unwrap();
        let j1 = pool.submit(JobKind::Processing, sleeper(150), &labels(&["a"])).unwrap();
        let j2 = pool.submit(JobKind::Processing, sleeper(150), &labels(&["a"])).unwrap();
        assert_eq!(pool.wait(j1, WAIT).unwrap(), JobStatus::Succeeded);
        assert_eq!(pool.wait(j2, WAIT).unwrap(), JobStatus::Succeeded);

        let (first, second) = (pool.job_info(j1).unwrap(), pool.job_info(j2).unwrap());
        let (first, second) = if first.started_at <= second.started_at {
            (first, second)
        } else {
            (second, first)
        };
        assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    }

    #[test]
    fn cooperative_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(dir.path(), &["a", "b"]);
        let pool = WorkerPool::new(1, session.clone()).unwrap();

        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let polite: Arc<dyn RoutineModule> =
            Arc::new(NativeModule::new("polite").with_processing(move |_, cancel| {
                let _ = started_tx.send(());
                while !cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(json!({ "partial": true }))
            }));
        let running = pool.submit(JobKind::Processing, polite, &labels(&["a"])).unwrap();
        let queued = pool.submit(JobKind::Processing, sleeper(0), &labels(&["b"])).unwrap();

        started_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(pool.cancel(queued).unwrap(), JobStatus::CancelRequested);
        assert_eq!(pool.cancel(running).unwrap(), JobStatus::CancelRequested);

        assert_eq!(pool.wait(running, WAIT).unwrap(), JobStatus::Cancelled);
        assert_eq!(pool.wait(queued, WAIT).unwrap(), JobStatus::Cancelled);
        assert!(session.processed("a").is_none());
        assert!(session.processed("b").is_none());
        assert_eq!(pool.take_result(running), Err(JobError::Cancelled(running.id())));
        assert_eq!(pool.cancel(queued).unwrap(), JobStatus::Cancelled);
    }

    #[test]
    fn reads_do_not_wait_for_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(dir.path(), &["a"]);
        let pool = WorkerPool::new(1, session.clone()).unwrap();
        let (routine, gate, started) = gated();
        let job = pool.submit(JobKind::Processing, routine, &labels(&["a"])).unwrap();
        started.recv_timeout(WAIT).unwrap();

        let t0 = Instant::now();
        assert!(session.processed("a").is_none());
        assert!(session.experiments("a").is_empty());
        assert_eq!(session.contents().datasets.len(), 1);
        assert!(t0.elapsed() < Duration::from_millis(100), "{:?}", t0.elapsed());

        gate.send(()).unwrap();
        assert_eq!(pool.wait(job, WAIT).unwrap(), JobStatus::Succeeded);
        assert_eq!(session.processed("a").unwrap().data["gated"], json!(true));
    }

    #[test]
    fn queued_jobs_do_not_hold_workers() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(2, session_with(dir.path(), &["a", "b"])).unwrap();
        let (routine, gate, started) = gated();
        let j1 = pool.submit(JobKind::Processing, routine, &labels(&["a"])).unwrap();
        started.recv_timeout(WAIT).unwrap();
        let j2 = pool.submit(JobKind::Processing, sleeper(0), &labels(&["a"])).unwrap();
        let j3 = pool.submit(JobKind::Processing, sleeper(0), &labels(&["b"])).unwrap();

        assert_eq!(pool.wait(j3, WAIT).unwrap(), JobStatus::Succeeded);
        assert_eq!(pool.poll(j1).unwrap(), JobStatus::Running);
        assert_eq!(pool.poll(j2).unwrap(), JobStatus::Pending);

        gate.send(()).unwrap();
        assert_eq!(pool.wait(j1, WAIT).unwrap(), JobStatus::Succeeded);
        assert_eq!(pool.wait(j2, WAIT).unwrap(), JobStatus::Succeeded);
        let (first, second) = (pool.job_info(j1).unwrap(), pool.job_info(j2).unwrap());
        assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    }

    #[test]
    fn cancelled_job_behind_busy_dataset_ends_early() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(2, session_with(dir.path(), &["a"])).unwrap();
        let (routine, gate, started) = gated();
        let running = pool.submit(JobKind::Processing, routine, &labels(&["a"])).unwrap();
        started.recv_timeout(WAIT).unwrap();
        let queued = pool.submit(JobKind::Processing, sleeper(0), &labels(&["a"])).unwrap();

        pool.cancel(queued).unwrap();
        assert_eq!(pool.wait(queued, WAIT).unwrap(), JobStatus::Cancelled);
        assert_eq!(pool.poll(running).unwrap(), JobStatus::Running);
        gate.send(()).unwrap();
        assert_eq!(pool.wait(running, WAIT).unwrap(), JobStatus::Succeeded);
    }

    #[test]
    fn script_reference_is_recorded_on_success_only() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(dir.path(), &["a"]);
        let pool = WorkerPool::new(1, session.clone()).unwrap();

        let failing: Arc<dyn RoutineModule> = Arc::new(
            NativeModule::new("libbad")
                .with_reference("/opt/routines/libbad.so")
                .with_processing(|_, _| Err("no data".into())),
        );
        let job = pool.submit(JobKind::Processing, failing, &labels(&["a"])).unwrap();
        assert!(matches!(pool.wait(job, WAIT).unwrap(), JobStatus::Failed(_)));
        assert_eq!(session.scripts().processing, None);

        let bands: Arc<dyn RoutineModule> = Arc::new(
            NativeModule::new("libbands")
                .with_reference("/opt/routines/libbands.so")
                .with_processing(|_, _| Ok(json!({}))),
        );
        let job = pool.submit(JobKind::Processing, bands, &labels(&["a"])).unwrap();
        assert_eq!(pool.wait(job, WAIT).unwrap(), JobStatus::Succeeded);
        assert_eq!(
            session.scripts().processing.as_deref(),
            Some("/opt/routines/libbands.so")
        );
    }

    #[test]
    fn old_finished_jobs_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::with_retention(1, session_with(dir.path(), &["a"]), 2).unwrap();
        let jobs: Vec<JobHandle> = (0..4)
            .map(|_| {
                let job = pool.submit(JobKind::Processing, sleeper(0), &labels(&["a"])).unwrap();
                assert_eq!(pool.wait(job, WAIT).unwrap(), JobStatus::Succeeded);
                job
            })
            .collect();
        assert_eq!(pool.poll(jobs[0]), Err(JobError::UnknownJob(jobs[0].id())));
        assert_eq!(pool.poll(jobs[1]), Err(JobError::UnknownJob(jobs[1].id())));
        assert_eq!(pool.poll(jobs[2]).unwrap(), JobStatus::Succeeded);
        assert!(matches!(pool.take_result(jobs[3]), Ok(Some(JobOutput::Processed(_)))));
    }

    #[test]
    fn shut_down_pool_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = WorkerPool::new(1, session_with(dir.path(), &["a"])).unwrap();
        pool.shutdown();
        assert_eq!(
            pool.submit(JobKind::Processing, sleeper(0), &labels(&["a"])),
            Err(JobError::PoolShutDown)
        );
    }
}
