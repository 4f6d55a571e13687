// src/main.rs
// Headless demo run: record from the configured device (the simulator by
// default), load the recording as a dataset, run any configured routine
// libraries over it and save the analysis session.
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use musepy::drivers::{save_figure_png, PlotStyle};
use musepy::jobs::{JobOutput, RoutineModule, SharedLibraryModule};
use musepy::recorder::RecordingArtifacts;
use musepy::{
    AnalysisSession, AppConfig, ConnectionHandle, Engine, EngineCommand, EngineMessage, JobKind,
    RecordingMetadata, SessionStore, WorkerPool,
};

const ENGINE_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
const JOB_TIMEOUT: Duration = Duration::from_secs(600);

fn main() -> Result<()> {
    env_logger::init();
    let config = AppConfig::from_env().context("loading configuration")?;
    info!(
        "musepy {} ({})",
        env!("CARGO_PKG_VERSION"),
        config.acquisition.device_mode()
    );

    let artifacts = record(&config)?;
    let session = Arc::new(AnalysisSession::new());
    let label = session
        .add_dataset(None, &artifacts.data_file)
        .context("loading the recording as a dataset")?;

    run_routines(&config, &session, &label)?;

    let store = SessionStore::new(&config.sessions_dir);
    let path = store.save(&session, &label)?;
    info!("session written to {}", path.display());
    Ok(())
}

/// Next message that is not a log line. Log lines are forwarded to the logger.
fn next_message(engine: &Engine, deadline: Instant) -> Result<EngineMessage> {
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            bail!("acquisition engine did not answer in time");
        }
        match engine.recv_timeout(left) {
            Some(EngineMessage::Log(line)) => info!("[engine] {line}"),
            Some(EngineMessage::Error(e)) => return Err(e.into()),
            Some(EngineMessage::RecordingFailed(reason)) => bail!("recording failed: {reason}"),
            Some(msg) => return Ok(msg),
            None => {}
        }
    }
}

fn record(config: &AppConfig) -> Result<RecordingArtifacts> {
    let engine = Engine::spawn().context("starting the acquisition engine")?;
    let send = |cmd: EngineCommand| {
        engine
            .send(cmd)
            .map_err(|_| anyhow!("acquisition engine stopped"))
    };

    send(EngineCommand::Connect(config.acquisition.clone()))?;
    let deadline = Instant::now() + ENGINE_REPLY_TIMEOUT;
    let handle: ConnectionHandle = loop {
        if let EngineMessage::Connected(handle) = next_message(&engine, deadline)? {
            break handle;
        }
    };

    send(EngineCommand::StartStream)?;
    let mut metadata =
        RecordingMetadata::new(handle.layout.clone(), handle.sample_rate_hz, handle.mode);
    if let Some(subject) = &config.subject_id {
        metadata = metadata.with_subject(subject.as_str());
    }
    if let Some(description) = &config.description {
        metadata = metadata.with_description(description.as_str());
    }
    send(EngineCommand::StartRecording(metadata))?;

    let until = Instant::now() + Duration::from_secs(config.demo_seconds);
    while Instant::now() < until {
        while let Some(msg) = engine.try_recv() {
            match msg {
                EngineMessage::Log(line) => info!("[engine] {line}"),
                EngineMessage::Error(e) => return Err(e.into()),
                EngineMessage::RecordingFailed(reason) => bail!("recording failed: {reason}"),
                _ => {}
            }
        }
        let window = handle.reader.snapshot();
        info!(
            "live window: {} samples over {:?}",
            window.timestamps.len(),
            window.channel_labels
        );
        thread::sleep(Duration::from_secs(1).min(until.saturating_duration_since(Instant::now())));
    }

    send(EngineCommand::StopRecording)?;
    let deadline = Instant::now() + ENGINE_REPLY_TIMEOUT;
    loop {
        if let EngineMessage::RecordingStopped(summary) = next_message(&engine, deadline)? {
            info!(
                "recorded {} EEG samples, {} IMU and {} PPG readings in {:.1}s",
                summary.eeg_samples,
                summary.imu_readings,
                summary.ppg_readings,
                summary.duration_seconds
            );
            break;
        }
    }

    send(EngineCommand::KeepRecording(config.data_dir.clone()))?;
    let artifacts = loop {
        if let EngineMessage::RecordingSaved(artifacts) = next_message(&engine, deadline)? {
            break artifacts;
        }
    };
    send(EngineCommand::StopStream)?;
    engine.shutdown();
    Ok(artifacts)
}

fn load_routine(path: &Path) -> Result<Arc<dyn RoutineModule>> {
    let module = SharedLibraryModule::load(path)?;
    Ok(Arc::new(module))
}

fn run_routines(config: &AppConfig, session: &Arc<AnalysisSession>, label: &str) -> Result<()> {
    let jobs = [
        (JobKind::Processing, config.processing_library.as_deref()),
        (JobKind::Experiment, config.experiment_library.as_deref()),
    ];
    if jobs.iter().all(|(_, path)| path.is_none()) {
        info!("no routine libraries configured");
        return Ok(());
    }

    let mut pool = WorkerPool::new(config.worker_threads, session.clone())
        .context("starting worker threads")?;
    for (kind, path) in jobs {
        let Some(path) = path else { continue };
        let routine = load_routine(path)?;
        let handle = pool.submit(kind, routine, &[label.to_owned()])?;
        let status = pool.wait(handle, JOB_TIMEOUT)?;
        if !status.is_terminal() {
            warn!("{kind} job {handle:?} is still {status:?}; cancelling");
            pool.cancel(handle)?;
            continue;
        }
        match pool.take_result(handle)? {
            Some(JobOutput::Processed(result)) => {
                info!("processing by `{}` finished", result.routine);
            }
            Some(JobOutput::Experiment(result)) => {
                let figures = config.sessions_dir.join("figures");
                std::fs::create_dir_all(&figures)
                    .with_context(|| format!("creating {}", figures.display()))?;
                for (name, figure) in &result.output.plots {
                    let path = figures.join(format!("{label}_{name}.png"));
                    if let Err(e) = save_figure_png(figure, &PlotStyle::default(), &path) {
                        warn!("figure `{name}` not saved: {e}");
                    }
                }
                for (name, table) in &result.output.tables {
                    info!("table `{name}`: {} rows", table.rows.len());
                }
            }
            None => {}
        }
    }
    pool.shutdown();
    Ok(())
}
