//! Flash workflow: DFU port discovery, external upload, Target rediscovery.
//!
//! A job runs three phases on its own thread:
//!
//! 1. `WaitDfu`: poll for a port absent from the pre-flash snapshot. Not finding
//!    one is fine, the tool may locate the bootloader itself.
//! 2. `Flashing`: hand the image to a [`FirmwareTool`]. Failures end the job.
//! 3. `WaitTarget`: poll again, excluding the snapshot and the DFU port, for the
//!    Target's post-reset enumeration. Not finding one is also fine.
//!
//! Cancellation is observed between phases and on every poll.

pub mod nrfutil;

pub use nrfutil::Nrfutil;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::port::PortEnumerator;
use crate::worker::{Worker, join_within};

/// Default bound on each port-discovery phase.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(12);

/// Default interval between port enumerations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Uploads a firmware image to a device in update mode.
pub trait FirmwareTool: Send + Sync {
    /// Flash `firmware` through `port` (or a port the tool picks itself).
    fn flash(&self, firmware: &Path, port: Option<&str>, baud_rate: u32) -> Result<()>;
}

/// Phase of a flash job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashPhase {
    /// Waiting for the bootloader port.
    WaitDfu,
    /// External tool running.
    Flashing,
    /// Waiting for the Target's new port.
    WaitTarget,
    /// Finished.
    Done,
    /// Aborted with an error or cancellation.
    Failed,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WaitDfu => "WAIT_DFU",
            Self::Flashing => "FLASHING",
            Self::WaitTarget => "WAIT_TARGET",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        })
    }
}

/// Parameters of one flash job.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    /// Firmware image (Intel HEX).
    pub firmware: PathBuf,
    /// Upload baud rate.
    pub baud_rate: u32,
    /// Bound on each discovery phase.
    pub phase_timeout: Duration,
    /// Enumeration interval.
    pub poll_interval: Duration,
    /// Ports attached before the Target was sent to DFU.
    pub excluded_ports: BTreeSet<String>,
}

impl FlashRequest {
    /// Request with default timing.
    pub fn new(firmware: impl Into<PathBuf>, baud_rate: u32, excluded_ports: BTreeSet<String>) -> Self {
        Self {
            firmware: firmware.into(),
            baud_rate,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            excluded_ports,
        }
    }

    /// Override the per-phase timeout.
    #[must_use]
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Override the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Ports discovered by a successful job. Either may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashOutcome {
    /// Bootloader port used for the upload.
    pub dfu_port: Option<String>,
    /// Target's port after reset.
    pub target_port: Option<String>,
}

/// Notification from a flash job, tagged with its job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// Human-readable progress.
    Progress {
        /// Job id.
        job: u64,
        /// Current phase.
        phase: FlashPhase,
        /// Message text.
        message: String,
    },
    /// The job finished.
    Done {
        /// Job id.
        job: u64,
        /// Discovered ports.
        outcome: FlashOutcome,
    },
    /// The job failed or was cancelled.
    Failed {
        /// Job id.
        job: u64,
        /// Failure description.
        message: String,
    },
}

impl FlashEvent {
    /// Job id of the emitting job.
    pub fn job(&self) -> u64 {
        match self {
            Self::Progress { job, .. } | Self::Done { job, .. } | Self::Failed { job, .. } => *job,
        }
    }
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation (or a process interrupt) was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed) || crate::is_interrupted_requested()
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
    }
}

/// Poll `enumerator` until a port outside `exclude` appears.
///
/// At least one enumeration is made even with a zero timeout. When several new
/// ports appear at once the lowest identifier wins. Returns `Ok(None)` on
/// timeout and `Err(Cancelled)` when `cancel` fires.
pub fn wait_for_new_port(
    enumerator: &dyn PortEnumerator,
    exclude: &BTreeSet<String>,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancelToken,
) -> Result<Option<String>> {
    let deadline = Instant::now() + timeout;
    loop {
        cancel.check()?;
        if let Some(port) = enumerator
            .port_names()
            .into_iter()
            .find(|name| !exclude.contains(name))
        {
            return Ok(Some(port));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}

/// One flash invocation.
#[derive(Debug)]
pub struct FlashJob {
    request: FlashRequest,
    phase: FlashPhase,
    dfu_port: Option<String>,
    target_port: Option<String>,
}

impl FlashJob {
    /// Prepare a job in the `WaitDfu` phase.
    pub fn new(request: FlashRequest) -> Self {
        Self {
            request,
            phase: FlashPhase::WaitDfu,
            dfu_port: None,
            target_port: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> FlashPhase {
        self.phase
    }

    /// Run all phases on the calling thread.
    ///
    /// Tool errors come back as [`Error::FlashUpload`] prefixed with
    /// "Firmware upload failed"; cancellation as [`Error::Cancelled`].
    pub fn run(
        &mut self,
        enumerator: &dyn PortEnumerator,
        tool: &dyn FirmwareTool,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(FlashPhase, String),
    ) -> Result<FlashOutcome> {
        let result = self.run_phases(enumerator, tool, cancel, progress);
        self.phase = if result.is_ok() { FlashPhase::Done } else { FlashPhase::Failed };
        result
    }

    fn run_phases(
        &mut self,
        enumerator: &dyn PortEnumerator,
        tool: &dyn FirmwareTool,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(FlashPhase, String),
    ) -> Result<FlashOutcome> {
        cancel.check()?;

        self.enter(FlashPhase::WaitDfu);
        progress(self.phase, "Flash: waiting for DFU port".into());
        self.dfu_port = wait_for_new_port(
            enumerator,
            &self.request.excluded_ports,
            self.request.phase_timeout,
            self.request.poll_interval,
            cancel,
        )?;
        match &self.dfu_port {
            Some(port) => progress(self.phase, format!("Flash: DFU port detected: {port}")),
            None => progress(
                self.phase,
                "Flash: DFU port not detected, will rely on auto-detection".into(),
            ),
        }

        cancel.check()?;
        self.enter(FlashPhase::Flashing);
        progress(
            self.phase,
            format!("Flash: uploading {}", self.request.firmware.display()),
        );
        tool.flash(&self.request.firmware, self.dfu_port.as_deref(), self.request.baud_rate)
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                other => Error::FlashUpload(format!("Firmware upload failed: {other}")),
            })?;
        progress(self.phase, "Flash: firmware upload finished".into());

        cancel.check()?;
        self.enter(FlashPhase::WaitTarget);
        progress(self.phase, "Flash: waiting for Target port".into());
        let mut exclude = self.request.excluded_ports.clone();
        exclude.extend(self.dfu_port.iter().cloned());
        self.target_port = wait_for_new_port(
            enumerator,
            &exclude,
            self.request.phase_timeout,
            self.request.poll_interval,
            cancel,
        )?;

        Ok(FlashOutcome {
            dfu_port: self.dfu_port.clone(),
            target_port: self.target_port.clone(),
        })
    }

    fn enter(&mut self, phase: FlashPhase) {
        info!("Flash phase: {} -> {phase}", self.phase);
        self.phase = phase;
    }
}

/// A flash job running on its own thread.
pub struct FlashOrchestrator {
    job: u64,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl FlashOrchestrator {
    /// Spawn a job. `on_event` receives progress, then exactly one of
    /// [`FlashEvent::Done`] or [`FlashEvent::Failed`].
    pub fn start<F>(
        job: u64,
        request: FlashRequest,
        enumerator: Arc<dyn PortEnumerator>,
        tool: Arc<dyn FirmwareTool>,
        mut on_event: F,
    ) -> Result<Self>
    where
        F: FnMut(FlashEvent) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        debug!(
            "Starting flash job {job}: {} @ {}, excluding {:?}",
            request.firmware.display(),
            request.baud_rate,
            request.excluded_ports
        );

        let handle = std::thread::Builder::new()
            .name(format!("rigctl-flash-{job}"))
            .spawn(move || {
                let mut flash = FlashJob::new(request);
                let mut progress = |phase: FlashPhase, message: String| {
                    on_event(FlashEvent::Progress { job, phase, message });
                };
                let result = flash.run(enumerator.as_ref(), tool.as_ref(), &token, &mut progress);
                let event = match result {
                    Ok(outcome) => FlashEvent::Done { job, outcome },
                    Err(e) => {
                        warn!("Flash job {job} failed: {e}");
                        let message = match e {
                            Error::Cancelled => "Cancelled".to_string(),
                            Error::FlashUpload(msg) => msg,
                            other => other.to_string(),
                        };
                        FlashEvent::Failed { job, message }
                    },
                };
                on_event(event);
            })?;

        Ok(Self {
            job,
            cancel,
            handle: Some(handle),
        })
    }

    /// Job id.
    pub fn job(&self) -> u64 {
        self.job
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the job thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the job thread to exit.
    pub fn join(&mut self, timeout: Duration) -> bool {
        join_within(&mut self.handle, timeout)
    }
}

impl Worker for FlashOrchestrator {
    fn name(&self) -> String {
        format!("flash job {}", self.job)
    }

    fn stop(&self) {
        self.cancel();
    }

    fn is_finished(&self) -> bool {
        FlashOrchestrator::is_finished(self)
    }

    fn join(&mut self, timeout: Duration) -> bool {
        FlashOrchestrator::join(self, timeout)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted firmware tool.

    use super::FirmwareTool;
    use crate::error::{Error, Result};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    pub(crate) struct FakeTool {
        pub(crate) calls: Arc<Mutex<Vec<(PathBuf, Option<String>, u32)>>>,
        pub(crate) fail_with: Option<String>,
        pub(crate) delay: Duration,
    }

    impl FirmwareTool for FakeTool {
        fn flash(&self, firmware: &Path, port: Option<&str>, baud_rate: u32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((firmware.to_path_buf(), port.map(str::to_string), baud_rate));
            std::thread::sleep(self.delay);
            match &self.fail_with {
                Some(msg) => Err(Error::FlashUpload(msg.clone())),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeTool;
    use super::*;
    use crate::port::mock::ScriptedEnumerator;
    use std::sync::mpsc;

    fn ports(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn request(excluded: &[&str]) -> FlashRequest {
        FlashRequest::new("fw/rig_target.hex", 115200, ports(excluded))
            .with_phase_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(1))
    }

    fn run_job(
        enumerator: &ScriptedEnumerator,
        tool: &FakeTool,
        req: FlashRequest,
    ) -> (Result<FlashOutcome>, Vec<(FlashPhase, String)>, FlashJob) {
        let mut job = FlashJob::new(req);
        let mut seen = Vec::new();
        let result = job.run(enumerator, tool, &CancelToken::new(), &mut |phase, msg| {
            seen.push((phase, msg));
        });
        (result, seen, job)
    }

    #[test]
    fn test_dfu_port_found_on_first_poll() {
        let enumerator = ScriptedEnumerator::new(&[&["COM3", "COM4", "COM5"]]);
        let found = wait_for_new_port(
            &enumerator,
            &ports(&["COM3", "COM4"]),
            Duration::from_secs(1),
            Duration::from_millis(200),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(found.as_deref(), Some("COM5"));
        assert_eq!(*enumerator.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_wait_times_out_with_none() {
        let enumerator = ScriptedEnumerator::new(&[&["COM3"]]);
        let found = wait_for_new_port(
            &enumerator,
            &ports(&["COM3"]),
            Duration::from_millis(20),
            Duration::from_millis(5),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_full_job_discovers_both_ports() {
        let enumerator = ScriptedEnumerator::new(&[
            &["COM3", "COM4"],
            &["COM3", "COM4", "COM5"],
            &["COM3", "COM4", "COM5"],
            &["COM3", "COM4", "COM6"],
        ]);
        let tool = FakeTool::default();
        let (result, seen, job) = run_job(&enumerator, &tool, request(&["COM3", "COM4"]));

        assert_eq!(
            result.unwrap(),
            FlashOutcome {
                dfu_port: Some("COM5".into()),
                target_port: Some("COM6".into()),
            }
        );
        assert_eq!(job.phase(), FlashPhase::Done);
        let calls = tool.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.as_deref(), Some("COM5"));
        assert_eq!(calls[0].2, 115200);
        assert!(seen.contains(&(FlashPhase::WaitDfu, "Flash: DFU port detected: COM5".into())));
        assert!(seen.contains(&(FlashPhase::Flashing, "Flash: firmware upload finished".into())));
    }

    #[test]
    fn test_no_dfu_port_still_flashes() {
        let enumerator = ScriptedEnumerator::new(&[&["COM3"]]);
        let tool = FakeTool::default();
        let (result, seen, _) = run_job(&enumerator, &tool, request(&["COM3"]));

        assert_eq!(result.unwrap(), FlashOutcome::default());
        assert_eq!(tool.calls.lock().unwrap()[0].1, None);
        assert!(seen.iter().any(|(_, m)| m.contains("will rely on auto-detection")));
    }

    #[test]
    fn test_tool_failure_is_reported_verbatim() {
        let enumerator = ScriptedEnumerator::new(&[&["COM3", "COM5"]]);
        let tool = FakeTool {
            fail_with: Some("bootloader did not answer".into()),
            ..Default::default()
        };
        let (result, _, job) = run_job(&enumerator, &tool, request(&["COM3"]));

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Firmware upload failed"));
        assert!(err.to_string().contains("bootloader did not answer"));
        assert_eq!(job.phase(), FlashPhase::Failed);
    }

    #[test]
    fn test_cancel_before_start() {
        let enumerator = ScriptedEnumerator::new(&[&["COM3"]]);
        let tool = FakeTool::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut job = FlashJob::new(request(&[]));
        let err = job.run(&enumerator, &tool, &cancel, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(tool.calls.lock().unwrap().is_empty());
        assert_eq!(*enumerator.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_orchestrator_cancel_is_prompt() {
        let enumerator = Arc::new(ScriptedEnumerator::new(&[&["COM3"]]));
        let tool = Arc::new(FakeTool::default());
        let (tx, rx) = mpsc::channel();
        let req = FlashRequest::new("fw.hex", 115200, ports(&["COM3"]))
            .with_phase_timeout(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(10));
        let mut orchestrator = FlashOrchestrator::start(4, req, enumerator, tool.clone(), move |e| {
            let _ = tx.send(e);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        orchestrator.cancel();
        assert!(orchestrator.join(Duration::from_secs(2)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().all(|e| e.job() == 4));
        assert_eq!(
            events.last(),
            Some(&FlashEvent::Failed {
                job: 4,
                message: "Cancelled".into()
            })
        );
        assert!(tool.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_orchestrator_delivers_done() {
        let enumerator = Arc::new(ScriptedEnumerator::new(&[&["COM3", "COM5"], &["COM3", "COM6"]]));
        let tool = Arc::new(FakeTool::default());
        let (tx, rx) = mpsc::channel();
        let mut orchestrator = FlashOrchestrator::start(1, request(&["COM3"]), enumerator, tool, move |e| {
            let _ = tx.send(e);
        })
        .unwrap();
        assert!(orchestrator.join(Duration::from_secs(2)));

        let last = rx.try_iter().last().unwrap();
        assert_eq!(
            last,
            FlashEvent::Done {
                job: 1,
                outcome: FlashOutcome {
                    dfu_port: Some("COM5".into()),
                    target_port: Some("COM6".into()),
                },
            }
        );
    }
}
