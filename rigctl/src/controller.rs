//! Test session controller.
//!
//! Owns both serial links, the [`TestSession`] and at most one flash job. Link
//! threads and the flash thread never touch session state: they post to a
//! single inbound channel, and [`Controller::pump`] applies those messages on
//! the caller's thread. Results go out as [`UiEvent`]s.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::event::{Control, ControlState, FaultKind, UiEvent};
use crate::flash::{
    DEFAULT_PHASE_TIMEOUT, DEFAULT_POLL_INTERVAL, FirmwareTool, FlashEvent, FlashOrchestrator, FlashOutcome,
    FlashRequest,
};
use crate::link::{LinkConfig, LinkEvent, LinkTiming, SerialLink};
use crate::port::{PortEnumerator, PortOpener, SerialConfig, send_line_once};
use crate::protocol::{LastAction, Role, TestSession};
use crate::store::{SelectionStore, selection_key};
use crate::worker::{Worker, shutdown_all};

/// Command that starts the test on the Master.
pub const CMD_START: &str = "START";

/// Command that puts the Target into its bootloader via the Master.
pub const CMD_FLASH: &str = "FLASH";

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Baud rate of both links and the upload.
    pub baud_rate: u32,
    /// Firmware image for flash operations.
    pub firmware: Option<PathBuf>,
    /// Bound on each flash discovery phase.
    pub phase_timeout: Duration,
    /// Port enumeration interval while flashing.
    pub poll_interval: Duration,
    /// Link loop timing.
    pub link_timing: LinkTiming,
    /// Wait for each worker on shutdown.
    pub shutdown_timeout: Duration,
    /// Wait for each old link when rebinding.
    pub rebind_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            firmware: None,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            link_timing: LinkTiming::default(),
            shutdown_timeout: Duration::from_secs(3),
            rebind_timeout: Duration::from_millis(500),
        }
    }
}

/// Hardware-facing collaborators.
#[derive(Clone)]
pub struct Backend {
    /// Opens link connections.
    pub opener: Arc<dyn PortOpener>,
    /// Lists attached ports.
    pub enumerator: Arc<dyn PortEnumerator>,
    /// Uploads firmware.
    pub tool: Arc<dyn FirmwareTool>,
}

#[cfg(feature = "native")]
impl Backend {
    /// `serialport` devices and `adafruit-nrfutil`.
    pub fn native() -> Self {
        let enumerator: Arc<dyn PortEnumerator> = Arc::new(crate::port::NativePortEnumerator);
        Self {
            opener: Arc::new(crate::port::NativePortOpener),
            tool: Arc::new(crate::flash::Nrfutil::new(Arc::clone(&enumerator))),
            enumerator,
        }
    }
}

/// Messages from worker threads.
#[derive(Debug)]
enum Inbound {
    Link(LinkEvent),
    Flash(FlashEvent),
}

/// Top-level coordinator. See the module docs.
pub struct Controller {
    config: ControllerConfig,
    backend: Backend,
    store: Box<dyn SelectionStore>,
    ui: Sender<UiEvent>,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    session: TestSession,
    selections: [Option<String>; 2],
    links: [Option<SerialLink>; 2],
    generation: u64,
    flash: Option<FlashOrchestrator>,
    flash_jobs: u64,
}

impl Controller {
    /// Create a controller with selections restored from `store`. No link is
    /// bound until [`Controller::restart_readers`] runs.
    pub fn new(
        config: ControllerConfig,
        backend: Backend,
        store: Box<dyn SelectionStore>,
        ui: Sender<UiEvent>,
    ) -> Self {
        let selections = Role::ALL.map(|role| store.get(selection_key(role)));
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            config,
            backend,
            store,
            ui,
            inbound_tx,
            inbound_rx,
            session: TestSession::new(),
            selections,
            links: [None, None],
            generation: 0,
            flash: None,
            flash_jobs: 0,
        }
    }

    /// Current session state.
    pub fn session(&self) -> &TestSession {
        &self.session
    }

    /// Controller settings.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Device selected for `role`.
    pub fn selection(&self, role: Role) -> Option<&str> {
        self.selections[role.index()].as_deref()
    }

    /// Running link of `role`.
    pub fn link(&self, role: Role) -> Option<&SerialLink> {
        self.links[role.index()].as_ref()
    }

    /// Whether a flash job is in flight.
    pub fn is_flashing(&self) -> bool {
        self.flash.is_some()
    }

    /// Set a selection without rebinding.
    pub fn set_selection(&mut self, role: Role, device: impl Into<String>) {
        self.selections[role.index()] = Some(device.into());
    }

    /// Select `device` for `role` and rebind both links.
    pub fn select_port(&mut self, role: Role, device: impl Into<String>) -> Result<()> {
        let device = device.into();
        info!("Selecting {device} for {role}");
        self.set_selection(role, device);
        self.restart_readers()
    }

    /// Stop both links and bind fresh ones to the current selections.
    ///
    /// Events from the previous links are dropped from now on. Both roles on
    /// one device raise a cross-wiring fault but both links are still bound.
    pub fn restart_readers(&mut self) -> Result<()> {
        for link in self.links.iter().flatten() {
            link.stop();
        }
        for link in self.links.iter_mut().flatten() {
            if !link.join(self.config.rebind_timeout) {
                warn!("{} link on {} still running after rebind", link.role(), link.device());
            }
        }
        self.links = [None, None];
        self.generation += 1;

        let mut out = Vec::new();
        self.session.reset_ready(&mut out);
        self.emit_all(out);

        for role in Role::ALL {
            let Some(device) = self.selections[role.index()].clone() else {
                debug!("No device selected for {role}");
                continue;
            };
            let tx = self.inbound_tx.clone();
            let config = LinkConfig::new(role, &device, self.config.baud_rate)
                .with_generation(self.generation)
                .with_timing(self.config.link_timing);
            let link = SerialLink::bind(config, Arc::clone(&self.backend.opener), move |event| {
                if tx.send(Inbound::Link(event)).is_err() {
                    trace!("Controller gone, dropping link event");
                }
            })?;
            self.links[role.index()] = Some(link);
            if let Err(e) = self.store.set(selection_key(role), &device) {
                warn!("Failed to remember {role} selection: {e}");
            }
        }

        let shared = match (self.selection(Role::Master), self.selection(Role::Target)) {
            (Some(master), Some(target)) if master == target => Some(master.to_string()),
            _ => None,
        };
        if let Some(device) = shared {
            let err = Error::CrossWiring { device };
            warn!("{err}");
            self.log_info(err.to_string());
            for role in Role::ALL {
                self.emit(UiEvent::Fault {
                    role,
                    kind: FaultKind::CrossWiring,
                });
            }
        }
        Ok(())
    }

    /// Start a test run on the Master.
    ///
    /// Resets the session first. A failed send raises a wrong-port fault on
    /// the Master and is returned.
    pub fn start_test(&mut self) -> Result<()> {
        let mut out = Vec::new();
        self.session.begin_run(&mut out);
        self.emit_all(out);

        let flash_run = self.session.last_action() == LastAction::FlashAndRun;
        if !flash_run {
            self.session.set_last_action(LastAction::Run);
        }
        self.emit(UiEvent::control(Control::Run, ControlState::Busy));
        if flash_run {
            self.emit(UiEvent::control(Control::FlashAndRun, ControlState::Busy));
        } else {
            self.emit(UiEvent::control(Control::Flash, ControlState::Idle));
            self.emit(UiEvent::control(Control::FlashAndRun, ControlState::Idle));
        }

        if let Err(e) = self.send(Role::Master, CMD_START) {
            warn!("Failed to send {CMD_START} to Master: {e}");
            self.log_info(format!("Run: failed to send {CMD_START}: {e}"));
            self.emit(UiEvent::Fault {
                role: Role::Master,
                kind: FaultKind::WrongPort,
            });
            self.emit(UiEvent::control(Control::Run, ControlState::Error));
            return Err(e);
        }
        Ok(())
    }

    /// Flash the Target and rebind it on its new port.
    pub fn start_flash(&mut self) -> Result<()> {
        self.reject_if_flashing()?;
        self.session.set_last_action(LastAction::Flash);
        self.session.set_await_target_ready(false);
        self.emit(UiEvent::control(Control::Flash, ControlState::Busy));
        self.emit(UiEvent::control(Control::Run, ControlState::Idle));
        self.emit(UiEvent::control(Control::FlashAndRun, ControlState::Idle));
        self.launch_flash()
    }

    /// Flash the Target, then start the test once the Target speaks again.
    pub fn start_flash_and_run(&mut self) -> Result<()> {
        self.reject_if_flashing()?;
        self.session.set_last_action(LastAction::FlashAndRun);
        self.session.set_await_target_ready(false);
        self.emit(UiEvent::control(Control::FlashAndRun, ControlState::Busy));
        self.emit(UiEvent::control(Control::Flash, ControlState::Busy));
        self.emit(UiEvent::control(Control::Run, ControlState::Idle));
        self.launch_flash()
    }

    /// Cancel the in-flight flash job. Returns whether one was running.
    pub fn cancel_flash(&mut self) -> bool {
        match &self.flash {
            Some(job) => {
                info!("Cancelling flash job {}", job.job());
                job.cancel();
                true
            },
            None => false,
        }
    }

    /// Handle pending worker messages.
    ///
    /// Blocks up to `timeout` for the first one, then drains whatever else is
    /// queued. Returns whether anything was handled.
    pub fn pump(&mut self, timeout: Duration) -> bool {
        let first = match self.inbound_rx.recv_timeout(timeout) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
        };
        self.dispatch(first);
        while let Ok(msg) = self.inbound_rx.try_recv() {
            self.dispatch(msg);
        }
        true
    }

    /// Stop every worker and wait for each up to the shutdown timeout.
    ///
    /// Returns the names of workers that did not exit.
    pub fn shutdown(&mut self) -> Vec<String> {
        let timeout = self.config.shutdown_timeout;
        let mut workers: Vec<&mut dyn Worker> = Vec::new();
        for link in self.links.iter_mut().flatten() {
            workers.push(link);
        }
        if let Some(flash) = self.flash.as_mut() {
            workers.push(flash);
        }
        let stragglers = shutdown_all(&mut workers, timeout);
        self.links = [None, None];
        self.flash = None;
        stragglers
    }

    /// Apply one received line.
    pub fn on_line(&mut self, role: Role, line: &str) {
        if let Err(e) = TestSession::check_provenance(role, line) {
            warn!("{e}");
            self.emit(UiEvent::Fault {
                role,
                kind: FaultKind::WrongPort,
            });
            return;
        }

        if role == Role::Target && self.session.take_await_target_ready() {
            self.log_info("Target ready after flash, starting test");
            if let Err(e) = self.start_test() {
                warn!("Auto-start after flash failed: {e}");
            }
        }

        let mut out = Vec::new();
        self.session.apply_line(role, line, &mut out);
        self.emit_all(out);
    }

    fn dispatch(&mut self, msg: Inbound) {
        match msg {
            Inbound::Link(event) => self.on_link_event(event),
            Inbound::Flash(event) => self.on_flash_event(event),
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        if event.generation() != self.generation {
            trace!(
                "Dropping {} event from stale generation {}",
                event.role(),
                event.generation()
            );
            return;
        }
        match event {
            LinkEvent::Line { role, text, .. } => self.on_line(role, &text),
            LinkEvent::Connected { role, device, .. } => {
                info!("{role} connected on {device}");
                self.emit(UiEvent::Link {
                    role,
                    device,
                    connected: true,
                });
            },
            LinkEvent::Disconnected { role, device, .. } => {
                self.emit(UiEvent::Link {
                    role,
                    device,
                    connected: false,
                });
            },
        }
    }

    fn on_flash_event(&mut self, event: FlashEvent) {
        if self.flash.as_ref().is_none_or(|job| job.job() != event.job()) {
            trace!("Dropping event from finished flash job {}", event.job());
            return;
        }
        match event {
            FlashEvent::Progress { message, .. } => self.log_info(message),
            FlashEvent::Done { outcome, .. } => {
                self.finish_flash();
                self.on_flash_done(outcome);
            },
            FlashEvent::Failed { message, .. } => {
                self.finish_flash();
                self.on_flash_failed(&message);
            },
        }
    }

    fn on_flash_done(&mut self, outcome: FlashOutcome) {
        let flash_run = self.session.last_action() == LastAction::FlashAndRun;
        self.emit(UiEvent::control(Control::Flash, ControlState::Success));
        if flash_run {
            self.emit(UiEvent::control(Control::FlashAndRun, ControlState::Busy));
        }

        match outcome.target_port {
            Some(port) => {
                self.log_info(format!("Flash: new Target port detected: {port}"));
                self.set_selection(Role::Target, port);
                if let Err(e) = self.restart_readers() {
                    warn!("Failed to rebind links after flash: {e}");
                    self.log_info(format!("Flash: failed to rebind links: {e}"));
                }
            },
            None => self.log_info("Flash: no new Target port detected, keeping previous selection"),
        }

        if flash_run {
            self.session.set_await_target_ready(true);
            self.log_info("Flash: waiting for Target to report before starting the test");
        }
    }

    fn on_flash_failed(&mut self, message: &str) {
        warn!("Flash failed: {message}");
        self.log_info(format!("Flash: error: {message}"));
        if self.session.last_action() == LastAction::FlashAndRun {
            self.emit(UiEvent::control(Control::FlashAndRun, ControlState::Error));
        }
        self.emit(UiEvent::control(Control::Flash, ControlState::Error));
        self.session.set_await_target_ready(false);
    }

    fn finish_flash(&mut self) {
        if let Some(mut job) = self.flash.take() {
            // The thread posts its final event as its last action.
            if !job.join(self.config.rebind_timeout) {
                warn!("Flash job {} did not exit", job.job());
            }
        }
    }

    fn reject_if_flashing(&mut self) -> Result<()> {
        if self.flash.is_some() {
            self.log_info("Flash: already in progress");
            return Err(Error::FlashBusy);
        }
        Ok(())
    }

    fn launch_flash(&mut self) -> Result<()> {
        let result = self.try_launch_flash();
        if let Err(e) = &result {
            self.on_flash_failed(&e.to_string());
        }
        result
    }

    fn try_launch_flash(&mut self) -> Result<()> {
        let firmware = self
            .config
            .firmware
            .clone()
            .ok_or_else(|| Error::Config("No firmware image configured".into()))?;
        if !firmware.is_file() {
            return Err(Error::FirmwareNotFound(firmware));
        }

        let snapshot = self.backend.enumerator.port_names();
        debug!("Ports before flash: {snapshot:?}");

        self.log_info(format!("Flash: sending {CMD_FLASH} to Master (DFU enter)"));
        if let Err(e) = self.send(Role::Master, CMD_FLASH) {
            warn!("Could not send {CMD_FLASH} to Master: {e}");
            self.log_info(format!("Flash: failed to send {CMD_FLASH}: {e}"));
            self.emit(UiEvent::Fault {
                role: Role::Master,
                kind: FaultKind::WrongPort,
            });
        }

        self.flash_jobs += 1;
        let job = self.flash_jobs;
        let request = FlashRequest::new(firmware, self.config.baud_rate, snapshot)
            .with_phase_timeout(self.config.phase_timeout)
            .with_poll_interval(self.config.poll_interval);
        let tx = self.inbound_tx.clone();
        let orchestrator = FlashOrchestrator::start(
            job,
            request,
            Arc::clone(&self.backend.enumerator),
            Arc::clone(&self.backend.tool),
            move |event| {
                if tx.send(Inbound::Flash(event)).is_err() {
                    trace!("Controller gone, dropping flash event");
                }
            },
        )?;
        self.flash = Some(orchestrator);
        Ok(())
    }

    /// Queue `command` on the role's running link, or write it once directly.
    fn send(&self, role: Role, command: &str) -> Result<()> {
        if self.links[role.index()]
            .as_ref()
            .is_some_and(|link| link.enqueue(command))
        {
            return Ok(());
        }
        let device = self.selection(role).ok_or(Error::NoPortSelected(role))?;
        send_line_once(
            self.backend.opener.as_ref(),
            &SerialConfig::new(device, self.config.baud_rate),
            command,
        )
    }

    fn log_info(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{text}");
        self.emit(UiEvent::info(text));
    }

    fn emit(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            trace!("Presentation channel closed");
        }
    }

    fn emit_all(&self, events: Vec<UiEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(job) = &self.flash {
            job.cancel();
        }
    }
}
