//! Per-role serial link: one thread that owns the connection, reads lines and
//! drains the outbound queue.
//!
//! The loop never gives up on a device. Open failures are retried after
//! [`LinkTiming::open_retry`], read or write failures close the handle and
//! reopen after [`LinkTiming::io_backoff`]. Only [`SerialLink::stop`] (or a
//! registered interrupt) ends it.

mod lines;
mod queue;

pub use lines::{LineAssembler, MAX_LINE_LEN};
pub use queue::OutboundQueue;

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{Level, debug, log, trace};

use crate::error::{Error, Result};
use crate::port::{Port, PortOpener, SerialConfig, terminate_line};
use crate::protocol::Role;
use crate::worker::{Worker, join_within};

/// Timing knobs of the link loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Read timeout per loop iteration.
    pub read_timeout: Duration,
    /// Delay before retrying a failed open.
    pub open_retry: Duration,
    /// Delay after a read/write failure before reopening.
    pub io_backoff: Duration,
    /// Sleep after an idle iteration.
    pub idle_sleep: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            open_retry: Duration::from_millis(500),
            io_backoff: Duration::from_millis(300),
            idle_sleep: Duration::from_millis(10),
        }
    }
}

impl LinkTiming {
    /// Millisecond-scale timing for tests and simulations.
    pub fn fast() -> Self {
        Self {
            read_timeout: Duration::from_millis(5),
            open_retry: Duration::from_millis(5),
            io_backoff: Duration::from_millis(5),
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Notification from a link thread.
///
/// `generation` identifies the binding that produced the event. A controller
/// that rebinds a role bumps the generation and drops events from older ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete, trimmed, non-empty line.
    Line {
        /// Role of the link.
        role: Role,
        /// Binding generation.
        generation: u64,
        /// Line text.
        text: String,
    },
    /// The device was opened.
    Connected {
        /// Role of the link.
        role: Role,
        /// Binding generation.
        generation: u64,
        /// Device identifier.
        device: String,
    },
    /// The open device failed and was closed.
    Disconnected {
        /// Role of the link.
        role: Role,
        /// Binding generation.
        generation: u64,
        /// Device identifier.
        device: String,
    },
}

impl LinkEvent {
    /// Role of the emitting link.
    pub fn role(&self) -> Role {
        match self {
            Self::Line { role, .. } | Self::Connected { role, .. } | Self::Disconnected { role, .. } => *role,
        }
    }

    /// Generation of the emitting link.
    pub fn generation(&self) -> u64 {
        match self {
            Self::Line { generation, .. }
            | Self::Connected { generation, .. }
            | Self::Disconnected { generation, .. } => *generation,
        }
    }
}

/// Binding parameters of a link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Role the link serves.
    pub role: Role,
    /// Binding generation stamped on every event.
    pub generation: u64,
    /// Device identifier.
    pub device: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Loop timing.
    pub timing: LinkTiming,
}

impl LinkConfig {
    /// Default timing, generation 0.
    pub fn new(role: Role, device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            role,
            generation: 0,
            device: device.into(),
            baud_rate,
            timing: LinkTiming::default(),
        }
    }

    /// Set the binding generation.
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Override loop timing.
    #[must_use]
    pub fn with_timing(mut self, timing: LinkTiming) -> Self {
        self.timing = timing;
        self
    }

    fn serial_config(&self) -> SerialConfig {
        SerialConfig::new(&self.device, self.baud_rate).with_timeout(self.timing.read_timeout)
    }
}

/// Handle to a running link thread.
///
/// Dropping the handle stops the loop without waiting for it.
pub struct SerialLink {
    config: LinkConfig,
    queue: Arc<OutboundQueue>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Bind `config.device` and start the loop.
    ///
    /// `on_event` runs on the link thread, once per event, in order.
    pub fn bind<F>(config: LinkConfig, opener: Arc<dyn PortOpener>, on_event: F) -> Result<Self>
    where
        F: FnMut(LinkEvent) + Send + 'static,
    {
        let queue = Arc::new(OutboundQueue::new());
        let stop = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(false));

        let worker = LinkLoop {
            config: config.clone(),
            serial: config.serial_config(),
            opener,
            queue: Arc::clone(&queue),
            stop: Arc::clone(&stop),
            connected: Arc::clone(&connected),
            on_event: Box::new(on_event),
            port: None,
            lines: LineAssembler::new(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("rigctl-{}-link", config.role))
            .spawn(move || worker.run())?;

        debug!(
            "Bound {} link to {} @ {} (generation {})",
            config.role, config.device, config.baud_rate, config.generation
        );

        Ok(Self {
            config,
            queue,
            stop,
            connected,
            handle: Some(handle),
        })
    }

    /// Role served by this link.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Device identifier.
    pub fn device(&self) -> &str {
        &self.config.device
    }

    /// Binding generation.
    pub fn generation(&self) -> u64 {
        self.config.generation
    }

    /// Queue a command for sending. Returns `false` once the link is stopped.
    pub fn enqueue(&self, command: impl Into<String>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.queue.push(command);
        true
    }

    /// Request the loop to exit. Idempotent.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::Relaxed) {
            debug!("Stopping {} link on {}", self.config.role, self.config.device);
        }
    }

    /// Whether the loop is still accepting work.
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed) && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Wait up to `timeout` for the loop thread to exit.
    pub fn join(&mut self, timeout: Duration) -> bool {
        join_within(&mut self.handle, timeout)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Worker for SerialLink {
    fn name(&self) -> String {
        format!("{} link ({})", self.config.role, self.config.device)
    }

    fn stop(&self) {
        SerialLink::stop(self);
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn join(&mut self, timeout: Duration) -> bool {
        SerialLink::join(self, timeout)
    }
}

/// State owned by the link thread.
struct LinkLoop {
    config: LinkConfig,
    serial: SerialConfig,
    opener: Arc<dyn PortOpener>,
    queue: Arc<OutboundQueue>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    on_event: Box<dyn FnMut(LinkEvent) + Send>,
    port: Option<Box<dyn Port>>,
    lines: LineAssembler,
}

impl LinkLoop {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || crate::is_interrupted_requested()
    }

    fn run(mut self) {
        let mut buf = [0u8; 1024];
        while !self.should_stop() {
            let Some(port) = self.port.as_mut() else {
                self.try_open();
                continue;
            };

            match port.read(&mut buf) {
                Ok(0) => {},
                Ok(n) => {
                    for text in self.lines.push(&buf[..n]) {
                        trace!("{} <- {text}", self.config.role);
                        self.emit(LinkEvent::Line {
                            role: self.config.role,
                            generation: self.config.generation,
                            text,
                        });
                    }
                },
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    if self.drain() {
                        self.pause(self.config.timing.idle_sleep);
                    }
                    continue;
                },
                Err(e) => {
                    self.disconnect(&Error::Io(e));
                    continue;
                },
            }

            self.drain();
        }

        if self.port.take().is_some() {
            self.connected.store(false, Ordering::Relaxed);
        }
        debug!("{} link on {} exited", self.config.role, self.config.device);
    }

    fn try_open(&mut self) {
        match self.opener.open(&self.serial) {
            Ok(port) => {
                debug!("{} link connected to {}", self.config.role, self.config.device);
                self.port = Some(port);
                self.lines.reset();
                self.connected.store(true, Ordering::Relaxed);
                self.emit(LinkEvent::Connected {
                    role: self.config.role,
                    generation: self.config.generation,
                    device: self.config.device.clone(),
                });
            },
            Err(e) => {
                trace!("{} link open failed: {e}", self.config.role);
                self.pause(self.config.timing.open_retry);
            },
        }
    }

    /// Write every queued command. Returns `false` when a write failed and the
    /// connection was dropped.
    fn drain(&mut self) -> bool {
        while let Some(command) = self.queue.pop() {
            let Some(port) = self.port.as_mut() else {
                self.queue.requeue(command);
                return false;
            };
            match port.write_all_bytes(terminate_line(&command).as_bytes()) {
                Ok(()) => debug!("{} -> {}", self.config.role, command.trim_end()),
                Err(e) => {
                    self.queue.requeue(command);
                    self.disconnect(&e);
                    return false;
                },
            }
        }
        true
    }

    fn disconnect(&mut self, cause: &Error) {
        log!(
            disconnect_level(cause),
            "{} link on {} lost: {cause}",
            self.config.role,
            self.config.device
        );
        self.port = None;
        self.lines.reset();
        self.connected.store(false, Ordering::Relaxed);
        self.emit(LinkEvent::Disconnected {
            role: self.config.role,
            generation: self.config.generation,
            device: self.config.device.clone(),
        });
        self.pause(self.config.timing.io_backoff);
    }

    fn emit(&mut self, event: LinkEvent) {
        (self.on_event)(event);
    }

    /// Sleep in small slices so stop requests are observed promptly.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_stop() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

/// Unplugged or flaky devices reconnect quietly; anything else is a warning.
fn disconnect_level(cause: &Error) -> Level {
    if cause.is_transient() { Level::Info } else { Level::Warn }
}
