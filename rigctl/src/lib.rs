//! # rigctl
//!
//! Controller library for a two-board pin test rig.
//!
//! A Master board drives a three-stage pin test (ALL_HIGH, ALL_LOW, SEQUENCE)
//! against a Target board and reports over a line-based serial protocol. This
//! crate provides:
//!
//! - Serial links with reconnect and an outbound command queue
//! - The protocol state machine turning lines into session state
//! - Flash orchestration with hot-plug port rediscovery
//! - A controller tying these together behind one event channel
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! use rigctl::{Backend, Controller, ControllerConfig, MemoryStore, Role, UiEvent};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, rx) = mpsc::channel();
//!     let mut controller = Controller::new(
//!         ControllerConfig::default(),
//!         Backend::native(),
//!         Box::new(MemoryStore::new()),
//!         tx,
//!     );
//!     controller.set_selection(Role::Master, "/dev/ttyACM0");
//!     controller.set_selection(Role::Target, "/dev/ttyACM1");
//!     controller.restart_readers()?;
//!     controller.start_test()?;
//!
//!     while !controller.session().state().is_terminal() {
//!         controller.pump(Duration::from_millis(100));
//!         for event in rx.try_iter() {
//!             if let UiEvent::Log { text, .. } = event {
//!                 println!("{text}");
//!             }
//!         }
//!     }
//!     controller.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod controller;
pub mod device;
pub mod error;
pub mod event;
pub mod flash;
pub mod link;
pub mod port;
pub mod protocol;
pub mod store;
pub mod worker;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Link loops and
/// flash jobs poll it alongside their own stop flags.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator, NativePortOpener};
pub use {
    controller::{Backend, CMD_FLASH, CMD_START, Controller, ControllerConfig},
    device::{DetectedPort, DeviceKind, detect_ports, device_from_label},
    error::{Error, Result},
    event::{Control, ControlState, FaultKind, UiEvent},
    flash::{
        CancelToken, FirmwareTool, FlashEvent, FlashJob, FlashOrchestrator, FlashOutcome, FlashPhase,
        FlashRequest, Nrfutil, wait_for_new_port,
    },
    link::{LinkConfig, LinkEvent, LinkTiming, SerialLink},
    port::{Port, PortEnumerator, PortInfo, PortOpener, SerialConfig, send_line_once},
    protocol::{LastAction, Role, SessionState, Stage, StageStatus, TestSession, extract_pins},
    store::{MemoryStore, SelectionStore, selection_key},
    worker::Worker,
};
