//! Terminal rendering of controller events.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use rigctl::{Control, ControlState, FaultKind, Role, SessionState, StageStatus, UiEvent};
use std::collections::BTreeSet;
use std::time::Duration;

/// Writes events to stderr; flash work shows a spinner.
pub struct Renderer {
    quiet: bool,
    fancy: bool,
    spinner: Option<ProgressBar>,
}

impl Renderer {
    /// Create a renderer. `fancy` enables the spinner.
    pub fn new(quiet: bool, fancy: bool) -> Self {
        Self {
            quiet,
            fancy,
            spinner: None,
        }
    }

    /// Print one line above the spinner, if any.
    fn line(&self, text: &str) {
        match &self.spinner {
            Some(pb) => pb.println(text),
            None => eprintln!("{text}"),
        }
    }

    fn start_spinner(&mut self, message: &str) {
        if !self.fancy || self.quiet || self.spinner.is_some() {
            return;
        }
        let pb = ProgressBar::new_spinner();
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed}] {msg}")
                .unwrap(),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message(message.to_string());
        self.spinner = Some(pb);
    }

    fn stop_spinner(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }

    /// Render one event.
    pub fn handle(&mut self, event: &UiEvent) {
        match event {
            UiEvent::Log { role, text } => self.log(*role, text),
            UiEvent::ClearLogs => {
                if !self.quiet {
                    self.line(&format!("{}", style("── new run ──").dim()));
                }
            },
            UiEvent::Stage { stage, status } => {
                if self.quiet {
                    return;
                }
                let status = match status {
                    StageStatus::NotStarted => return,
                    StageStatus::Begin => style("BEGIN").cyan(),
                    StageStatus::Ok => style("OK").green().bold(),
                    StageStatus::Error => style("ERROR").red().bold(),
                };
                self.line(&format!("{} {stage}: {status}", style("▸").blue()));
            },
            UiEvent::Ready { role, ready } => {
                debug!("{role} ready: {ready}");
                if *ready && !self.quiet {
                    self.line(&format!("{} {role} ready", style("✓").green()));
                }
            },
            UiEvent::Session {
                state,
                problem_pins,
            } => self.session(*state, problem_pins),
            UiEvent::Control { control, state } => self.control(*control, *state),
            UiEvent::Fault { role, kind } => {
                let text = match kind {
                    FaultKind::WrongPort => format!("{role}: wrong port (unexpected data or send failure)"),
                    FaultKind::CrossWiring => format!("{role}: Master and Target share one port"),
                };
                self.line(&format!("{} {text}", style("⚠").yellow().bold()));
            },
            UiEvent::Link {
                role,
                device,
                connected,
            } => {
                if self.quiet {
                    return;
                }
                if *connected {
                    self.line(&format!("{} {role} connected on {}", style("🔌").cyan(), style(device).cyan()));
                } else {
                    self.line(&format!("{} {role} lost {device}, reconnecting", style("…").yellow()));
                }
            },
        }
    }

    fn log(&mut self, role: Option<Role>, text: &str) {
        if let (Some(pb), None) = (&self.spinner, role) {
            pb.set_message(text.to_string());
        }
        if self.quiet {
            return;
        }
        let prefix = match role {
            Some(Role::Master) => style("[master]").cyan(),
            Some(Role::Target) => style("[target]").magenta(),
            None => style("[rig]").dim(),
        };
        self.line(&format!("{prefix} {text}"));
    }

    fn session(&self, state: SessionState, problem_pins: &BTreeSet<String>) {
        match state {
            SessionState::Success => {
                self.line(&format!("\n{} {}", style("🎉").green().bold(), style("Test passed").green().bold()));
            },
            SessionState::Failure => {
                self.line(&format!("\n{} {}", style("✗").red().bold(), style("Test failed").red().bold()));
                if !problem_pins.is_empty() {
                    self.line(&format!("  Problem pins: {}", format_pins(problem_pins)));
                }
            },
            SessionState::Testing if !problem_pins.is_empty() && !self.quiet => {
                self.line(&format!("  {} {}", style("pins:").yellow(), format_pins(problem_pins)));
            },
            SessionState::Idle | SessionState::Testing => {},
        }
    }

    fn control(&mut self, control: Control, state: ControlState) {
        debug!("Control {control} -> {state:?}");
        match (control, state) {
            (Control::Flash, ControlState::Busy) => self.start_spinner("Flashing Target"),
            (Control::Flash, ControlState::Success) => {
                self.stop_spinner();
                if !self.quiet {
                    eprintln!("{} Flash complete", style("✓").green());
                }
            },
            (Control::Flash, ControlState::Error) => {
                self.stop_spinner();
                eprintln!("{} Flash failed", style("✗").red().bold());
            },
            _ => {},
        }
    }

    /// Clear any spinner.
    pub fn finish(&mut self) {
        self.stop_spinner();
    }
}

/// Pins as a comma-separated list.
pub fn format_pins(pins: &BTreeSet<String>) -> String {
    pins.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pins_sorted() {
        let pins: BTreeSet<String> = ["P1_07", "P0_06"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(format_pins(&pins), "P0_06, P1_07");
    }

    #[test]
    fn test_plain_renderer_never_spins() {
        let mut renderer = Renderer::new(false, false);
        renderer.handle(&UiEvent::control(Control::Flash, ControlState::Busy));
        assert!(renderer.spinner.is_none());
        renderer.handle(&UiEvent::info("Flash: waiting for DFU port"));
        renderer.finish();
    }
}
