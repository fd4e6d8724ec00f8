//! Line protocol state machine.
//!
//! Both boards print newline-terminated text lines prefixed with their role tag:
//!
//! ```text
//! Master: STAGE — IDLE: OK
//! Master: START
//! Master: STAGE — ALL_HIGH: BEGIN
//! Master: STAGE — ALL_HIGH: ERROR. LOW_PINS: P0.06, P1_07
//! Master: STAGE — SEQUENCE: ALL OK
//! Master: STAGE — SUCCESS: OK
//! Target: READY
//! ```
//!
//! Lines are classified by case-insensitive substring match on the uppercased
//! text, checked in the fixed order `START`, `ALL_HIGH`, `ALL_LOW`, `SEQUENCE`,
//! `SUCCESS`, then `FAIL`/`ERROR`. The first match wins. Only Master lines move
//! the session; Target lines only mark readiness and feed the log.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use log::{debug, trace, warn};
use regex::Regex;

use crate::error::{Error, Result};
use crate::event::{Control, ControlState, UiEvent};

/// Identity a serial link is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// The board that drives the test sequence and reports results.
    Master,
    /// The board under test.
    Target,
}

impl Role {
    /// Both roles.
    pub const ALL: [Self; 2] = [Self::Master, Self::Target];

    /// Literal tag every line from this role starts with.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Master => "Master",
            Self::Target => "Target",
        }
    }

    /// Lowercase name used in logs and storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Target => "target",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Master => 0,
            Self::Target => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three phases of the on-device test sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Every test pin driven high.
    AllHigh,
    /// Every test pin driven low.
    AllLow,
    /// Pins raised one at a time in order.
    Sequence,
}

impl Stage {
    /// Stages in match-precedence order.
    pub const ALL: [Self; 3] = [Self::AllHigh, Self::AllLow, Self::Sequence];

    /// Keyword that selects this stage.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::AllHigh => "ALL_HIGH",
            Self::AllLow => "ALL_LOW",
            Self::Sequence => "SEQUENCE",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::AllHigh => 0,
            Self::AllLow => 1,
            Self::Sequence => 2,
        }
    }

    /// Whether the uppercased line reports this stage as passed.
    ///
    /// SEQUENCE prints a per-pin `OK — P0_06` while running, so only the
    /// summary line (`ALL OK`) counts for it.
    fn reports_ok(self, upper: &str) -> bool {
        match self {
            Self::Sequence => {
                upper.contains("ALL OK") || (upper.contains("OK") && upper.contains("ALL"))
            },
            _ => upper.contains("OK"),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StageStatus {
    /// Not reported yet in this session.
    #[default]
    NotStarted,
    /// Stage running.
    Begin,
    /// Stage passed.
    Ok,
    /// Stage failed.
    Error,
}

/// Overall state of the test session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Nothing run yet.
    #[default]
    Idle,
    /// A run is in progress.
    Testing,
    /// Master reported success.
    Success,
    /// Master reported a failure.
    Failure,
}

impl SessionState {
    /// SUCCESS and FAILURE hold until the next run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// The operation the operator started last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LastAction {
    /// Nothing, or the last run completed successfully.
    #[default]
    None,
    /// Standalone test run.
    Run,
    /// Standalone flash.
    Flash,
    /// Flash followed by an automatic test run.
    FlashAndRun,
}

impl LastAction {
    /// Whether the operator asked for a test run, so test results drive controls.
    pub fn is_run(self) -> bool {
        matches!(self, Self::Run | Self::FlashAndRun)
    }
}

// Static pattern, cannot fail to compile.
static PIN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"P([01])[._]([0-9]{2})").unwrap());

/// Extract canonical pin identifiers (`P0_06`) from a line.
///
/// Accepts `P0.06` and `P0_06` spellings; anything trailing (e.g. `P1_07(VCC)`)
/// is ignored.
pub fn extract_pins(line: &str) -> BTreeSet<String> {
    PIN_PATTERN
        .captures_iter(line)
        .map(|caps| format!("P{}_{}", &caps[1], &caps[2]))
        .collect()
}

/// State of one test session, owned by the controller.
#[derive(Debug, Clone, Default)]
pub struct TestSession {
    state: SessionState,
    stages: [StageStatus; 3],
    problem_pins: BTreeSet<String>,
    last_action: LastAction,
    await_target_ready: bool,
    idle_seen: [bool; 2],
    ready: [bool; 2],
}

impl TestSession {
    /// A fresh, idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overall state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Status of one stage.
    pub fn stage(&self, stage: Stage) -> StageStatus {
        self.stages[stage.index()]
    }

    /// Pins implicated in stage errors since the run started.
    pub fn problem_pins(&self) -> &BTreeSet<String> {
        &self.problem_pins
    }

    /// The operation started last.
    pub fn last_action(&self) -> LastAction {
        self.last_action
    }

    /// Record the operation the operator started.
    pub fn set_last_action(&mut self, action: LastAction) {
        self.last_action = action;
    }

    /// Whether a role produced a well-formed line since its link was bound.
    pub fn is_ready(&self, role: Role) -> bool {
        self.ready[role.index()]
    }

    /// Whether the next Target line should start the test.
    pub fn is_awaiting_target_ready(&self) -> bool {
        self.await_target_ready
    }

    /// Arm or disarm the start-on-Target-line trigger.
    pub fn set_await_target_ready(&mut self, armed: bool) {
        self.await_target_ready = armed;
    }

    /// Consume the trigger. Returns whether it was armed.
    pub fn take_await_target_ready(&mut self) -> bool {
        std::mem::take(&mut self.await_target_ready)
    }

    /// Check that a line carries the tag of the role whose link delivered it.
    pub fn check_provenance(role: Role, line: &str) -> Result<()> {
        if line.starts_with(role.tag()) {
            Ok(())
        } else {
            Err(Error::ProtocolViolation {
                role,
                line: line.to_string(),
            })
        }
    }

    /// Start (or restart) a run: clear pins and stages, enter TESTING, clear logs.
    pub fn begin_run(&mut self, out: &mut Vec<UiEvent>) {
        self.problem_pins.clear();
        self.stages = [StageStatus::NotStarted; 3];
        self.state = SessionState::Testing;
        out.push(UiEvent::ClearLogs);
        for stage in Stage::ALL {
            out.push(UiEvent::Stage {
                stage,
                status: StageStatus::NotStarted,
            });
        }
        self.push_session(out);
    }

    /// Mark both roles not ready, e.g. after links were rebound.
    pub fn reset_ready(&mut self, out: &mut Vec<UiEvent>) {
        for role in Role::ALL {
            if std::mem::take(&mut self.ready[role.index()]) {
                out.push(UiEvent::Ready { role, ready: false });
            }
            self.idle_seen[role.index()] = false;
        }
    }

    /// Apply a line that already passed [`TestSession::check_provenance`].
    pub fn apply_line(&mut self, role: Role, line: &str, out: &mut Vec<UiEvent>) {
        let upper = line.to_uppercase();

        if !std::mem::replace(&mut self.ready[role.index()], true) {
            out.push(UiEvent::Ready { role, ready: true });
        }
        self.log_line(role, line, &upper, out);

        if role == Role::Master {
            self.apply_master(line, &upper, out);
        }
    }

    fn log_line(&mut self, role: Role, line: &str, upper: &str, out: &mut Vec<UiEvent>) {
        let is_idle_ok = upper.contains("STAGE") && upper.contains("IDLE: OK");
        let seen = &mut self.idle_seen[role.index()];
        if is_idle_ok && *seen {
            trace!("Suppressed repeated idle line from {role}");
            return;
        }
        *seen = is_idle_ok;
        out.push(UiEvent::Log {
            role: Some(role),
            text: line.to_string(),
        });
    }

    fn apply_master(&mut self, line: &str, upper: &str, out: &mut Vec<UiEvent>) {
        if upper.contains("START") {
            if self.last_action.is_run() {
                debug!("Master reported START, run begins");
                self.begin_run(out);
            } else {
                debug!("Ignoring START not initiated by the operator");
            }
            return;
        }

        if let Some(stage) = Stage::ALL
            .into_iter()
            .find(|stage| upper.contains(stage.keyword()))
        {
            self.apply_stage(stage, line, upper, out);
            return;
        }

        if upper.contains("SUCCESS") {
            self.state = SessionState::Success;
            self.push_session(out);
            for control in Control::ALL {
                out.push(UiEvent::control(control, ControlState::Idle));
            }
            self.last_action = LastAction::None;
            return;
        }

        if upper.contains("FAIL") || upper.contains("ERROR") {
            self.state = SessionState::Failure;
            self.push_session(out);
            self.mark_run_error(out);
        }
    }

    fn apply_stage(&mut self, stage: Stage, line: &str, upper: &str, out: &mut Vec<UiEvent>) {
        let status = if upper.contains("BEGIN") {
            StageStatus::Begin
        } else if stage.reports_ok(upper) {
            StageStatus::Ok
        } else if upper.contains("ERROR") {
            StageStatus::Error
        } else {
            return;
        };

        self.stages[stage.index()] = status;
        out.push(UiEvent::Stage { stage, status });

        if status == StageStatus::Error {
            let pins = extract_pins(line);
            warn!("Stage {stage} error, pins: {pins:?}");
            self.problem_pins.extend(pins);
            self.push_session(out);
            self.mark_run_error(out);
        }
    }

    fn mark_run_error(&self, out: &mut Vec<UiEvent>) {
        match self.last_action {
            LastAction::Run => out.push(UiEvent::control(Control::Run, ControlState::Error)),
            LastAction::FlashAndRun => {
                out.push(UiEvent::control(Control::Run, ControlState::Error));
                out.push(UiEvent::control(Control::FlashAndRun, ControlState::Error));
            },
            LastAction::None | LastAction::Flash => {},
        }
    }

    fn push_session(&self, out: &mut Vec<UiEvent>) {
        out.push(UiEvent::Session {
            state: self.state,
            problem_pins: self.problem_pins.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(session: &mut TestSession, role: Role, line: &str) -> Vec<UiEvent> {
        let mut out = Vec::new();
        if TestSession::check_provenance(role, line).is_ok() {
            session.apply_line(role, line, &mut out);
        }
        out
    }

    fn logs(events: &[UiEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, UiEvent::Log { .. }))
            .count()
    }

    fn running_session() -> TestSession {
        let mut session = TestSession::new();
        session.set_last_action(LastAction::Run);
        session.begin_run(&mut Vec::new());
        session
    }

    #[test]
    fn test_extract_pins_both_separators() {
        let pins = extract_pins("ERROR. LOW_PINS: P0.06, P1_07(VCC)");
        let expected: BTreeSet<String> = ["P0_06", "P1_07"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(pins, expected);
        assert_eq!(extract_pins("ERROR. LOW_PINS: P0.06, P1_07(VCC)"), pins);
    }

    #[test]
    fn test_extract_pins_rejects_other_ports_and_short_numbers() {
        assert!(extract_pins("P2_06 P0_6 p0_06 P0-06").is_empty());
        assert_eq!(extract_pins("P0_061").len(), 1);
    }

    #[test]
    fn test_provenance_is_case_sensitive() {
        assert!(TestSession::check_provenance(Role::Master, "Master: READY").is_ok());
        assert!(TestSession::check_provenance(Role::Master, "MASTER: READY").is_err());
        assert!(TestSession::check_provenance(Role::Target, "Master: READY").is_err());
    }

    #[test]
    fn test_all_high_begin_then_ok() {
        let mut session = running_session();
        feed(&mut session, Role::Master, "Master ALL_HIGH BEGIN");
        assert_eq!(session.stage(Stage::AllHigh), StageStatus::Begin);
        feed(&mut session, Role::Master, "Master ALL_HIGH OK");
        assert_eq!(session.stage(Stage::AllHigh), StageStatus::Ok);
        assert!(session.problem_pins().is_empty());
        assert_eq!(session.state(), SessionState::Testing);
    }

    #[test]
    fn test_sequence_error_adds_pin() {
        let mut session = running_session();
        let out = feed(&mut session, Role::Master, "Master SEQUENCE ERROR P0.17");
        assert_eq!(session.stage(Stage::Sequence), StageStatus::Error);
        assert!(session.problem_pins().contains("P0_17"));
        assert!(out.contains(&UiEvent::control(Control::Run, ControlState::Error)));
    }

    #[test]
    fn test_sequence_per_pin_ok_is_not_stage_ok() {
        let mut session = running_session();
        feed(&mut session, Role::Master, "Master: STAGE — SEQUENCE: BEGIN");
        feed(&mut session, Role::Master, "Master: STAGE — SEQUENCE: OK — P0_06");
        assert_eq!(session.stage(Stage::Sequence), StageStatus::Begin);
        feed(&mut session, Role::Master, "Master: STAGE — SEQUENCE: ALL OK");
        assert_eq!(session.stage(Stage::Sequence), StageStatus::Ok);
    }

    #[test]
    fn test_flash_and_run_error_marks_both_controls() {
        let mut session = TestSession::new();
        session.set_last_action(LastAction::FlashAndRun);
        let out = feed(&mut session, Role::Master, "Master: STAGE — ALL_LOW: ERROR. HIGH_PINS: P0_02");
        assert!(out.contains(&UiEvent::control(Control::Run, ControlState::Error)));
        assert!(out.contains(&UiEvent::control(Control::FlashAndRun, ControlState::Error)));
    }

    #[test]
    fn test_error_after_standalone_flash_leaves_controls() {
        let mut session = TestSession::new();
        session.set_last_action(LastAction::Flash);
        let out = feed(&mut session, Role::Master, "Master: STAGE — ALL_LOW: ERROR. HIGH_PINS: P0_02");
        assert!(!out.iter().any(|e| matches!(e, UiEvent::Control { .. })));
        assert_eq!(session.stage(Stage::AllLow), StageStatus::Error);
    }

    #[test]
    fn test_wrong_tag_leaves_session_unchanged() {
        let mut session = running_session();
        feed(&mut session, Role::Master, "Master: STAGE — ALL_HIGH: ERROR. LOW_PINS: P0_03");
        let before_pins = session.problem_pins().clone();
        let out = feed(&mut session, Role::Target, "Master: STAGE — ALL_LOW: ERROR. HIGH_PINS: P0_04");
        assert!(out.is_empty());
        assert_eq!(session.problem_pins(), &before_pins);
        assert_eq!(session.stage(Stage::AllLow), StageStatus::NotStarted);
        assert!(!session.is_ready(Role::Target));
    }

    #[test]
    fn test_target_lines_do_not_move_session() {
        let mut session = running_session();
        let out = feed(&mut session, Role::Target, "Target: STAGE — ALL_HIGH: OK");
        assert_eq!(session.stage(Stage::AllHigh), StageStatus::NotStarted);
        assert!(session.is_ready(Role::Target));
        assert!(out.contains(&UiEvent::Ready {
            role: Role::Target,
            ready: true
        }));
    }

    #[test]
    fn test_idle_line_suppressed_until_other_line() {
        let mut session = TestSession::new();
        let idle = "Target: STAGE — IDLE: OK";
        let mut total = 0;
        for _ in 0..5 {
            total += logs(&feed(&mut session, Role::Target, idle));
        }
        assert_eq!(total, 1);

        assert_eq!(logs(&feed(&mut session, Role::Target, "Target: READY")), 1);
        assert_eq!(logs(&feed(&mut session, Role::Target, idle)), 1);
        assert_eq!(logs(&feed(&mut session, Role::Target, idle)), 0);
    }

    #[test]
    fn test_idle_suppression_is_per_role() {
        let mut session = TestSession::new();
        assert_eq!(logs(&feed(&mut session, Role::Master, "Master: STAGE — IDLE: OK")), 1);
        assert_eq!(logs(&feed(&mut session, Role::Target, "Target: STAGE — IDLE: OK")), 1);
    }

    #[test]
    fn test_start_ignored_without_run_request() {
        let mut session = TestSession::new();
        let out = feed(&mut session, Role::Master, "Master: START");
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!out.contains(&UiEvent::ClearLogs));
    }

    #[test]
    fn test_start_clears_pins_when_run_requested() {
        let mut session = running_session();
        feed(&mut session, Role::Master, "Master: STAGE — ALL_HIGH: ERROR. LOW_PINS: P0_03");
        feed(&mut session, Role::Master, "Master: START");
        assert!(session.problem_pins().is_empty());
        assert_eq!(session.stage(Stage::AllHigh), StageStatus::NotStarted);
        assert_eq!(session.state(), SessionState::Testing);
    }

    #[test]
    fn test_success_clears_last_action() {
        let mut session = running_session();
        let out = feed(&mut session, Role::Master, "Master: STAGE — SUCCESS: OK");
        assert_eq!(session.state(), SessionState::Success);
        assert_eq!(session.last_action(), LastAction::None);
        assert!(out.contains(&UiEvent::control(Control::Flash, ControlState::Idle)));
    }

    #[test]
    fn test_bare_fail_is_failure() {
        let mut session = running_session();
        feed(&mut session, Role::Master, "Master: FAIL");
        assert_eq!(session.state(), SessionState::Failure);
    }

    #[test]
    fn test_precedence_start_over_error() {
        let mut session = TestSession::new();
        feed(&mut session, Role::Master, "Master: START ERROR");
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_precedence_stage_over_generic_error() {
        let mut session = running_session();
        feed(&mut session, Role::Master, "Master: STAGE — ALL_HIGH: ERROR. LOW_PINS: P0_05");
        assert_eq!(session.state(), SessionState::Testing);
        assert_eq!(session.stage(Stage::AllHigh), StageStatus::Error);
    }

    #[test]
    fn test_begin_run_resets_from_any_state() {
        let mut session = running_session();
        feed(&mut session, Role::Master, "Master: STAGE — SEQUENCE: ERROR. FAIL_PINS: P1_02");
        feed(&mut session, Role::Master, "Master: FAIL");
        let mut out = Vec::new();
        session.begin_run(&mut out);
        assert_eq!(session.state(), SessionState::Testing);
        assert!(session.problem_pins().is_empty());
        assert_eq!(out.first(), Some(&UiEvent::ClearLogs));
    }

    #[test]
    fn test_take_await_target_ready() {
        let mut session = TestSession::new();
        assert!(!session.take_await_target_ready());
        session.set_await_target_ready(true);
        assert!(session.take_await_target_ready());
        assert!(!session.is_awaiting_target_ready());
    }
}
