//! Task event kinds and their human-readable projection.

use std::time::Duration;

use crate::types::TaskEvent;

pub const TASK_SETUP_FAILURE: &str = "Setup Failure";
pub const TASK_DRIVER_FAILURE: &str = "Driver Failure";
pub const TASK_RECEIVED: &str = "Received";
pub const TASK_FAILED_VALIDATION: &str = "Failed Validation";
pub const TASK_STARTED: &str = "Started";
pub const TASK_TERMINATED: &str = "Terminated";
pub const TASK_KILLING: &str = "Killing";
pub const TASK_KILLED: &str = "Killed";
pub const TASK_RESTARTING: &str = "Restarting";
pub const TASK_NOT_RESTARTING: &str = "Not Restarting";
pub const TASK_SIGNALING: &str = "Signaling";
pub const TASK_RESTART_SIGNAL: &str = "Restart Signaled";
pub const TASK_GC: &str = "Garbage Collected";

impl TaskEvent {
    /// Create an event of the given kind with no structured detail.
    pub fn new(kind: &str, time: i64) -> Self {
        Self {
            kind: kind.to_string(),
            time,
            ..Default::default()
        }
    }

    /// Rebuild `display_message` from the structured fields.
    ///
    /// Always recomputed; a stale projection is overwritten.
    pub fn populate_display_message(&mut self) {
        self.display_message = self.render_display_message();
    }

    fn render_display_message(&self) -> String {
        let fallback = |detail: &str| {
            if detail.is_empty() {
                self.message.clone()
            } else {
                detail.to_string()
            }
        };

        match self.kind.as_str() {
            TASK_SETUP_FAILURE => fallback(&self.setup_error),
            TASK_DRIVER_FAILURE => fallback(&self.driver_error),
            TASK_RECEIVED => "Task received by client".to_string(),
            TASK_STARTED => "Task started by client".to_string(),
            TASK_FAILED_VALIDATION => fallback("Task failed validation"),
            TASK_TERMINATED => {
                let mut msg = format!("Exit Code: {}", self.exit_code);
                if self.signal != 0 {
                    msg.push_str(&format!(", Signal: {}", self.signal));
                }
                if !self.message.is_empty() {
                    msg.push_str(&format!(", Exit Message: {:?}", self.message));
                }
                msg
            }
            TASK_KILLING => {
                if !self.kill_reason.is_empty() {
                    self.kill_reason.clone()
                } else if self.kill_timeout_ms > 0 {
                    format!(
                        "Sent interrupt. Waiting {:?} before force killing",
                        Duration::from_millis(self.kill_timeout_ms)
                    )
                } else {
                    "Sent interrupt".to_string()
                }
            }
            TASK_KILLED => {
                if self.kill_error.is_empty() {
                    "Task successfully killed".to_string()
                } else {
                    self.kill_error.clone()
                }
            }
            TASK_RESTARTING => {
                let delay = Duration::from_millis(self.start_delay_ms);
                if self.restart_reason.is_empty() {
                    format!("Task restarting in {delay:?}")
                } else {
                    format!("{} - Task restarting in {delay:?}", self.restart_reason)
                }
            }
            TASK_NOT_RESTARTING => fallback(&self.restart_reason),
            TASK_SIGNALING => match (self.task_signal.is_empty(), self.task_signal_reason.is_empty()) {
                (true, true) => "Task being sent a signal".to_string(),
                (false, true) => format!("Task being sent signal {}", self.task_signal),
                (true, false) => format!("Task being sent signal: {}", self.task_signal_reason),
                (false, false) => format!(
                    "Task being sent signal {}: {}",
                    self.task_signal, self.task_signal_reason
                ),
            },
            TASK_RESTART_SIGNAL => {
                if self.restart_reason.is_empty() {
                    "Task signaled to restart".to_string()
                } else {
                    self.restart_reason.clone()
                }
            }
            _ => self.message.clone(),
        }
    }
}
