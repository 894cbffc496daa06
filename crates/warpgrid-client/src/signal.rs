//! Signals a task may be sent.

use crate::error::{ClientError, ClientResult};

/// Signal used when a request names none.
pub const DEFAULT_SIGNAL: &str = "SIGKILL";

const SIGNALS: &[(&str, i32)] = &[
    ("SIGHUP", 1),
    ("SIGINT", 2),
    ("SIGQUIT", 3),
    ("SIGKILL", 9),
    ("SIGUSR1", 10),
    ("SIGUSR2", 12),
    ("SIGTERM", 15),
];

/// Normalize a signal name and return it with its number.
///
/// Accepts any case and an optional `SIG` prefix; empty means
/// [`DEFAULT_SIGNAL`].
pub fn parse_signal(name: &str) -> ClientResult<(&'static str, i32)> {
    let trimmed = name.trim();
    let wanted = if trimmed.is_empty() {
        DEFAULT_SIGNAL.to_string()
    } else {
        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        }
    };

    SIGNALS
        .iter()
        .find(|(known, _)| *known == wanted)
        .copied()
        .ok_or_else(|| ClientError::InvalidSignal(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_defaults_to_sigkill() {
        assert_eq!(parse_signal("").unwrap(), ("SIGKILL", 9));
    }

    #[test]
    fn names_are_normalized() {
        assert_eq!(parse_signal("sighup").unwrap().0, "SIGHUP");
        assert_eq!(parse_signal("USR1").unwrap().0, "SIGUSR1");
        assert_eq!(parse_signal(" SIGTERM ").unwrap().1, 15);
    }

    #[test]
    fn unknown_signal_is_rejected() {
        let err = parse_signal("SIGWINCH").unwrap_err();
        assert!(matches!(err, ClientError::InvalidSignal(name) if name == "SIGWINCH"));
    }
}
