use pggate_protocol::{ErrorFields, Message};
use thiserror::Error;

/// Message severity of a client-visible error. FATAL forces connection
/// teardown after the ErrorResponse is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

/// A postgres-compatible error. Any error can be reported to the client,
/// but this type carries the optional protocol fields (SQLSTATE code,
/// detail, hint, cursor position) that make the report useful.
///
/// Postgres has hundreds of error codes broken into categories; the
/// constructors below cover the ones the core needs. Position is 1-based
/// when set and -1 when absent.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PgError {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: i32,
}

impl PgError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        PgError {
            severity: Severity::Error,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: -1,
        }
    }

    /// A syntax error in the provided SQL.
    pub fn syntax(message: impl Into<String>) -> Self {
        PgError::new("42601", message)
    }

    /// Indicates that a certain entity (function, type, column, etc.) is
    /// not registered or available for use.
    pub fn unrecognized(message: impl Into<String>) -> Self {
        PgError::new("42000", format!("unrecognized {}", message.into()))
    }

    /// Indicates that the request is logically invalid within the session,
    /// as opposed to syntactically malformed.
    pub fn invalid(message: impl Into<String>) -> Self {
        PgError::new("42000", format!("invalid {}", message.into()))
    }

    /// Indicates a permissions or authorization failure.
    pub fn disallowed(message: impl Into<String>) -> Self {
        PgError::new("42000", format!("disallowed {}", message.into()))
    }

    /// Indicates that a recognized entity cannot perform the requested
    /// functionality.
    pub fn unsupported(message: impl Into<String>) -> Self {
        PgError::new("0A000", format!("unsupported {}", message.into()))
    }

    /// An authentication failure; always fatal.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        PgError::new("28P01", message).with_severity(Severity::Fatal)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PgError::new("XX000", message)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attaches a suggestion of what to do about the problem. Intended to
    /// differ from detail in that it offers advice rather than hard facts.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attaches the 1-based cursor position of the error in the query
    /// text. The bottom-most position wins, so outer layers cannot
    /// override where the error actually originated.
    pub fn with_position(mut self, position: i32) -> Self {
        if self.position < 0 && position >= 0 {
            self.position = position;
        }
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// The wire-level ErrorResponse for this error.
    pub fn to_message(&self) -> Message {
        Message::error_response(&ErrorFields {
            severity: self.severity.as_str(),
            code: &self.code,
            message: &self.message,
            detail: self.detail.as_deref(),
            hint: self.hint.as_deref(),
            position: (self.position >= 0).then_some(self.position),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_codes() {
        assert_eq!(PgError::syntax("bad").code, "42601");
        assert_eq!(PgError::unrecognized("type").code, "42000");
        assert_eq!(PgError::invalid("request").code, "42000");
        assert_eq!(PgError::disallowed("write").code, "42000");
        assert_eq!(PgError::unsupported("feature").code, "0A000");
        assert_eq!(PgError::internal("boom").code, "XX000");
        assert_eq!(PgError::unrecognized("type OID 9").message, "unrecognized type OID 9");
    }

    #[test]
    fn auth_failure_is_fatal() {
        let err = PgError::auth_failed("Password does not match for user \"bob\"");
        assert_eq!(err.code, "28P01");
        assert!(err.is_fatal());
    }

    #[test]
    fn innermost_position_wins() {
        let err = PgError::syntax("bad").with_position(3).with_position(17);
        assert_eq!(err.position, 3);
        let unset = PgError::syntax("bad").with_position(-1);
        assert_eq!(unset.position, -1);
    }

    #[test]
    fn to_message_carries_fields() {
        let msg = PgError::syntax("boom")
            .with_hint("look closer")
            .with_position(2)
            .to_message();
        let bytes = msg.as_bytes();
        assert_eq!(msg.message_type(), b'E');
        assert_eq!(&bytes[5..], b"SERROR\0C42601\0Mboom\0Hlook closer\0P2\0\0");
    }

    #[test]
    fn fatal_severity_in_message() {
        let msg = PgError::auth_failed("no").to_message();
        let body = msg.as_bytes();
        assert!(body.windows(6).any(|w| w == b"SFATAL"));
    }
}
