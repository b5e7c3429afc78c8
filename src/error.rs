use thiserror::Error;

/// Errors surfaced across the live call pipeline.
///
/// Capture and playback problems are reported through callbacks and decided
/// on by the session layer; they never unwind into the caller of the facade.
/// Teardown of an already-released resource is not an error at all; the
/// cleanup paths log a warning and carry on.
#[derive(Debug, Error)]
pub enum LiveCallError {
    /// Microphone access was refused by the platform or the user.
    #[error("microphone access denied: {0}")]
    Permission(String),

    /// The platform has no usable audio capture/playback APIs or devices.
    #[error("audio not supported on this platform: {0}")]
    Unsupported(String),

    /// The realtime channel failed, rejected a send, or disconnected.
    #[error("realtime channel error: {0}")]
    Channel(String),

    /// Microphone capture failed mid-stream.
    #[error("audio capture failed: {0}")]
    Capture(String),

    /// The recap collaborator failed or returned malformed data.
    #[error("recap generation failed: {0}")]
    Recap(String),

    /// The persistence collaborator could not store the completed session.
    #[error("failed to persist session: {0}")]
    Persistence(String),

    /// A second call was requested while one is active or finalizing.
    #[error("a live call is already in progress")]
    CallAlreadyActive,

    /// The requested operation needs an active call and none exists.
    #[error("no active call")]
    NoActiveCall,
}

impl LiveCallError {
    /// Short status line suitable for a UI status area.
    pub fn status_line(&self) -> String {
        let msg = self.to_string();
        if msg.chars().count() > 60 {
            let truncated: String = msg.chars().take(60).collect();
            format!("{}...", truncated)
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line_truncates() {
        let err = LiveCallError::Channel("x".repeat(100));
        let line = err.status_line();
        assert!(line.len() <= 63);
        assert!(line.ends_with("..."));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            LiveCallError::CallAlreadyActive.to_string(),
            "a live call is already in progress"
        );
        assert!(LiveCallError::Permission("denied by user".into())
            .to_string()
            .contains("denied by user"));
    }
}
