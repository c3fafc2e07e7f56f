use std::time::Duration;

/// The default per-request deadline, applied when the connection config
/// leaves it unset
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Message body of the error frame emitted for a timed-out request
pub const TASK_EXPIRED_MESSAGE: &str = "task expired";

/// Request header echoed back on error frames for load reporting
pub const LOAD_HEADER: &str = "load";

/// Response header carrying the error-kind code on error frames
pub const ERROR_KIND_HEADER: &str = "ex";
