//! Step responses.
//!
//! Every step execution resolves to a [`Response`]: success or failure, an
//! optional payload handed to the next step, the transferred byte count, and
//! an optional latency override that replaces the measured elapsed time in
//! the statistics.

use serde::Serialize;

/// Signal carried out of a step alongside its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    /// Keep the session running.
    Continue,

    /// Terminate the whole session cooperatively at the next step boundary.
    StopTest,
}

/// The outcome of a single step execution.
#[derive(Debug, Clone)]
pub struct Response {
    /// Whether the step succeeded.
    pub ok: bool,

    /// Payload visible to the next step via the step context.
    pub payload: Option<String>,

    /// Bytes transferred by the step. Defaults to the payload length.
    pub size_bytes: u64,

    /// Custom latency that overrides the measured elapsed time in stats.
    pub latency_ms: Option<u64>,

    /// Cooperative session control signal.
    pub exit_code: ExitCode,
}

impl Response {
    /// A successful response with no payload.
    pub fn ok() -> Self {
        Self {
            ok: true,
            payload: None,
            size_bytes: 0,
            latency_ms: None,
            exit_code: ExitCode::Continue,
        }
    }

    /// A successful response carrying a payload; `size_bytes` defaults to
    /// the payload length.
    pub fn ok_payload(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            ok: true,
            size_bytes: payload.len() as u64,
            payload: Some(payload),
            latency_ms: None,
            exit_code: ExitCode::Continue,
        }
    }

    /// A failed response.
    pub fn fail() -> Self {
        Self {
            ok: false,
            payload: None,
            size_bytes: 0,
            latency_ms: None,
            exit_code: ExitCode::Continue,
        }
    }

    /// Override the transferred byte count.
    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Override the measured latency used for statistics.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Mark this response as a cooperative stop-test signal.
    ///
    /// The response itself is still processed normally; the session stops at
    /// the next step boundary.
    pub fn with_stop_test(mut self) -> Self {
        self.exit_code = ExitCode::StopTest;
        self
    }
}
