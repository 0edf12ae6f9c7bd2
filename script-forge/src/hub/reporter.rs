use super::LogHub;

/// Emits progress for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunReporter {
    hub: LogHub,
    request_id: String,
}

impl RunReporter {
    pub fn new(hub: LogHub, request_id: impl Into<String>) -> Self {
        Self {
            hub,
            request_id: request_id.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    pub fn log(&self, message: impl Into<String>) {
        self.hub.emit(message, &self.request_id);
    }

    /// Publish the terminal notice for this run.
    pub fn complete(&self, message: impl Into<String>) {
        self.hub.complete(&self.request_id, message);
    }
}
