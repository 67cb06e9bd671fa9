use std::time::Duration;

/// Configuration for the control core.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How many times an out-of-order message may be re-queued while its
    /// device is still unclassified before it is dropped (default: 2048).
    pub retry_ceiling: u32,
    /// Upper bound on every hardware confirmation wait. `None` waits
    /// until confirmed or cancelled (default: 60 seconds).
    pub confirm_timeout: Option<Duration>,
    /// How many finished tasks the scheduler keeps for inspection
    /// (default: 100).
    pub finished_history: usize,
    /// How many driver messages each device keeps, latest first
    /// (default: 100).
    pub device_message_history: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 2048,
            confirm_timeout: Some(Duration::from_secs(60)),
            finished_history: 100,
            device_message_history: 100,
        }
    }
}

impl ControlConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> ControlConfigBuilder {
        ControlConfigBuilder::default()
    }
}

/// Builder for ControlConfig.
#[derive(Debug, Clone, Default)]
pub struct ControlConfigBuilder {
    config: ControlConfig,
}

impl ControlConfigBuilder {
    pub fn retry_ceiling(mut self, ceiling: u32) -> Self {
        self.config.retry_ceiling = ceiling;
        self
    }

    pub fn confirm_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.confirm_timeout = timeout;
        self
    }

    pub fn finished_history(mut self, capacity: usize) -> Self {
        self.config.finished_history = capacity;
        self
    }

    pub fn device_message_history(mut self, capacity: usize) -> Self {
        self.config.device_message_history = capacity;
        self
    }

    pub fn build(self) -> ControlConfig {
        self.config
    }
}
