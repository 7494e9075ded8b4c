/// How strongly a submission acknowledgment is tied to durable storage.
///
/// Background jobs are always acknowledged optimistically regardless of
/// this setting; their submitting client is not waiting on the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// A non-background submission fails if the backend `add` fails.
    Strict,
    /// Backend `add` failures are logged; the submission is acknowledged
    /// anyway. In-memory state remains the source of truth.
    Relaxed,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Prefix baked into every job handle (`H:<prefix>:<seq>`).
    /// Typically the host name of the broker process.
    pub handle_prefix: String,

    /// Maximum pending jobs per function. `None` means unbounded.
    pub max_pending_per_function: Option<usize>,

    /// How many worker-reported failures a job survives before it is
    /// marked failed permanently. 0 means a failure is terminal.
    /// Worker disconnects never count against this.
    pub retry_limit: u32,

    /// Ack strength for non-background submissions.
    pub durability: Durability,

    /// How often the broker task moves due scheduled jobs into visibility.
    pub sweep_interval_ms: u64,

    /// Capacity of each connection's outbound event channel. A client that
    /// lags further than this loses events rather than stalling dispatch.
    pub event_channel_capacity: usize,

    /// Capacity of the inbound command channel.
    pub command_channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            handle_prefix: "forgeq".to_string(),
            max_pending_per_function: None,
            retry_limit: 0,
            durability: Durability::Strict,
            sweep_interval_ms: 1000,
            event_channel_capacity: 64,
            command_channel_capacity: 256,
        }
    }
}

impl BrokerConfig {
    pub fn new(handle_prefix: impl Into<String>) -> Self {
        Self {
            handle_prefix: handle_prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending_per_function = Some(max);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}
