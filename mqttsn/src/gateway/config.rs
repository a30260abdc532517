//! Gateway configuration.

use std::time::Duration;

use crate::mqtt::MAX_PACKET_SIZE;
use crate::topics::PredefinedTopics;

/// Default retransmission interval (T_retry).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default retransmission budget (N_retry).
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default deadline for the whole CONNECT handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single transport read.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// UDP listen address (host:port).
    pub listen: String,
    /// Broker TCP address (host:port).
    pub broker: String,
    /// Gateway id announced in GWINFO.
    pub gateway_id: u8,
    /// Interval between retransmissions.
    pub retry_delay: Duration,
    /// Retransmissions before a transaction fails.
    pub retry_count: u32,
    /// Deadline for CONNECT, optional AUTH and will negotiation.
    pub connect_timeout: Duration,
    /// Bound on one transport read, so cancellation is noticed promptly.
    pub poll_interval: Duration,
    /// Bound on one transport write.
    pub write_timeout: Duration,
    /// Require an AUTH exchange before CONNECT is forwarded.
    pub auth_enabled: bool,
    /// Predefined topic ids.
    pub predefined: PredefinedTopics,
    /// Credentials for the broker when the client does not authenticate.
    pub broker_username: Option<String>,
    pub broker_password: Option<Vec<u8>>,
    /// Registered topic ids per session.
    pub max_topic_aliases: u16,
    /// Maximum MQTT packet size on the broker leg.
    pub max_packet_size: usize,
    /// Client id prefix for broker sessions opened by session-less publishes.
    pub anonymous_prefix: String,
}

impl GatewayConfig {
    /// Create a new gateway config.
    pub fn new(listen: impl Into<String>, broker: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            broker: broker.into(),
            gateway_id: 1,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_count: DEFAULT_RETRY_COUNT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: Duration::from_secs(5),
            auth_enabled: false,
            predefined: PredefinedTopics::new(),
            broker_username: None,
            broker_password: None,
            max_topic_aliases: u16::MAX,
            max_packet_size: MAX_PACKET_SIZE,
            anonymous_prefix: "mqttsn".to_string(),
        }
    }

    /// Set the gateway id.
    pub fn with_gateway_id(mut self, id: u8) -> Self {
        self.gateway_id = id;
        self
    }

    /// Set retransmission interval and budget.
    pub fn with_retry(mut self, delay: Duration, count: u32) -> Self {
        self.retry_delay = delay;
        self.retry_count = count;
        self
    }

    /// Set the CONNECT handshake deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the transport poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable the AUTH exchange.
    pub fn with_auth(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    /// Set predefined topic ids.
    pub fn with_predefined(mut self, predefined: PredefinedTopics) -> Self {
        self.predefined = predefined;
        self
    }

    /// Set fallback broker credentials.
    pub fn with_broker_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.broker_username = Some(username.into());
        self.broker_password = Some(password.into());
        self
    }

    /// Set the number of registered topic ids per session.
    pub fn with_max_topic_aliases(mut self, max: u16) -> Self {
        self.max_topic_aliases = max;
        self
    }

    /// Set the client id prefix for session-less publishers.
    pub fn with_anonymous_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.anonymous_prefix = prefix.into();
        self
    }

    /// Deadline for transactions with no retransmission of their own.
    pub(crate) fn retry_window(&self) -> Duration {
        self.retry_delay * (self.retry_count + 1)
    }
}
