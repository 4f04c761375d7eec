use thiserror::Error;

/// Typed error hierarchy for chatgate.
///
/// Use at module boundaries (webhook auth, dispatch, platform sends, config).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Webhook signature missing or mismatched. The caller must answer with an
    /// unauthorized status and halt processing.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The conversation's channel has no registered send path.
    #[error("unsupported channel: {0}")]
    UnsupportedChannel(String),

    /// A relay conversation lacks the stored routing metadata required for a
    /// cold send, or a web conversation has no live connection.
    #[error("missing channel data: {0}")]
    MissingChannelData(String),

    /// A platform messaging API answered with a non-success status.
    /// Not retried by this crate.
    #[error("platform send failed with status {status}: {body}")]
    Delivery { status: u16, body: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn delivery(status: u16, body: impl Into<String>) -> Self {
        Self::Delivery {
            status,
            body: body.into(),
        }
    }

    /// Whether this error is a configuration/routing defect of the send path
    /// itself, as opposed to a transient delivery failure.
    pub fn is_routing_defect(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedChannel(_) | Self::MissingChannelData(_) | Self::Config(_)
        )
    }
}
