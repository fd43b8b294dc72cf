//! Firehose subscription options.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Selects which envelopes a firehose subscription receives.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeFilter {
    /// Only log-message envelopes.
    #[serde(rename = "logs")]
    LogMessages,
    /// Only metric envelopes.
    Metrics,
    /// Every envelope.
    #[default]
    All,
}

impl EnvelopeFilter {
    /// Query-string fragment understood by the traffic controller.
    pub fn query_param(self) -> &'static str {
        match self {
            EnvelopeFilter::LogMessages => "filter-type=logs",
            EnvelopeFilter::Metrics => "filter-type=metrics",
            EnvelopeFilter::All => "",
        }
    }
}

/// Parameters of one firehose subscription.
///
/// Clients sharing a subscription id split the firehose between them.
#[derive(Clone, Debug)]
pub struct FirehoseOptions {
    pub subscription_id: String,
    pub auth_token: SecretString,
    /// Reconnect with backoff when `true`; make a single attempt otherwise.
    pub retry: bool,
    pub filter: EnvelopeFilter,
}

impl FirehoseOptions {
    /// Retrying, unfiltered subscription.
    pub fn new(subscription_id: impl Into<String>, auth_token: SecretString) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            auth_token,
            retry: true,
            filter: EnvelopeFilter::All,
        }
    }

    /// Restricts the subscription to `filter`.
    pub fn with_filter(mut self, filter: EnvelopeFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Chooses between reconnecting and a single attempt.
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Connection path, e.g. `/firehose/sub-1?filter-type=logs`.
    pub fn path(&self) -> String {
        format!(
            "/firehose/{}?{}",
            self.subscription_id,
            self.filter.query_param()
        )
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{EnvelopeFilter, FirehoseOptions};

    fn token() -> SecretString {
        SecretString::new("bearer token".to_string())
    }

    #[test]
    fn defaults_to_retrying_unfiltered_subscription() {
        let options = FirehoseOptions::new("sub-1", token());
        assert!(options.retry);
        assert_eq!(options.filter, EnvelopeFilter::All);
        assert_eq!(options.path(), "/firehose/sub-1?");
    }

    #[test]
    fn filter_is_encoded_into_query_string() {
        let logs = FirehoseOptions::new("sub-1", token()).with_filter(EnvelopeFilter::LogMessages);
        assert_eq!(logs.path(), "/firehose/sub-1?filter-type=logs");

        let metrics = FirehoseOptions::new("sub-1", token()).with_filter(EnvelopeFilter::Metrics);
        assert_eq!(metrics.path(), "/firehose/sub-1?filter-type=metrics");
    }

    #[test]
    fn filter_deserializes_from_config_names() {
        let filter: EnvelopeFilter = serde_json::from_str("\"logs\"").expect("logs");
        assert_eq!(filter, EnvelopeFilter::LogMessages);
        let filter: EnvelopeFilter = serde_json::from_str("\"metrics\"").expect("metrics");
        assert_eq!(filter, EnvelopeFilter::Metrics);
        let filter: EnvelopeFilter = serde_json::from_str("\"all\"").expect("all");
        assert_eq!(filter, EnvelopeFilter::All);
    }
}
