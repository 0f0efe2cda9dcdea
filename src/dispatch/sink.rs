use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::envelope::EventEnvelope;
use crate::error::DispatchError;

/// Delivery target for decoded events.
///
/// `Ok` means the event was accepted and may be acknowledged; any error
/// leaves it for redelivery.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, target: &str, event: &EventEnvelope) -> Result<(), DispatchError>;
}

/// Posts events to HTTP endpoints in CloudEvents binary mode.
///
/// Any 2xx status is a success. Every request is bounded by the timeout
/// given at construction.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, target: &str, event: &EventEnvelope) -> Result<(), DispatchError> {
        let url = reqwest::Url::parse(target)
            .map_err(|e| DispatchError::InvalidSink(format!("{target}: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in event.binary_headers() {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DispatchError::Decode(format!("header {name}: {e}")))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|e| DispatchError::Decode(format!("header {name}: {e}")))?;
            headers.insert(header_name, header_value);
        }

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(event.data.clone())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DispatchError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_target_is_reported() {
        let sink = HttpSink::new(Duration::from_secs(1)).unwrap();
        let event = EventEnvelope::new("1", "shop", "order.created", b"{}".to_vec());
        let err = sink.deliver("not a url", &event).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSink(_)));
    }

    #[tokio::test]
    async fn unreachable_target_is_a_transport_failure() {
        let sink = HttpSink::new(Duration::from_secs(1)).unwrap();
        let event = EventEnvelope::new("1", "shop", "order.created", b"{}".to_vec());
        // port 9 (discard) is closed on test machines
        let err = sink.deliver("http://127.0.0.1:9/", &event).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Transport(_) | DispatchError::Timeout
        ));
    }
}
