//! Webhook sink: POST the batch as a JSON array to the configured URL.
use super::{Action, ActionError};
use crate::error::EventsError;
use crate::model::{EventEntry, WebhookInfo};
use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;
use std::time::Duration;

pub(crate) struct WebhookAction {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    allow_private_ips: bool,
}

impl WebhookAction {
    pub(crate) fn new(info: &WebhookInfo, allow_private_ips: bool) -> Result<Self, EventsError> {
        if info.url.is_empty() {
            return Err(EventsError::Validation(
                "webhook url is required".to_string(),
            ));
        }
        let url = Url::parse(&info.url).map_err(|_| {
            EventsError::Validation(format!("invalid webhook url: {}", info.url))
        })?;
        let mut headers = HeaderMap::new();
        for (name, value) in &info.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                EventsError::Validation(format!("invalid webhook header name: {name}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                EventsError::Validation(format!("invalid webhook header value for {name}"))
            })?;
            headers.insert(name, value);
        }
        let request_timeout = if info.request_timeout_sec == 0 {
            120
        } else {
            info.request_timeout_sec
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(u64::from(request_timeout)))
            .danger_accept_invalid_certs(info.tls_skip_host_verify)
            .build()
            .map_err(|err| {
                EventsError::Validation(format!("failed to build webhook client: {err}"))
            })?;
        Ok(Self {
            client,
            url,
            headers,
            allow_private_ips,
        })
    }

    // Resolve the target and refuse local/private/multicast addresses.
    // Runs before every attempt since DNS answers can change.
    async fn ensure_address_allowed(&self) -> Result<(), ActionError> {
        if self.allow_private_ips {
            return Ok(());
        }
        let host = self
            .url
            .host_str()
            .ok_or_else(|| ActionError::Unresolvable(self.url.to_string()))?
            .to_string();
        let port = self.url.port_or_known_default().unwrap_or(443);
        let lookup_host = host.clone();
        let mut addrs = tokio::net::lookup_host((lookup_host.as_str(), port))
            .await
            .map_err(|_| ActionError::Unresolvable(host.clone()))?;
        match addrs.next() {
            Some(addr) if is_address_unsafe(addr.ip()) => Err(ActionError::UnsafeAddress(host)),
            Some(_) => Ok(()),
            None => Err(ActionError::Unresolvable(host)),
        }
    }
}

fn is_address_unsafe(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 0
                || octets[0] >= 224
                || octets[0] == 127
                || octets[0] == 10
                || (octets[0] == 172 && octets[1] >= 16 && octets[1] < 32)
                || (octets[0] == 192 && octets[1] == 168)
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[async_trait]
impl Action for WebhookAction {
    async fn attempt_batch(
        &self,
        batch_number: u64,
        attempt: u64,
        events: &[EventEntry],
    ) -> Result<(), ActionError> {
        self.ensure_address_allowed().await?;
        tracing::debug!(
            url = %self.url,
            batch = batch_number,
            attempt,
            events = events.len(),
            "posting batch to webhook"
        );
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(&events)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ActionError::Status(response.status().as_u16()))
        }
    }
}
