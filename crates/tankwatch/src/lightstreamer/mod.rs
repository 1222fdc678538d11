//! Lightstreamer feed transport over TLCP HTTP streaming.
//!
//! One `run` call is one server session: `create_session.txt` opens a
//! streaming response, and once the server answers `CONOK` a single MERGE
//! subscription for the configured item is added over `control.txt`. Field
//! updates then arrive on the stream until it ends.

pub mod tlcp;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tankconf::FeedConfig;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{FeedEvent, FeedTransport, RawUpdate};
use tlcp::{form_body, parse_line, MergeState, Message, PROTOCOL_VERSION};

const SUBSCRIPTION_ID: u64 = 1;
const DEFAULT_STATUS_CLASS: &str = "24";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

/// Connection parameters for one Lightstreamer item.
#[derive(Debug, Clone, PartialEq)]
pub struct LightstreamerConfig {
    /// Base URL, e.g. `https://push.lightstreamer.com`
    pub server: String,
    pub adapter_set: String,
    pub client_id: String,
    pub item: String,
    pub value_field: String,
    pub timestamp_field: String,
    pub status_field: String,
    pub keepalive: Duration,
    pub read_timeout: Duration,
    /// Bytes the server may stream before asking us to rebind
    pub content_length: u64,
}

impl LightstreamerConfig {
    fn schema(&self) -> String {
        [&self.value_field, &self.timestamp_field, &self.status_field]
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn base_url(&self) -> &str {
        self.server.trim_end_matches('/')
    }
}

impl From<&FeedConfig> for LightstreamerConfig {
    fn from(feed: &FeedConfig) -> Self {
        Self {
            server: feed.server.clone(),
            adapter_set: feed.adapter_set.clone(),
            client_id: feed.client_id.clone(),
            item: feed.item.clone(),
            value_field: feed.value_field.clone(),
            timestamp_field: feed.timestamp_field.clone(),
            status_field: feed.status_field.clone(),
            keepalive: Duration::from_millis(feed.keepalive_ms),
            read_timeout: Duration::from_millis(feed.read_timeout_ms),
            content_length: 50_000_000,
        }
    }
}

/// [`FeedTransport`] for the ISS Live Lightstreamer server.
pub struct LightstreamerTransport {
    config: LightstreamerConfig,
    client: Client,
    /// Shared across sessions so sequences keep increasing after reconnects
    sequence: AtomicU64,
    requests: AtomicU64,
}

impl LightstreamerTransport {
    pub fn new(config: LightstreamerConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("tankwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: LightstreamerConfig, client: Client) -> Self {
        Self {
            config,
            client,
            sequence: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LightstreamerConfig {
        &self.config
    }

    async fn create_session(&self) -> Result<reqwest::Response, TransportError> {
        let url = format!(
            "{}/lightstreamer/create_session.txt?LS_protocol={}",
            self.config.base_url(),
            PROTOCOL_VERSION
        );
        let keepalive = self.config.keepalive.as_millis().to_string();
        let content_length = self.config.content_length.to_string();
        let body = form_body(&[
            ("LS_adapter_set", self.config.adapter_set.as_str()),
            ("LS_cid", self.config.client_id.as_str()),
            ("LS_keepalive_millis", keepalive.as_str()),
            ("LS_content_length", content_length.as_str()),
            ("LS_send_sync", "false"),
        ]);

        debug!("Creating Lightstreamer session at {}", url);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        check_status(response).await
    }

    async fn subscribe(&self, session_id: &str, control_link: Option<&str>) -> Result<(), TransportError> {
        let base = match control_link {
            Some(link) => {
                let scheme = self.config.base_url().split("://").next().unwrap_or("https");
                format!("{}://{}", scheme, link.trim_end_matches('/'))
            }
            None => self.config.base_url().to_string(),
        };
        let url = format!(
            "{}/lightstreamer/control.txt?LS_protocol={}&LS_session={}",
            base, PROTOCOL_VERSION, session_id
        );

        let req_id = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let req_id_str = req_id.to_string();
        let sub_id = SUBSCRIPTION_ID.to_string();
        let schema = self.config.schema();
        let body = form_body(&[
            ("LS_reqId", req_id_str.as_str()),
            ("LS_op", "add"),
            ("LS_subId", sub_id.as_str()),
            ("LS_mode", "MERGE"),
            ("LS_group", self.config.item.as_str()),
            ("LS_schema", schema.as_str()),
            ("LS_snapshot", "true"),
        ]);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let text = check_status(response).await?.text().await?;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match parse_line(line)? {
                Message::ReqOk { .. } => {
                    debug!(req_id, "Subscription request accepted");
                }
                Message::ReqErr { code, message, .. } | Message::Error { code, message } => {
                    return Err(TransportError::SubscriptionRejected { code, message });
                }
                other => debug!("Unexpected control response: {:?}", other),
            }
        }

        info!(item = %self.config.item, "Subscribed to {}", self.config.schema());
        Ok(())
    }

    async fn handle_message(
        &self,
        message: Message,
        merge: &mut MergeState,
        events: &mpsc::Sender<FeedEvent>,
    ) -> Result<Flow, TransportError> {
        match message {
            Message::ConOk {
                session_id,
                control_link,
            } => {
                info!(session = %session_id, "Lightstreamer session established");
                if events.send(FeedEvent::Connected).await.is_err() {
                    return Ok(Flow::Done);
                }
                self.subscribe(&session_id, control_link.as_deref()).await?;
            }
            Message::ConErr { code, message } => {
                return Err(TransportError::Refused { code, message });
            }
            Message::SubOk { sub_id, fields, .. } => {
                debug!(sub_id, fields, "Subscription confirmed");
                merge.reset(fields);
            }
            Message::Update {
                sub_id, payload, ..
            } => {
                if sub_id != SUBSCRIPTION_ID {
                    debug!(sub_id, "Update for unknown subscription");
                    return Ok(Flow::Continue);
                }
                merge.apply(&payload)?;

                let update = RawUpdate {
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
                    value: merge.get(0).map(str::to_string),
                    timestamp: merge.get(1).map(str::to_string),
                    status: merge.get(2).map(str::to_string),
                };
                if let Some(status) = update.status.as_deref() {
                    if status != DEFAULT_STATUS_CLASS {
                        warn!(status, "Update with non-default status class");
                    }
                }
                if events.send(FeedEvent::Update(update)).await.is_err() {
                    return Ok(Flow::Done);
                }
            }
            Message::EndOfSnapshot { sub_id } => debug!(sub_id, "End of snapshot"),
            Message::ClearSnapshot { sub_id } => {
                debug!(sub_id, "Clear snapshot");
                merge.clear();
            }
            Message::ReqOk { req_id } => debug!(req_id, "Request acknowledged"),
            Message::ReqErr { code, message, .. } => {
                return Err(TransportError::SubscriptionRejected { code, message });
            }
            Message::Error { code, message } => {
                return Err(TransportError::Protocol(format!("server error {}: {}", code, message)));
            }
            Message::Loop => {
                info!("Server asked for a rebind");
                return Ok(Flow::Done);
            }
            Message::End { code, message } => {
                info!(code, "Server ended the session: {}", message);
                return Ok(Flow::Done);
            }
            Message::Keepalive => {}
            Message::Info(line) => debug!("{}", line),
            Message::Unknown(line) => debug!("Ignoring unknown message {:?}", line),
        }
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl FeedTransport for LightstreamerTransport {
    async fn run(&self, events: mpsc::Sender<FeedEvent>) -> Result<(), TransportError> {
        let response = self.create_session().await?;
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut merge = MergeState::new(3);

        loop {
            let chunk = match tokio::time::timeout(self.config.read_timeout, stream.next()).await {
                Err(_) => return Err(TransportError::Timeout(self.config.read_timeout)),
                Ok(None) => {
                    return Err(TransportError::Closed("stream ended without LOOP or END".into()))
                }
                Ok(Some(chunk)) => chunk?,
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }

                let message = parse_line(line)?;
                if self.handle_message(message, &mut merge, &events).await? == Flow::Done {
                    return Ok(());
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} ({} / {})",
            self.config.base_url(),
            self.config.adapter_set,
            self.config.item
        )
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}
