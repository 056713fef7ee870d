use log::debug;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::Error;
use crate::fetch::{FetchClient, ensure_success};
use crate::render::WebhookPayload;

/// Identifier of a message posted through the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts a bare id or a full message link, in which case the last path
/// segment is used.
impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Config(format!("invalid message id: {s:?}")));
        }
        Ok(Self(id.to_string()))
    }
}

/// The message being kept up to date. Goes from unset to set once and never
/// back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryHandle(Option<MessageId>);

impl DeliveryHandle {
    /// Starts from a message that already exists.
    #[must_use]
    pub fn resume(id: MessageId) -> Self {
        Self(Some(id))
    }

    #[must_use]
    pub fn get(&self) -> Option<&MessageId> {
        self.0.as_ref()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    fn set(&mut self, id: MessageId) {
        debug_assert!(self.0.is_none(), "delivery handle set twice");
        self.0.get_or_insert(id);
    }
}

/// What [`Webhook::deliver`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Created(MessageId),
    Updated(MessageId),
}

#[derive(Debug, Deserialize)]
struct CreateAck {
    #[serde(default)]
    id: Option<String>,
}

/// Creates the webhook message once, then edits it in place.
#[derive(Debug, Clone)]
pub struct Webhook {
    fetch: FetchClient,
    url: Url,
}

impl Webhook {
    #[must_use]
    pub fn new(fetch: FetchClient, url: Url) -> Self {
        Self { fetch, url }
    }

    /// Posts a new message when `handle` is unset, otherwise edits the
    /// message it points to.
    ///
    /// On a failed create the handle stays unset so the next call retries
    /// creation. An update never touches the handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the webhook answers with a
    /// non-2xx status, or a create is not acknowledged with a message id.
    pub async fn deliver(
        &self,
        payload: &WebhookPayload,
        handle: &mut DeliveryHandle,
    ) -> Result<Delivered, Error> {
        if let Some(id) = handle.get() {
            self.update(payload, id).await?;
            return Ok(Delivered::Updated(id.clone()));
        }

        let id = self.create(payload).await?;
        handle.set(id.clone());
        Ok(Delivered::Created(id))
    }

    async fn create(&self, payload: &WebhookPayload) -> Result<MessageId, Error> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("wait", "true");

        let request = self.fetch.http().post(url).json(payload);
        let response = ensure_success(self.fetch.send(request).await?)?;
        let ack: CreateAck = response.json().await?;

        let id = ack.id.ok_or(Error::MissingField("id"))?;
        debug!("Webhook acknowledged message {id}");
        id.parse()
            .map_err(|_| Error::MalformedResponse(format!("message id {id:?}")))
    }

    async fn update(&self, payload: &WebhookPayload, id: &MessageId) -> Result<(), Error> {
        let url = self.message_url(id)?;
        let request = self.fetch.http().patch(url).json(payload);
        ensure_success(self.fetch.send(request).await?)?;
        Ok(())
    }

    fn message_url(&self, id: &MessageId) -> Result<Url, Error> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("webhook URL cannot be a base: {}", self.url)))?
            .pop_if_empty()
            .push("messages")
            .push(id.as_str());
        Ok(url)
    }
}
