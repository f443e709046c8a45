//! Microsoft Graph adapter (delta-link change tracking).
//!
//! Implements [`MailAdapter`] against the Graph mail API:
//! - `/me/messages/delta` for native change tracking, walking
//!   `@odata.nextLink` pages until an `@odata.deltaLink` closes the round
//! - `/me/messages?$filter=receivedDateTime gt ...` as the timestamp
//!   fallback for accounts without change-tracking support
//! - `/me/messages/{id}` and `/me/messages/{id}/attachments/{id}/$value`
//!   for single fetches
//!
//! Mode selection: delta is attempted first; a provider error recognizable
//! as "change tracking not supported" downgrades the connection to
//! timestamp mode permanently (the successor cursor becomes a timestamp).
//! A transient delta failure is not a downgrade: the error propagates and
//! the cursor is left unchanged so the next run retries delta.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use super::{
    truncate_snippet, ChangeSet, MailAdapter, ParsedAttachment, ParsedMessage, ProviderError,
    RemovedMessage, Result, RetryPolicy,
};
use crate::config::SyncConfig;
use crate::domain::{Address, ConnectionId, Cursor, DeltaMode, ExternalId, Folder, ProviderKind};
use crate::external::{Credential, CredentialSource};

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Graph error codes that mean the mailbox cannot do delta queries at all
/// (on-prem sync'd mailboxes, some shared mailboxes). Distinct from a
/// transient failure or an expired token.
const CHANGE_TRACKING_UNSUPPORTED_CODES: &[&str] =
    &["SyncStateNotSupported", "ChangeTrackingNotSupported"];

/// Graph list/delta response page.
#[derive(Debug, Deserialize)]
struct GraphPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// Graph error envelope.
#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: Option<GraphErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Graph mail message (subset of fields the engine consumes).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(rename = "@removed")]
    removed: Option<GraphRemoved>,
    subject: Option<String>,
    body_preview: Option<String>,
    body: Option<GraphBody>,
    from: Option<GraphRecipient>,
    to_recipients: Option<Vec<GraphRecipient>>,
    cc_recipients: Option<Vec<GraphRecipient>>,
    bcc_recipients: Option<Vec<GraphRecipient>>,
    sent_date_time: Option<DateTime<Utc>>,
    received_date_time: Option<DateTime<Utc>>,
    is_read: Option<bool>,
    flag: Option<GraphFlag>,
    parent_folder_id: Option<String>,
    attachments: Option<Vec<GraphAttachment>>,
}

/// `@removed` marker on delta pages.
#[derive(Debug, Deserialize)]
struct GraphRemoved {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFlag {
    flag_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    id: String,
    name: Option<String>,
    content_type: Option<String>,
    size: Option<u64>,
    is_inline: Option<bool>,
    content_id: Option<String>,
}

/// Graph folder lookup response entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphFolderPage {
    value: Vec<GraphFolder>,
}

/// Microsoft Graph adapter.
pub struct GraphAdapter {
    connection_id: ConnectionId,
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    retry: RetryPolicy,
    config: SyncConfig,
}

impl GraphAdapter {
    /// Creates an adapter for the given connection.
    pub fn new(
        connection_id: ConnectionId,
        credentials: Arc<dyn CredentialSource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            connection_id,
            client: reqwest::Client::new(),
            base_url: GRAPH_API_BASE.to_string(),
            credentials,
            retry: RetryPolicy::from_config(&config.retry),
            config,
        }
    }

    /// Overrides the API base URL (for tests against a local server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn bearer_token(&self) -> Result<String> {
        let credential = self
            .credentials
            .credential(&self.connection_id)
            .await
            .map_err(|e| ProviderError::Authentication(e.to_string()))?;
        match credential {
            Credential::Bearer { token } => Ok(token),
            Credential::Login { .. } => Err(ProviderError::Authentication(
                "graph connection requires an OAuth bearer credential".to_string(),
            )),
        }
    }

    /// Classifies a Graph error body, promoting unsupported-capability
    /// signals out of the generic HTTP bucket.
    fn classify_error(status: u16, body: &str) -> ProviderError {
        if let Ok(envelope) = serde_json::from_str::<GraphErrorEnvelope>(body) {
            if let Some(error) = envelope.error {
                let code = error.code.unwrap_or_default();
                let message = error.message.unwrap_or_default();
                if CHANGE_TRACKING_UNSUPPORTED_CODES.contains(&code.as_str()) || status == 501 {
                    return ProviderError::Unsupported(format!("{}: {}", code, message));
                }
                if code == "SyncStateNotFound" {
                    return ProviderError::CursorExpired(message);
                }
                return ProviderError::from_status(status, format!("{}: {}", code, message));
            }
        }
        if status == 501 {
            return ProviderError::Unsupported(body.to_string());
        }
        ProviderError::from_status(status, body)
    }

    /// GET an absolute URL with auth and retry.
    async fn get_url<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let token = self.bearer_token().await?;
        self.retry
            .execute(url, || async {
                let response = self
                    .client
                    .get(url)
                    .bearer_auth(&token)
                    .send()
                    .await
                    .map_err(|e| ProviderError::Connection(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Self::classify_error(status.as_u16(), &body));
                }
                response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Internal(format!("parse response: {}", e)))
            })
            .await
    }

    /// GET a path under the API base.
    async fn get<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        self.get_url(&url).await
    }

    /// Resolves folder ids to display names for normalization.
    async fn folder_names(&self) -> Result<std::collections::HashMap<String, String>> {
        let page: GraphFolderPage = self
            .get("/me/mailFolders?$top=100&$select=id,displayName")
            .await?;
        Ok(page
            .value
            .into_iter()
            .filter_map(|f| f.display_name.map(|name| (f.id, name)))
            .collect())
    }

    /// Converts a Graph wire message into a [`ParsedMessage`].
    ///
    /// `folder_names` maps parent folder ids to display names; an unknown
    /// id falls back to the inbox.
    fn parse_graph_message(
        msg: GraphMessage,
        folder_names: &std::collections::HashMap<String, String>,
    ) -> Result<ParsedMessage> {
        let to_address = |recipient: &GraphRecipient| -> Option<Address> {
            let email = recipient.email_address.as_ref()?;
            Some(Address {
                email: email.address.clone()?,
                name: email.name.clone(),
            })
        };

        let from = msg
            .from
            .as_ref()
            .and_then(to_address)
            .unwrap_or_else(|| Address::new("unknown@unknown"));
        let to = msg
            .to_recipients
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(to_address)
            .collect();
        let cc = msg
            .cc_recipients
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(to_address)
            .collect();
        let bcc = msg
            .bcc_recipients
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(to_address)
            .collect();

        let received_at = msg.received_date_time.unwrap_or_else(Utc::now);
        let sent_at = msg.sent_date_time.unwrap_or(received_at);

        let (body_text, body_html) = match &msg.body {
            Some(body) => {
                let content = body.content.clone();
                match body.content_type.as_deref() {
                    Some(t) if t.eq_ignore_ascii_case("html") => (None, content),
                    _ => (content, None),
                }
            }
            None => (None, None),
        };

        let snippet = msg
            .body_preview
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| body_text.as_deref().map(|t| truncate_snippet(t, 200)))
            .unwrap_or_default();

        let folder_name = msg
            .parent_folder_id
            .as_ref()
            .and_then(|id| folder_names.get(id))
            .cloned();
        let folder = match &folder_name {
            Some(name) => Folder::normalize(name),
            None => Folder::Inbox,
        };
        let labels = folder_name.into_iter().collect();

        let is_starred = msg
            .flag
            .as_ref()
            .and_then(|f| f.flag_status.as_deref())
            .map(|s| s.eq_ignore_ascii_case("flagged"))
            .unwrap_or(false);

        let attachments = msg
            .attachments
            .unwrap_or_default()
            .into_iter()
            .map(|a| ParsedAttachment {
                external_attachment_id: a.id,
                filename: a.name.unwrap_or_else(|| "attachment".to_string()),
                mime_type: a
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: a.size.unwrap_or(0),
                is_inline: a.is_inline.unwrap_or(false),
                content_id: a.content_id,
            })
            .collect();

        Ok(ParsedMessage {
            external_id: ExternalId(msg.id),
            from,
            to,
            cc,
            bcc,
            subject: msg.subject,
            snippet,
            body_text,
            body_html,
            labels,
            folder,
            is_read: msg.is_read.unwrap_or(false),
            is_starred,
            sent_at,
            received_at,
            size: None,
            attachments,
        })
    }

    /// Walks delta pages from `link` until a delta link closes the round
    /// or the page cap stops the walk.
    async fn fetch_delta(&self, link: &str) -> Result<(ChangeSet, Cursor)> {
        let folder_names = self.folder_names().await?;

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut next = link.to_string();
        let mut pages = 0usize;
        let mut truncated = false;
        let mut closing_link = None;

        loop {
            let page: GraphPage = self.get_url(&next).await?;

            for msg in page.value {
                if let Some(marker) = &msg.removed {
                    let permanent = marker.reason.as_deref() == Some("deleted");
                    removed.push(RemovedMessage {
                        external_id: ExternalId(msg.id),
                        permanent,
                    });
                    continue;
                }
                match Self::parse_graph_message(msg, &folder_names) {
                    Ok(parsed) => added.push(parsed),
                    Err(error) => {
                        tracing::warn!(connection_id = %self.connection_id, %error, "skipping malformed message");
                    }
                }
            }

            pages += 1;
            match (page.next_link, page.delta_link) {
                (_, Some(delta)) => {
                    closing_link = Some(delta);
                    break;
                }
                (Some(next_link), None) => {
                    if pages >= self.config.max_change_pages {
                        tracing::warn!(
                            connection_id = %self.connection_id,
                            pages,
                            cap = self.config.max_change_pages,
                            "delta page cap reached, deferring remainder to next run"
                        );
                        // Resume from the unconsumed nextLink next run.
                        closing_link = Some(next_link);
                        truncated = true;
                        break;
                    }
                    next = next_link;
                }
                (None, None) => break,
            }
        }

        let cursor = Cursor::DeltaLink {
            link: closing_link.unwrap_or_else(|| link.to_string()),
            mode: DeltaMode::Delta,
        };
        let change_set = ChangeSet {
            added,
            updated: Vec::new(),
            removed,
            truncated,
        };
        Ok((change_set, cursor))
    }

    /// Timestamp fallback: everything received after the watermark.
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<(ChangeSet, Cursor)> {
        let folder_names = self.folder_names().await?;
        let filter = format!(
            "receivedDateTime gt {}",
            since.format("%Y-%m-%dT%H:%M:%SZ")
        );
        let mut url = self.messages_url(&[
            ("$filter", filter.as_str()),
            ("$orderby", "receivedDateTime asc"),
            ("$top", &self.config.fetch_batch_size.to_string()),
            ("$expand", "attachments"),
        ])?;

        let mut added = Vec::new();
        let mut watermark = since;
        let mut pages = 0usize;
        let mut truncated = false;

        loop {
            let page: GraphPage = self.get_url(&url).await?;
            for msg in page.value {
                match Self::parse_graph_message(msg, &folder_names) {
                    Ok(parsed) => {
                        if parsed.received_at > watermark {
                            watermark = parsed.received_at;
                        }
                        added.push(parsed);
                    }
                    Err(error) => {
                        tracing::warn!(connection_id = %self.connection_id, %error, "skipping malformed message");
                    }
                }
            }

            pages += 1;
            match page.next_link {
                Some(next) if pages < self.config.max_change_pages => url = next,
                Some(_) => {
                    truncated = true;
                    break;
                }
                None => break,
            }
        }

        let change_set = ChangeSet {
            added,
            updated: Vec::new(),
            removed: Vec::new(),
            truncated,
        };
        Ok((change_set, Cursor::Timestamp { at: watermark }))
    }

    /// Builds a `/me/messages` URL with properly encoded OData parameters.
    fn messages_url(&self, params: &[(&str, &str)]) -> Result<String> {
        let mut url = Url::parse(&format!("{}/me/messages", self.base_url))
            .map_err(|e| ProviderError::Internal(format!("bad base url: {}", e)))?;
        url.query_pairs_mut().extend_pairs(params.iter().copied());
        Ok(url.to_string())
    }

    /// Starts a fresh delta round, used to establish the first cursor.
    async fn initial_delta_link(&self) -> Result<Cursor> {
        // $deltatoken=latest skips the initial full enumeration and hands
        // back a link positioned at "now".
        let url = format!("{}/me/messages/delta?$deltatoken=latest", self.base_url);
        let page: GraphPage = self.get_url(&url).await?;
        match page.delta_link.or(page.next_link) {
            Some(link) => Ok(Cursor::DeltaLink {
                link,
                mode: DeltaMode::Delta,
            }),
            None => Err(ProviderError::Internal(
                "delta bootstrap returned no link".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl MailAdapter for GraphAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn fetch_changes(&self, cursor: &Cursor) -> Result<(ChangeSet, Cursor)> {
        match cursor {
            Cursor::DeltaLink { link, mode } => match mode {
                DeltaMode::Delta => match self.fetch_delta(link).await {
                    Ok(result) => Ok(result),
                    // Unsupported-capability: downgrade permanently. The
                    // successor cursor is a timestamp positioned at "now"
                    // minus a bounded replay window; overlap dedups upstream.
                    Err(ProviderError::Unsupported(reason)) => {
                        tracing::warn!(
                            connection_id = %self.connection_id,
                            %reason,
                            "delta not supported, downgrading connection to timestamp mode"
                        );
                        self.fetch_since(Utc::now() - chrono::Duration::days(1)).await
                    }
                    // Anything else (including transient failures) leaves
                    // the cursor unchanged for the next run to retry delta.
                    Err(other) => Err(other),
                },
                DeltaMode::Timestamp => {
                    // Legacy cursor shape from before the downgrade carried
                    // its own timestamp; treat the link as unusable.
                    self.fetch_since(Utc::now() - chrono::Duration::days(1)).await
                }
            },
            Cursor::Timestamp { at } => self.fetch_since(*at).await,
            other => Err(ProviderError::Internal(format!(
                "graph adapter cannot resume from cursor {:?}",
                other
            ))),
        }
    }

    async fn fetch_full_window(
        &self,
        limit: usize,
    ) -> Result<(Vec<ParsedMessage>, Option<Cursor>)> {
        let folder_names = self.folder_names().await?;
        let mut url = self.messages_url(&[
            ("$orderby", "receivedDateTime desc"),
            (
                "$top",
                &self.config.fetch_batch_size.min(limit.max(1)).to_string(),
            ),
            ("$expand", "attachments"),
        ])?;

        let mut messages: Vec<ParsedMessage> = Vec::with_capacity(limit);
        loop {
            let page: GraphPage = self.get_url(&url).await?;
            for msg in page.value {
                if messages.len() >= limit {
                    break;
                }
                match Self::parse_graph_message(msg, &folder_names) {
                    Ok(parsed) => messages.push(parsed),
                    Err(error) => {
                        tracing::warn!(connection_id = %self.connection_id, %error, "skipping malformed message");
                    }
                }
            }
            match page.next_link {
                Some(next) if messages.len() < limit => url = next,
                _ => break,
            }
        }

        // Establish the delta cursor; when the account cannot do change
        // tracking, degrade to a timestamp cursor at the newest message.
        let cursor = match self.initial_delta_link().await {
            Ok(cursor) => Some(cursor),
            Err(ProviderError::Unsupported(reason)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    %reason,
                    "delta not supported, establishing timestamp cursor"
                );
                let newest = messages.iter().map(|m| m.received_at).max();
                newest.map(|at| Cursor::Timestamp { at })
            }
            Err(error) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    %error,
                    "could not establish delta cursor after full sync"
                );
                None
            }
        };

        Ok((messages, cursor))
    }

    async fn fetch_message(&self, external_id: &ExternalId) -> Result<Option<ParsedMessage>> {
        let endpoint = format!("/me/messages/{}?$expand=attachments", external_id);
        match self.get::<GraphMessage>(&endpoint).await {
            Ok(msg) => {
                let folder_names = self.folder_names().await?;
                Ok(Some(Self::parse_graph_message(msg, &folder_names)?))
            }
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn download_attachment(
        &self,
        external_message_id: &ExternalId,
        external_attachment_id: &str,
    ) -> Result<Option<Bytes>> {
        let url = format!(
            "{}/me/messages/{}/attachments/{}/$value",
            self.base_url, external_message_id, external_attachment_id
        );
        let token = self.bearer_token().await?;

        let result = self
            .retry
            .execute("download_attachment", || async {
                let response = self
                    .client
                    .get(&url)
                    .bearer_auth(&token)
                    .send()
                    .await
                    .map_err(|e| ProviderError::Connection(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Self::classify_error(status.as_u16(), &body));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| ProviderError::Connection(e.to_string()))
            })
            .await;

        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }
}
