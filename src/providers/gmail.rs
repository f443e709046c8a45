//! Gmail API adapter (history-cursor change tracking).
//!
//! Implements [`MailAdapter`] against the Gmail REST API v1:
//! - `users.messages.list` / `users.messages.get` for window fetches
//! - `users.history.list` for incremental sync via history ids
//! - `users.messages.attachments.get` for attachment bytes
//!
//! Change detection rides the monotonically increasing history id. A
//! changes walk is capped at a configurable page count; when the cap is
//! hit the adapter stops early and reports the set as truncated, leaving
//! the remainder for the next scheduled run. An expired start history id
//! (HTTP 404 from `history.list`) surfaces as
//! [`ProviderError::CursorExpired`] so the orchestrator can run a fresh
//! full-window sync.

use std::collections::HashSet;
use std::sync::Arc;

use base64::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;

use super::{
    parse_address_header, parse_address_list, truncate_snippet, ChangeSet, MailAdapter,
    ParsedAttachment, ParsedMessage, ProviderError, RemovedMessage, Result, RetryPolicy,
};
use crate::config::SyncConfig;
use crate::domain::{Address, ConnectionId, Cursor, ExternalId, Folder, ProviderKind};
use crate::external::{Credential, CredentialSource};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
}

/// Bare message reference from list/history responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: Option<GmailMessagePayload>,
    internal_date: Option<String>,
    size_estimate: Option<u64>,
}

/// Gmail message payload (headers and body parts).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessagePayload {
    headers: Option<Vec<GmailHeader>>,
    parts: Option<Vec<GmailPart>>,
    body: Option<GmailBody>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

/// Gmail message part (for multipart messages).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    filename: Option<String>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPart>>,
    headers: Option<Vec<GmailHeader>>,
}

/// Gmail message body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    data: Option<String>,
    size: Option<u64>,
    attachment_id: Option<String>,
}

/// Gmail history list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    history: Option<Vec<GmailHistory>>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

/// Gmail history record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistory {
    id: Option<String>,
    messages_added: Option<Vec<GmailHistoryMessage>>,
    messages_deleted: Option<Vec<GmailHistoryMessage>>,
    labels_added: Option<Vec<GmailHistoryLabelChange>>,
    labels_removed: Option<Vec<GmailHistoryLabelChange>>,
}

/// Gmail history message wrapper.
#[derive(Debug, Deserialize)]
struct GmailHistoryMessage {
    message: MessageRef,
}

/// Gmail history label change.
#[derive(Debug, Deserialize)]
struct GmailHistoryLabelChange {
    message: MessageRef,
}

/// Gmail profile response, source of the current history id.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    history_id: Option<String>,
}

/// Gmail attachment body response.
#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    data: Option<String>,
}

/// Gmail API adapter.
pub struct GmailAdapter {
    connection_id: ConnectionId,
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    retry: RetryPolicy,
    config: SyncConfig,
}

impl GmailAdapter {
    /// Creates an adapter for the given connection.
    pub fn new(
        connection_id: ConnectionId,
        credentials: Arc<dyn CredentialSource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            connection_id,
            client: reqwest::Client::new(),
            base_url: GMAIL_API_BASE.to_string(),
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

    /// Fetches the current bearer token from the credential source.
    async fn bearer_token(&self) -> Result<String> {
        let credential = self
            .credentials
            .credential(&self.connection_id)
            .await
            .map_err(|e| ProviderError::Authentication(e.to_string()))?;
        match credential {
            Credential::Bearer { token } => Ok(token),
            Credential::Login { .. } => Err(ProviderError::Authentication(
                "gmail connection requires an OAuth bearer credential".to_string(),
            )),
        }
    }

    /// Makes an authenticated GET request, with retry on transient errors.
    async fn get<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, endpoint);
        let token = self.bearer_token().await?;

        self.retry
            .execute(endpoint, || async {
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
                    return Err(ProviderError::from_status(status.as_u16(), body));
                }
                response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Internal(format!("parse response: {}", e)))
            })
            .await
    }

    /// Fetches the mailbox's current history id.
    async fn current_history_id(&self) -> Result<Option<String>> {
        let profile: ProfileResponse = self.get("/profile").await?;
        Ok(profile.history_id)
    }

    /// Fetches a page of message ids for the full-window walk.
    async fn list_message_ids(
        &self,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<(Vec<ExternalId>, Option<String>)> {
        let mut endpoint = format!("/messages?maxResults={}", page_size);
        if let Some(token) = page_token {
            endpoint.push_str(&format!("&pageToken={}", token));
        }
        let response: MessageListResponse = self.get(&endpoint).await?;
        let ids = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|m| ExternalId(m.id))
            .collect();
        Ok((ids, response.next_page_token))
    }

    /// Fetches full messages for a set of ids with bounded parallelism.
    ///
    /// A 404 on a single id is skipped (the message vanished between list
    /// and get); a malformed message is logged and skipped without
    /// aborting the batch.
    async fn fetch_messages(&self, ids: &[ExternalId]) -> Result<Vec<ParsedMessage>> {
        let results: Vec<Result<Option<ParsedMessage>>> = stream::iter(ids.iter().cloned())
            .map(|id| async move { self.fetch_message(&id).await })
            .buffer_unordered(self.config.fetch_concurrency)
            .collect()
            .await;

        let mut messages = Vec::with_capacity(ids.len());
        for result in results {
            match result {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(ProviderError::Malformed(reason)) => {
                    tracing::warn!(connection_id = %self.connection_id, %reason, "skipping malformed message");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(messages)
    }

    /// Collects attachment references from the payload part tree.
    fn collect_attachments(parts: &[GmailPart], out: &mut Vec<ParsedAttachment>) {
        for part in parts {
            let filename = part.filename.as_deref().unwrap_or("");
            let attachment_id = part.body.as_ref().and_then(|b| b.attachment_id.as_deref());
            if let (false, Some(attachment_id)) = (filename.is_empty(), attachment_id) {
                let content_id = part.headers.as_ref().and_then(|headers| {
                    headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("Content-ID"))
                        .map(|h| h.value.trim_matches(['<', '>']).to_string())
                });
                out.push(ParsedAttachment {
                    external_attachment_id: attachment_id.to_string(),
                    filename: filename.to_string(),
                    mime_type: part
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size: part.body.as_ref().and_then(|b| b.size).unwrap_or(0),
                    is_inline: content_id.is_some(),
                    content_id,
                });
            }
            if let Some(nested) = &part.parts {
                Self::collect_attachments(nested, out);
            }
        }
    }

    /// Extracts text and HTML bodies from the payload.
    fn extract_body(payload: &GmailMessagePayload) -> (Option<String>, Option<String>) {
        let mut text = None;
        let mut html = None;

        if let Some(body) = &payload.body {
            if let Some(data) = &body.data {
                if let Ok(decoded) = BASE64_URL_SAFE_NO_PAD.decode(data) {
                    if let Ok(s) = String::from_utf8(decoded) {
                        text = Some(s);
                    }
                }
            }
        }
        if let Some(parts) = &payload.parts {
            Self::extract_body_from_parts(parts, &mut text, &mut html);
        }
        (text, html)
    }

    fn extract_body_from_parts(
        parts: &[GmailPart],
        text: &mut Option<String>,
        html: &mut Option<String>,
    ) {
        for part in parts {
            let mime = part.mime_type.as_deref().unwrap_or("");
            let decoded = part
                .body
                .as_ref()
                .and_then(|b| b.data.as_ref())
                .and_then(|data| BASE64_URL_SAFE_NO_PAD.decode(data).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());

            if mime == "text/plain" && text.is_none() {
                *text = decoded;
            } else if mime == "text/html" && html.is_none() {
                *html = decoded;
            }

            if let Some(nested) = &part.parts {
                Self::extract_body_from_parts(nested, text, html);
            }
        }
    }

    /// Converts a Gmail wire message into a [`ParsedMessage`].
    fn parse_gmail_message(msg: GmailMessage) -> Result<ParsedMessage> {
        let payload = msg
            .payload
            .as_ref()
            .ok_or_else(|| ProviderError::Malformed(format!("message {} has no payload", msg.id)))?;
        let headers = payload.headers.as_deref().unwrap_or_default();

        let get_header = |name: &str| -> Option<&str> {
            headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        };

        let from = get_header("From")
            .map(parse_address_header)
            .unwrap_or_else(|| Address::new("unknown@unknown"));
        let to = get_header("To").map(parse_address_list).unwrap_or_default();
        let cc = get_header("Cc").map(parse_address_list).unwrap_or_default();
        let bcc = get_header("Bcc").map(parse_address_list).unwrap_or_default();
        let subject = get_header("Subject").map(|s| s.to_string());

        let received_at = msg
            .internal_date
            .as_ref()
            .and_then(|d| d.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        let sent_at = get_header("Date")
            .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(received_at);

        let labels = msg.label_ids.unwrap_or_default();
        let is_read = !labels.iter().any(|l| l == "UNREAD");
        let is_starred = labels.iter().any(|l| l == "STARRED");
        let folder = Folder::from_labels(&labels);

        let (body_text, body_html) = Self::extract_body(payload);
        let snippet = match msg.snippet {
            Some(s) if !s.is_empty() => s,
            _ => body_text
                .as_deref()
                .map(|t| truncate_snippet(t, 200))
                .unwrap_or_default(),
        };

        let mut attachments = Vec::new();
        if let Some(parts) = &payload.parts {
            Self::collect_attachments(parts, &mut attachments);
        }

        Ok(ParsedMessage {
            external_id: ExternalId(msg.id),
            from,
            to,
            cc,
            bcc,
            subject,
            snippet,
            body_text,
            body_html,
            labels,
            folder,
            is_read,
            is_starred,
            sent_at,
            received_at,
            size: msg.size_estimate,
            attachments,
        })
    }
}

#[async_trait::async_trait]
impl MailAdapter for GmailAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn fetch_changes(&self, cursor: &Cursor) -> Result<(ChangeSet, Cursor)> {
        let start_history_id = match cursor {
            Cursor::HistoryId { value } => value.clone(),
            other => {
                return Err(ProviderError::Internal(format!(
                    "gmail adapter cannot resume from cursor {:?}",
                    other
                )))
            }
        };

        let mut added_ids: Vec<ExternalId> = Vec::new();
        let mut removed: Vec<RemovedMessage> = Vec::new();
        let mut relabeled_ids: Vec<ExternalId> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut latest_history_id = start_history_id.clone();
        let mut last_record_id: Option<u64> = None;
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        let mut truncated = false;

        loop {
            let mut endpoint = format!(
                "/history?startHistoryId={}&historyTypes=messageAdded,messageDeleted,labelAdded,labelRemoved",
                start_history_id
            );
            if let Some(token) = &page_token {
                endpoint.push_str(&format!("&pageToken={}", token));
            }

            let response: HistoryListResponse = match self.get(&endpoint).await {
                Ok(response) => response,
                // Gmail answers 404 when the start history id has aged out;
                // the stored cursor is unusable and a full resync is needed.
                Err(ProviderError::NotFound(reason)) => {
                    return Err(ProviderError::CursorExpired(reason))
                }
                Err(other) => return Err(other),
            };

            if let Some(history_id) = response.history_id {
                latest_history_id = history_id;
            }

            for record in response.history.unwrap_or_default() {
                if let Some(id) = record.id.as_ref().and_then(|s| s.parse::<u64>().ok()) {
                    last_record_id = Some(last_record_id.map_or(id, |current| current.max(id)));
                }
                for item in record.messages_added.unwrap_or_default() {
                    if seen.insert(item.message.id.clone()) {
                        added_ids.push(ExternalId(item.message.id));
                    }
                }
                for item in record.messages_deleted.unwrap_or_default() {
                    // messagesDeleted means the message left the mailbox for
                    // good; trash moves arrive as labelsAdded TRASH instead.
                    removed.push(RemovedMessage {
                        external_id: ExternalId(item.message.id),
                        permanent: true,
                    });
                }
                for item in record
                    .labels_added
                    .unwrap_or_default()
                    .into_iter()
                    .chain(record.labels_removed.unwrap_or_default())
                {
                    if seen.insert(item.message.id.clone()) {
                        relabeled_ids.push(ExternalId(item.message.id));
                    }
                }
            }

            pages += 1;
            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
            if pages >= self.config.max_change_pages {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    pages,
                    cap = self.config.max_change_pages,
                    "history page cap reached, deferring remainder to next run"
                );
                truncated = true;
                break;
            }
        }

        // Added ids are batch-fetched; relabeled ids are fetched one by one
        // and ids that turn out to be gone flow into the removal path.
        let added = self.fetch_messages(&added_ids).await?;

        let mut updated = Vec::with_capacity(relabeled_ids.len());
        for id in relabeled_ids {
            match self.fetch_message(&id).await? {
                Some(message) => updated.push(message),
                None => removed.push(RemovedMessage {
                    external_id: id,
                    permanent: false,
                }),
            }
        }

        // The response's top-level history id is the mailbox's current one.
        // When the page cap truncated the walk, committing it would skip
        // the deferred remainder, so the cursor stops at the last record
        // actually processed; overlap on the next run dedups via upsert.
        let next_history_id = if truncated {
            last_record_id
                .map(|id| id.to_string())
                .unwrap_or(start_history_id)
        } else {
            latest_history_id
        };

        let change_set = ChangeSet {
            added,
            updated,
            removed,
            truncated,
        };
        Ok((
            change_set,
            Cursor::HistoryId {
                value: next_history_id,
            },
        ))
    }

    async fn fetch_full_window(
        &self,
        limit: usize,
    ) -> Result<(Vec<ParsedMessage>, Option<Cursor>)> {
        let mut ids: Vec<ExternalId> = Vec::with_capacity(limit);
        let mut page_token: Option<String> = None;

        // messages.list returns newest first; walk pages until the cap.
        while ids.len() < limit {
            let page_size = (limit - ids.len()).min(self.config.fetch_batch_size);
            let (page_ids, next) = self.list_message_ids(page_size, page_token.as_deref()).await?;
            let empty = page_ids.is_empty();
            ids.extend(page_ids);
            page_token = next;
            if page_token.is_none() || empty {
                break;
            }
        }
        ids.truncate(limit);

        let messages = self.fetch_messages(&ids).await?;

        // Establish the incremental cursor from the profile; a failure here
        // degrades to timestamp mode upstream instead of failing the run.
        let cursor = match self.current_history_id().await {
            Ok(Some(history_id)) => Some(Cursor::HistoryId { value: history_id }),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    %error,
                    "could not establish history cursor after full sync"
                );
                None
            }
        };

        Ok((messages, cursor))
    }

    async fn fetch_message(&self, external_id: &ExternalId) -> Result<Option<ParsedMessage>> {
        let endpoint = format!("/messages/{}?format=full", external_id);
        match self.get::<GmailMessage>(&endpoint).await {
            Ok(msg) => Ok(Some(Self::parse_gmail_message(msg)?)),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn download_attachment(
        &self,
        external_message_id: &ExternalId,
        external_attachment_id: &str,
    ) -> Result<Option<Bytes>> {
        let endpoint = format!(
            "/messages/{}/attachments/{}",
            external_message_id, external_attachment_id
        );
        let response = match self.get::<AttachmentResponse>(&endpoint).await {
            Ok(response) => response,
            Err(ProviderError::NotFound(_)) => return Ok(None),
            Err(other) => return Err(other),
        };

        match response.data {
            Some(data) => {
                let decoded = BASE64_URL_SAFE_NO_PAD
                    .decode(&data)
                    .map_err(|e| ProviderError::Internal(format!("decode attachment: {}", e)))?;
                Ok(Some(Bytes::from(decoded)))
            }
            None => Ok(None),
        }
    }
}
