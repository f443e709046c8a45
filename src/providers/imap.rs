//! IMAP adapter (UID-sequence change tracking).
//!
//! Implements [`MailAdapter`] over IMAP4rev1 via `async-imap` with a
//! rustls TLS stream, against a single selected mailbox (INBOX). Change
//! detection is a UID range fetch above the stored watermark; full sync
//! fetches the most recent N messages by sequence range, since a first
//! sync has no watermark to filter on. Raw RFC 5322 bodies are parsed with
//! `mail-parser`.

use std::sync::Arc;

use async_imap::types::{Fetch, Flag};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mail_parser::{MessageParser, MimeHeaders};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{
    truncate_snippet, ChangeSet, MailAdapter, ParsedAttachment, ParsedMessage, ProviderError,
    Result, RetryPolicy,
};
use crate::config::SyncConfig;
use crate::domain::{Address, ConnectionId, Cursor, ExternalId, Folder, ProviderKind};
use crate::external::{Credential, CredentialSource};

/// Fields requested on every fetch.
const FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE RFC822)";

type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// IMAP adapter bound to one mailbox of one connection.
pub struct ImapAdapter {
    connection_id: ConnectionId,
    credentials: Arc<dyn CredentialSource>,
    retry: RetryPolicy,
    config: SyncConfig,
    mailbox: String,
    session: Mutex<Option<ImapSession>>,
    /// EXISTS count from the most recent SELECT, for sequence-range math.
    last_exists: Mutex<u32>,
    /// UIDNEXT from the most recent SELECT, for empty-mailbox watermarks.
    last_uid_next: Mutex<Option<u32>>,
}

impl ImapAdapter {
    /// Creates an adapter for the given connection, synced against INBOX.
    pub fn new(
        connection_id: ConnectionId,
        credentials: Arc<dyn CredentialSource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            connection_id,
            credentials,
            retry: RetryPolicy::from_config(&config.retry),
            config,
            mailbox: "INBOX".to_string(),
            session: Mutex::new(None),
            last_exists: Mutex::new(0),
            last_uid_next: Mutex::new(None),
        }
    }

    /// Uses a different mailbox than INBOX.
    pub fn with_mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = mailbox.into();
        self
    }

    /// Establishes a TLS connection and logs in.
    async fn connect(&self) -> Result<ImapSession> {
        let credential = self
            .credentials
            .credential(&self.connection_id)
            .await
            .map_err(|e| ProviderError::Authentication(e.to_string()))?;
        let (username, password, host, port) = match credential {
            Credential::Login {
                username,
                password,
                host,
                port,
            } => (username, password, host, port),
            Credential::Bearer { .. } => {
                return Err(ProviderError::Authentication(
                    "imap connection requires a login credential".to_string(),
                ))
            }
        };

        let tcp_stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ProviderError::Connection(format!("TCP connect failed: {}", e)))?;

        let tls_config = ClientConfig::builder()
            .with_root_certificates(tokio_rustls::rustls::RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| ProviderError::Connection(format!("invalid server name: {}", e)))?;
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ProviderError::Connection(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let mut session = client
            .login(&username, &password)
            .await
            .map_err(|(e, _)| ProviderError::Authentication(format!("login failed: {}", e)))?;

        let mailbox = session
            .select(&self.mailbox)
            .await
            .map_err(|e| ProviderError::Connection(format!("select failed: {}", e)))?;
        *self.last_exists.lock().await = mailbox.exists;
        *self.last_uid_next.lock().await = mailbox.uid_next;

        tracing::debug!(
            connection_id = %self.connection_id,
            mailbox = %self.mailbox,
            exists = mailbox.exists,
            "imap session established"
        );
        Ok(session)
    }

    /// Runs `op` against a connected session, connecting on first use and
    /// reconnecting after a dropped session.
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'s> Fn(
            &'s mut ImapSession,
        )
            -> futures::future::BoxFuture<'s, Result<T>>,
    {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        // The unwrap cannot fire: the branch above just filled the slot.
        let session = guard.as_mut().unwrap();
        match op(session).await {
            Ok(value) => Ok(value),
            Err(error) => {
                // Drop the session on failure; the next call reconnects.
                *guard = None;
                Err(error)
            }
        }
    }

    /// UID-fetches a range and parses every message in it, through the
    /// retry executor like every other remote call.
    async fn fetch_range(&self, range: &str, by_uid: bool) -> Result<Vec<ParsedMessage>> {
        self.retry
            .execute("imap_fetch", || self.fetch_range_once(range, by_uid))
            .await
    }

    async fn fetch_range_once(&self, range: &str, by_uid: bool) -> Result<Vec<ParsedMessage>> {
        let mailbox = self.mailbox.clone();
        let range = range.to_string();
        self.with_session(move |session| {
            let mailbox = mailbox.clone();
            let range = range.clone();
            Box::pin(async move {
                let mut fetches: Vec<Fetch> = Vec::new();
                {
                    let stream = if by_uid {
                        session.uid_fetch(&range, FETCH_QUERY).await.map(|s| s.boxed())
                    } else {
                        session.fetch(&range, FETCH_QUERY).await.map(|s| s.boxed())
                    }
                    .map_err(|e| ProviderError::Connection(format!("fetch failed: {}", e)))?;
                    futures::pin_mut!(stream);
                    while let Some(item) = stream.next().await {
                        fetches.push(item.map_err(|e| {
                            ProviderError::Connection(format!("fetch stream failed: {}", e))
                        })?);
                    }
                }

                let mut messages = Vec::with_capacity(fetches.len());
                for fetch in &fetches {
                    match parse_imap_message(fetch, &mailbox) {
                        Ok(message) => messages.push(message),
                        Err(ProviderError::Malformed(reason)) => {
                            tracing::warn!(%reason, "skipping malformed message");
                        }
                        Err(other) => return Err(other),
                    }
                }
                Ok(messages)
            })
        })
        .await
    }
}

/// Parses IMAP flags into (read, starred).
fn parse_flags(fetch: &Fetch) -> (bool, bool) {
    let mut is_read = false;
    let mut is_starred = false;
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => is_read = true,
            Flag::Flagged => is_starred = true,
            _ => {}
        }
    }
    (is_read, is_starred)
}

/// Parses a mail_parser address to our Address type.
fn parse_mail_address(addr: &mail_parser::Addr) -> Address {
    Address {
        email: addr.address().unwrap_or_default().to_string(),
        name: addr.name().map(|s| s.to_string()),
    }
}

fn address_list(header: Option<&mail_parser::Address>) -> Vec<Address> {
    header
        .and_then(|a| a.as_list())
        .map(|list| list.iter().map(parse_mail_address).collect())
        .unwrap_or_default()
}

/// Converts one IMAP fetch into a [`ParsedMessage`].
///
/// The UID becomes the external id; attachment ids are part indices of
/// the parsed MIME tree, stable for a given raw message.
fn parse_imap_message(fetch: &Fetch, mailbox: &str) -> Result<ParsedMessage> {
    let uid = fetch
        .uid
        .ok_or_else(|| ProviderError::Malformed("fetch result without UID".to_string()))?;
    let body_data = fetch
        .body()
        .ok_or_else(|| ProviderError::Malformed(format!("uid {} has no body", uid)))?;
    let message = MessageParser::default()
        .parse(body_data)
        .ok_or_else(|| ProviderError::Malformed(format!("uid {} failed to parse", uid)))?;

    let (is_read, is_starred) = parse_flags(fetch);

    let from = address_list(message.from())
        .into_iter()
        .next()
        .unwrap_or_else(|| Address::new("unknown@unknown"));
    let to = address_list(message.to());
    let cc = address_list(message.cc());
    let bcc = address_list(message.bcc());

    let subject = message.subject().map(|s| s.to_string());
    let sent_at = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);
    let received_at = fetch
        .internal_date()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(sent_at);

    let body_text = message.body_text(0).map(|s| s.to_string());
    let body_html = message.body_html(0).map(|s| s.to_string());
    let snippet = body_text
        .as_deref()
        .map(|t| truncate_snippet(t, 200))
        .unwrap_or_default();

    let mut attachments = Vec::new();
    for (index, part) in message.attachments().enumerate() {
        let mime_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let content_id = part.content_id().map(|s| s.to_string());
        attachments.push(ParsedAttachment {
            external_attachment_id: format!("part-{}", index),
            filename: part
                .attachment_name()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("attachment-{}", index)),
            mime_type,
            size: part.contents().len() as u64,
            is_inline: content_id.is_some(),
            content_id,
        });
    }

    let labels = vec![mailbox.to_string()];
    let folder = Folder::normalize(mailbox);

    Ok(ParsedMessage {
        external_id: ExternalId::from(uid),
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
        size: Some(body_data.len() as u64),
        attachments,
    })
}

#[async_trait::async_trait]
impl MailAdapter for ImapAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn fetch_changes(&self, cursor: &Cursor) -> Result<(ChangeSet, Cursor)> {
        let watermark = match cursor {
            Cursor::UidWatermark { uid } => *uid,
            other => {
                return Err(ProviderError::Internal(format!(
                    "imap adapter cannot resume from cursor {:?}",
                    other
                )))
            }
        };

        // "{wm+1}:*" returns the highest-UID message even when nothing is
        // newer (RFC 3501 sequence-set quirk), so filter on the watermark.
        let range = format!("{}:*", watermark.saturating_add(1));
        let fetched = self.fetch_range(&range, true).await?;
        let added: Vec<ParsedMessage> = fetched
            .into_iter()
            .filter(|m| m.external_id.0.parse::<u32>().map(|uid| uid > watermark) == Ok(true))
            .collect();

        let new_watermark = added
            .iter()
            .filter_map(|m| m.external_id.0.parse::<u32>().ok())
            .max()
            .unwrap_or(watermark);

        let change_set = ChangeSet {
            added,
            updated: Vec::new(),
            removed: Vec::new(),
            truncated: false,
        };
        Ok((change_set, Cursor::UidWatermark { uid: new_watermark }))
    }

    async fn fetch_full_window(
        &self,
        limit: usize,
    ) -> Result<(Vec<ParsedMessage>, Option<Cursor>)> {
        // Connect first so EXISTS/UIDNEXT are fresh.
        self.with_session(|_session| Box::pin(async { Ok(()) })).await?;

        let exists = *self.last_exists.lock().await;
        if exists == 0 {
            let watermark = self
                .last_uid_next
                .lock()
                .await
                .map(|n| n.saturating_sub(1))
                .unwrap_or(0);
            return Ok((Vec::new(), Some(Cursor::UidWatermark { uid: watermark })));
        }

        // Most recent N by message sequence number; a first sync has no
        // UID watermark to filter on.
        let first = (exists as usize).saturating_sub(limit.saturating_sub(1)).max(1);
        let range = format!("{}:{}", first, exists);
        let mut messages = self.fetch_range(&range, false).await?;
        // Newest first, like the other adapters' window fetches.
        messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));

        let watermark = messages
            .iter()
            .filter_map(|m| m.external_id.0.parse::<u32>().ok())
            .max();
        let cursor = watermark.map(|uid| Cursor::UidWatermark { uid });

        Ok((messages, cursor))
    }

    async fn fetch_message(&self, external_id: &ExternalId) -> Result<Option<ParsedMessage>> {
        let uid: u32 = external_id
            .0
            .parse()
            .map_err(|_| ProviderError::Malformed(format!("bad imap uid: {}", external_id)))?;

        let fetched = self.fetch_range(&uid.to_string(), true).await?;
        Ok(fetched
            .into_iter()
            .find(|m| m.external_id == *external_id))
    }

    async fn download_attachment(
        &self,
        external_message_id: &ExternalId,
        external_attachment_id: &str,
    ) -> Result<Option<Bytes>> {
        let uid: u32 = external_message_id.0.parse().map_err(|_| {
            ProviderError::Malformed(format!("bad imap uid: {}", external_message_id))
        })?;
        let index: usize = match external_attachment_id.strip_prefix("part-") {
            Some(raw) => raw.parse().map_err(|_| {
                ProviderError::Malformed(format!("bad attachment id: {}", external_attachment_id))
            })?,
            None => {
                return Err(ProviderError::Malformed(format!(
                    "bad attachment id: {}",
                    external_attachment_id
                )))
            }
        };

        let range = uid.to_string();
        let bytes = self
            .with_session(move |session| {
                let range = range.clone();
                Box::pin(async move {
                    let mut raw: Option<Vec<u8>> = None;
                    {
                        let stream = session
                            .uid_fetch(&range, FETCH_QUERY)
                            .await
                            .map_err(|e| ProviderError::Connection(format!("fetch failed: {}", e)))?;
                        futures::pin_mut!(stream);
                        while let Some(item) = stream.next().await {
                            let fetch = item.map_err(|e| {
                                ProviderError::Connection(format!("fetch stream failed: {}", e))
                            })?;
                            if raw.is_none() {
                                raw = fetch.body().map(|b| b.to_vec());
                            }
                        }
                    }
                    Ok(raw)
                })
            })
            .await?;

        let Some(raw) = bytes else {
            return Ok(None);
        };
        let Some(message) = MessageParser::default().parse(&raw[..]) else {
            return Err(ProviderError::Malformed(format!(
                "uid {} failed to parse",
                uid
            )));
        };
        Ok(message
            .attachments()
            .nth(index)
            .map(|part| Bytes::from(part.contents().to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RAW_MESSAGE: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com\r\n\
Subject: Meeting notes\r\n\
Date: Tue, 14 Jan 2025 10:30:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Notes from today's meeting.\r\n";

    #[test]
    fn parse_raw_message_via_mail_parser() {
        let message = MessageParser::default().parse(RAW_MESSAGE).unwrap();
        let from = address_list(message.from());
        assert_eq!(from[0].email, "alice@example.com");
        assert_eq!(from[0].name.as_deref(), Some("Alice"));
        assert_eq!(message.subject(), Some("Meeting notes"));
        assert_eq!(
            message.body_text(0).as_deref(),
            Some("Notes from today's meeting.\r\n")
        );
    }

    #[test]
    fn imap_adapter_kind() {
        let adapter = ImapAdapter::new(
            ConnectionId::from("conn-1"),
            Arc::new(crate::external::StaticCredentials::new()),
            SyncConfig::default(),
        );
        assert_eq!(adapter.kind(), ProviderKind::Imap);
        assert_eq!(adapter.mailbox, "INBOX");
    }

    #[test]
    fn with_mailbox_overrides_target() {
        let adapter = ImapAdapter::new(
            ConnectionId::from("conn-1"),
            Arc::new(crate::external::StaticCredentials::new()),
            SyncConfig::default(),
        )
        .with_mailbox("Archive");
        assert_eq!(adapter.mailbox, "Archive");
    }
}
