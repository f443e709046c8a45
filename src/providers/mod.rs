//! Provider adapters.
//!
//! One [`MailAdapter`] implementation per remote protocol family:
//!
//! - [`GmailAdapter`]: Gmail REST API, history-cursor change tracking
//! - [`GraphAdapter`]: Microsoft Graph, delta-link change tracking with a
//!   timestamp fallback
//! - [`ImapAdapter`]: IMAP4rev1, UID-watermark change detection
//!
//! Adapters are independent structs composed by the sync orchestrator via
//! dependency injection; shared behavior lives in the [`RetryPolicy`]
//! executor and the free helpers below, not in a base type.

mod gmail;
mod graph;
mod imap;
mod retry;
mod traits;

pub use gmail::GmailAdapter;
pub use graph::GraphAdapter;
pub use imap::ImapAdapter;
pub use retry::RetryPolicy;
pub use traits::{
    ChangeSet, MailAdapter, ParsedAttachment, ParsedMessage, ProviderError, RemovedMessage,
    Result,
};

use crate::domain::Address;

/// Parses an address from a header value like `Name <email@example.com>`.
pub(crate) fn parse_address_header(value: &str) -> Address {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            let email = value[start + 1..end].trim().to_string();
            let name = value[..start].trim().trim_matches('"').to_string();
            return Address {
                email,
                name: if name.is_empty() { None } else { Some(name) },
            };
        }
    }
    Address {
        email: value.to_string(),
        name: None,
    }
}

/// Parses a comma-separated recipient header into addresses.
pub(crate) fn parse_address_list(value: &str) -> Vec<Address> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_address_header)
        .collect()
}

/// Truncates body text to a snippet of at most `max_chars` characters.
pub(crate) fn truncate_snippet(text: &str, max_chars: usize) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}
