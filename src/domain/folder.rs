//! Canonical folder vocabulary and provider-name normalization.
//!
//! Providers name the same mailbox locations differently ("Sent Items",
//! "Posta inviata", `CATEGORY_PROMOTIONS`), and localized accounts translate
//! them. [`Folder::normalize`] maps any provider-native folder or label
//! identifier onto the canonical vocabulary used everywhere else in the
//! engine; [`Folder::from_labels`] resolves a full label set (Gmail attaches
//! several at once) into a single location.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical mailbox location, independent of provider-native naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Folder {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Important,
    /// Gmail category tab: social networks.
    Social,
    /// Gmail category tab: promotions/marketing.
    Promotions,
    /// Gmail category tab: receipts, bills, statements.
    Updates,
    /// Gmail category tab: mailing lists, forums.
    Forums,
    /// Outbound queue (Graph/IMAP servers expose this).
    Outbox,
    /// Unrecognized provider folder, carried through upper-cased.
    #[serde(untagged)]
    Other(String),
}

/// Synonym table: lower-cased provider name → canonical folder.
///
/// Covers English, Italian, and German provider/server localizations plus
/// the Gmail label ids and Graph well-known folder display names seen in
/// the wild. Matching is case-insensitive.
const SYNONYMS: &[(&str, Folder)] = &[
    // Inbox
    ("inbox", Folder::Inbox),
    ("posta in arrivo", Folder::Inbox),
    ("posteingang", Folder::Inbox),
    // Sent
    ("sent", Folder::Sent),
    ("sent items", Folder::Sent),
    ("sent mail", Folder::Sent),
    ("sentitems", Folder::Sent),
    ("posta inviata", Folder::Sent),
    ("inviata", Folder::Sent),
    ("gesendet", Folder::Sent),
    ("gesendete elemente", Folder::Sent),
    // Drafts
    ("draft", Folder::Drafts),
    ("drafts", Folder::Drafts),
    ("bozze", Folder::Drafts),
    ("entwürfe", Folder::Drafts),
    ("entwuerfe", Folder::Drafts),
    // Trash
    ("trash", Folder::Trash),
    ("deleted", Folder::Trash),
    ("deleted items", Folder::Trash),
    ("deleteditems", Folder::Trash),
    ("bin", Folder::Trash),
    ("cestino", Folder::Trash),
    ("posta eliminata", Folder::Trash),
    ("papierkorb", Folder::Trash),
    ("gelöschte elemente", Folder::Trash),
    ("geloeschte elemente", Folder::Trash),
    // Spam
    ("spam", Folder::Spam),
    ("junk", Folder::Spam),
    ("junk email", Folder::Spam),
    ("junkemail", Folder::Spam),
    ("posta indesiderata", Folder::Spam),
    ("junk-e-mail", Folder::Spam),
    // Archive
    ("archive", Folder::Archive),
    ("all mail", Folder::Archive),
    ("archivio", Folder::Archive),
    ("archiv", Folder::Archive),
    // Important
    ("important", Folder::Important),
    ("importante", Folder::Important),
    ("wichtig", Folder::Important),
    // Gmail category labels
    ("category_social", Folder::Social),
    ("category_promotions", Folder::Promotions),
    ("category_updates", Folder::Updates),
    ("category_forums", Folder::Forums),
    // Outbox
    ("outbox", Folder::Outbox),
    ("posta in uscita", Folder::Outbox),
    ("postausgang", Folder::Outbox),
];

impl Folder {
    /// Normalizes a provider-native folder or label identifier.
    ///
    /// Matching is case-insensitive across the English/Italian/German
    /// synonym table. An unrecognized name falls back to
    /// [`Folder::Other`] with the raw name upper-cased.
    pub fn normalize(raw: &str) -> Folder {
        let needle = raw.trim().to_lowercase();
        for (synonym, folder) in SYNONYMS {
            if *synonym == needle {
                return folder.clone();
            }
        }
        Folder::Other(raw.trim().to_uppercase())
    }

    /// Resolves a provider label set into a single canonical location.
    ///
    /// Label-based providers attach several signals simultaneously (a
    /// promotional message carries both `INBOX` and `CATEGORY_PROMOTIONS`),
    /// so resolution is by priority: trash > spam > sent > drafts >
    /// category labels > inbox > first recognizable label > fallback.
    pub fn from_labels(labels: &[String]) -> Folder {
        let normalized: Vec<Folder> = labels.iter().map(|l| Folder::normalize(l)).collect();

        for wanted in [Folder::Trash, Folder::Spam, Folder::Sent, Folder::Drafts] {
            if normalized.contains(&wanted) {
                return wanted;
            }
        }
        for wanted in [
            Folder::Social,
            Folder::Promotions,
            Folder::Updates,
            Folder::Forums,
        ] {
            if normalized.contains(&wanted) {
                return wanted;
            }
        }
        if normalized.contains(&Folder::Inbox) {
            return Folder::Inbox;
        }
        if normalized.contains(&Folder::Archive) {
            return Folder::Archive;
        }
        if normalized.contains(&Folder::Important) {
            return Folder::Important;
        }
        // No meaningful location signal; flag-style labels (STARRED, UNREAD)
        // land here. Default to inbox rather than inventing a folder.
        normalized
            .into_iter()
            .find(|f| !matches!(f, Folder::Other(_)))
            .unwrap_or(Folder::Inbox)
    }

    /// Canonical string form, used for storage and job payloads.
    pub fn as_str(&self) -> &str {
        match self {
            Folder::Inbox => "INBOX",
            Folder::Sent => "SENT",
            Folder::Drafts => "DRAFTS",
            Folder::Trash => "TRASH",
            Folder::Spam => "SPAM",
            Folder::Archive => "ARCHIVE",
            Folder::Important => "IMPORTANT",
            Folder::Social => "SOCIAL",
            Folder::Promotions => "PROMOTIONS",
            Folder::Updates => "UPDATES",
            Folder::Forums => "FORUMS",
            Folder::Outbox => "OUTBOX",
            Folder::Other(name) => name,
        }
    }

    /// Parses the canonical string form back into a folder.
    pub fn from_canonical(s: &str) -> Folder {
        match s {
            "INBOX" => Folder::Inbox,
            "SENT" => Folder::Sent,
            "DRAFTS" => Folder::Drafts,
            "TRASH" => Folder::Trash,
            "SPAM" => Folder::Spam,
            "ARCHIVE" => Folder::Archive,
            "IMPORTANT" => Folder::Important,
            "SOCIAL" => Folder::Social,
            "PROMOTIONS" => Folder::Promotions,
            "UPDATES" => Folder::Updates,
            "FORUMS" => Folder::Forums,
            "OUTBOX" => Folder::Outbox,
            other => Folder::Other(other.to_string()),
        }
    }

    /// Whether this location counts as trashed for deletion handling.
    pub fn is_trash(&self) -> bool {
        matches!(self, Folder::Trash)
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
