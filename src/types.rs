//! Core types for the sync layer.

use crate::error::{Result, SyncError};
use crate::remote::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn plus_millis(self, millis: u64) -> Self {
        Timestamp(self.0.saturating_add(millis as i64))
    }

    pub fn millis_since(self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a thread (the remote document id).
    ThreadId
);
string_id!(
    /// Identifier of a user.
    UserId
);
string_id!(
    /// Identifier of a message, unique within its thread.
    MessageId
);

/// Group metadata for multi-party threads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Preview of the most recent message in a thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    #[serde(default)]
    pub text: String,
    pub author_id: UserId,
    pub created_at: Timestamp,
}

/// A conversation as seen by the outer watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thread {
    pub id: ThreadId,
    /// Ordered participant list.
    pub participants: Vec<UserId>,
    pub group: Option<GroupInfo>,
    pub last_message: Option<MessagePreview>,
    pub last_activity: Timestamp,
    /// Hidden threads are logically removed from every view.
    pub hidden: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadDoc {
    #[serde(default)]
    participants: Vec<UserId>,
    #[serde(default)]
    group: Option<GroupInfo>,
    #[serde(default)]
    last_message: Option<MessagePreview>,
    #[serde(default)]
    last_activity_at: Timestamp,
    #[serde(default)]
    hidden: bool,
}

impl Thread {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let raw: ThreadDoc = doc.decode()?;
        Ok(Self {
            id: ThreadId::new(doc.id()),
            participants: raw.participants,
            group: raw.group,
            last_message: raw.last_message,
            last_activity: raw.last_activity_at,
            hidden: raw.hidden,
        })
    }

    /// The first participant that is not `user`, for one-to-one threads.
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        self.participants.iter().find(|p| *p != user)
    }
}

/// Per-(thread, user) marker of the last-seen point in a message stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadCursor {
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub last_read_at: Timestamp,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorDoc {
    last_read_at: Timestamp,
}

impl ReadCursor {
    /// Decode a cursor document. The identity comes from the path layout, so
    /// only `lastReadAt` is read from the payload.
    pub fn from_document(thread_id: &ThreadId, user_id: &UserId, doc: &Document) -> Result<Self> {
        let raw: CursorDoc = doc.decode()?;
        Ok(Self {
            thread_id: thread_id.clone(),
            user_id: user_id.clone(),
            last_read_at: raw.last_read_at,
        })
    }

    /// Merge-style patch written by "mark read".
    pub fn to_patch(&self) -> serde_json::Value {
        serde_json::json!({
            "threadId": self.thread_id,
            "userId": self.user_id,
            "lastReadAt": self.last_read_at,
        })
    }
}

/// An immutable message in a thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub author_id: UserId,
    pub created_at: Timestamp,
    pub text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDoc {
    author_id: UserId,
    created_at: Timestamp,
    #[serde(default)]
    text: Option<String>,
}

impl Message {
    pub fn from_document(thread_id: &ThreadId, doc: &Document) -> Result<Self> {
        let raw: MessageDoc = doc.decode()?;
        Ok(Self {
            id: MessageId::new(doc.id()),
            thread_id: thread_id.clone(),
            author_id: raw.author_id,
            created_at: raw.created_at,
            text: raw.text,
        })
    }
}

/// Display fields resolved for a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn from_document(doc: &Document) -> Result<Self> {
        doc.decode()
    }

    /// Fallback identity shown while a profile is missing or failed to load.
    pub fn placeholder(user_id: &UserId) -> Self {
        Self {
            display_name: user_id.to_string(),
            avatar_url: None,
        }
    }
}

/// How a cached profile is kept up to date.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileSource {
    /// Pushed by a live document watch.
    Live,
    /// Pulled by a one-shot (batched or polled) fetch.
    OneShot,
}

/// A cached profile with its freshness window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileCacheEntry {
    pub user_id: UserId,
    pub profile: Profile,
    pub fetched_at: Timestamp,
    pub expires_at: Timestamp,
    pub source: ProfileSource,
}

impl ProfileCacheEntry {
    pub fn is_fresh(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// Display fields attached to an unread entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrichedDisplay {
    pub title: String,
    pub avatar_url: Option<String>,
    pub preview: Option<String>,
    /// True while the title/avatar come from a fallback identity.
    pub placeholder: bool,
}

/// Derived per-thread unread state. Never stored remotely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnreadEntry {
    pub thread_id: ThreadId,
    pub unread_count: usize,
    pub last_activity: Timestamp,
    pub display: EnrichedDisplay,
}

/// Event delivered to presentation-layer subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewEvent<T> {
    /// A complete, consistent replacement of the view.
    Updated(Vec<T>),
    /// The view's root subscription failed; no further updates follow.
    Failed(SyncError),
}
