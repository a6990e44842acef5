use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub mod apple_time;
pub mod dialect;
pub mod distributor;
pub mod guid;
pub mod identifier;
pub mod report;

pub use apple_time::{native_to_time, now_to_native, NativeTimestamp};
pub use dialect::{resolve_dialect, Dialect, DialectDiff, DialectRegistry};
pub use distributor::{
    generate_timestamps, BehaviorProfiles, DistributorConfig, TemporalDistributor,
};
pub use guid::{new_guid, GuidFamily, GuidKind};
pub use identifier::{normalize_identifier, NormalizedIdentifier};
pub use report::{Severity, ValidationReport, Violation, ViolationKind};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FoundryError {
    #[error("invalid identifier `{value}`: {reason}")]
    InvalidIdentifier { value: String, reason: String },
    #[error("invalid thread kind: {kind} thread cannot have {participants} participant(s)")]
    InvalidThreadKind { kind: ThreadKind, participants: usize },
    #[error("{kind} thread requires at least one participant")]
    EmptyParticipants { kind: ThreadKind },
    #[error("unknown thread reference: {0}")]
    UnknownThread(String),
    #[error("unknown message reference: {0}")]
    UnknownMessage(String),
    #[error("unknown contact reference: {0}")]
    UnknownContact(String),
    #[error("contact {contact} is not a participant of thread {thread}")]
    SenderNotParticipant { contact: String, thread: String },
    #[error("duplicate {entity} guid: {guid}")]
    DuplicateGuid { entity: String, guid: String },
    #[error("unknown dialect: {0}")]
    UnknownDialect(String),
    #[error("invalid time window: {0}")]
    InvalidWindow(String),
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(String),
    #[error("durable i/o failure during {operation} after {attempts} attempt(s): {detail}")]
    DurableIo { operation: String, attempts: u32, detail: String },
    #[error("integrity violation during {operation}: {detail}")]
    IntegrityViolation { operation: String, detail: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl FoundryError {
    /// Whether retrying the failed operation could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DurableIo { .. })
    }
}

/// Identity of one open builder session. Refs minted by one session are
/// rejected by every other session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

macro_rules! entity_ref {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name {
            session: SessionId,
            rowid: i64,
        }

        impl $name {
            #[must_use]
            pub fn new(session: SessionId, rowid: i64) -> Self {
                Self { session, rowid }
            }

            #[must_use]
            pub fn session(self) -> SessionId {
                self.session
            }

            /// `ROWID` of the backing row in the artifact.
            #[must_use]
            pub fn rowid(self) -> i64 {
                self.rowid
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}:{}#{}", $label, self.session, self.rowid)
            }
        }
    };
}

entity_ref!(ContactRef, "contact");
entity_ref!(ThreadRef, "thread");
entity_ref!(MessageRef, "message");
entity_ref!(AttachmentRef, "attachment");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Direct,
    Group,
}

impl ThreadKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    /// Value of the `chat.style` column.
    #[must_use]
    pub fn chat_style(self) -> i64 {
        match self {
            Self::Direct => 43,
            Self::Group => 45,
        }
    }

    #[must_use]
    pub fn from_chat_style(style: i64) -> Option<Self> {
        match style {
            43 => Some(Self::Direct),
            45 => Some(Self::Group),
            _ => None,
        }
    }

    /// Checks the non-self participant count against the kind.
    ///
    /// # Errors
    /// Returns [`FoundryError::EmptyParticipants`] for zero participants and
    /// [`FoundryError::InvalidThreadKind`] when the count does not fit the kind.
    pub fn check_participants(self, participants: usize) -> Result<(), FoundryError> {
        if participants == 0 {
            return Err(FoundryError::EmptyParticipants { kind: self });
        }
        let fits = match self {
            Self::Direct => participants == 1,
            Self::Group => participants >= 2,
        };
        if fits {
            Ok(())
        } else {
            Err(FoundryError::InvalidThreadKind { kind: self, participants })
        }
    }
}

impl Display for ThreadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum Service {
    #[default]
    #[serde(rename = "iMessage")]
    IMessage,
    #[serde(rename = "SMS")]
    Sms,
}

impl Service {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IMessage => "iMessage",
            Self::Sms => "SMS",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "iMessage" => Some(Self::IMessage),
            "SMS" => Some(Self::Sms),
            _ => None,
        }
    }

    #[must_use]
    pub fn parse_lenient(value: &str, default: Self) -> Self {
        parse_lenient(value, &[("imessage", Self::IMessage), ("sms", Self::Sms)], default)
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typical reply latency of one participant. Only scales gap sampling in the
/// distributor; never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    #[serde(alias = "instantaneous")]
    Instant,
    #[default]
    Minutes,
    Hours,
    Days,
}

impl LatencyClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "instant" | "instantaneous" => Some(Self::Instant),
            "minutes" => Some(Self::Minutes),
            "hours" => Some(Self::Hours),
            "days" => Some(Self::Days),
            _ => None,
        }
    }

    /// Accepts loose spellings such as `"Hours (slow replier)"`.
    #[must_use]
    pub fn parse_lenient(value: &str, default: Self) -> Self {
        parse_lenient(
            value,
            &[
                ("instant", Self::Instant),
                ("minutes", Self::Minutes),
                ("hours", Self::Hours),
                ("days", Self::Days),
            ],
            default,
        )
    }

    /// Inclusive reply-gap bounds in seconds.
    #[must_use]
    pub fn gap_bounds_seconds(self) -> (u32, u32) {
        match self {
            Self::Instant => (5, 60),
            Self::Minutes => (60, 600),
            Self::Hours => (1_800, 14_400),
            Self::Days => (43_200, 172_800),
        }
    }
}

impl Display for LatencyClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact match first, then prefix, then substring, all case-insensitive.
fn parse_lenient<T: Copy>(value: &str, variants: &[(&str, T)], default: T) -> T {
    let needle = value.trim().to_lowercase();
    if needle.is_empty() {
        return default;
    }
    if let Some((_, variant)) = variants.iter().find(|(name, _)| *name == needle) {
        return *variant;
    }
    if let Some((_, variant)) = variants.iter().find(|(name, _)| needle.starts_with(name)) {
        return *variant;
    }
    if let Some((_, variant)) = variants.iter().find(|(name, _)| needle.contains(name)) {
        return *variant;
    }
    default
}

/// A registered contact as held by the builder's cache.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Contact {
    pub contact_ref: ContactRef,
    pub identifier: NormalizedIdentifier,
    pub service: Service,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactSpec {
    pub identifier: String,
    pub service: Option<Service>,
    pub country: Option<String>,
    pub display_name: Option<String>,
}

impl ContactSpec {
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self { identifier: identifier.into(), service: None, country: None, display_name: None }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    #[must_use]
    pub fn with_service(mut self, service: Service) -> Self {
        self.service = Some(service);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ThreadSpec {
    pub kind: ThreadKind,
    pub service: Option<Service>,
    pub display_name: Option<String>,
}

impl ThreadSpec {
    #[must_use]
    pub fn direct() -> Self {
        Self { kind: ThreadKind::Direct, service: None, display_name: None }
    }

    #[must_use]
    pub fn group(display_name: Option<String>) -> Self {
        Self { kind: ThreadKind::Group, service: None, display_name }
    }
}

/// One message to append. `sender == None` means the artifact owner sent it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MessageSpec {
    pub sender: Option<ContactRef>,
    pub body: String,
    pub timestamp: NativeTimestamp,
    #[serde(default)]
    pub sequence_hint: Option<i64>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub date_read: Option<NativeTimestamp>,
    #[serde(default)]
    pub date_delivered: Option<NativeTimestamp>,
}

impl MessageSpec {
    #[must_use]
    pub fn new(
        sender: Option<ContactRef>,
        body: impl Into<String>,
        timestamp: NativeTimestamp,
    ) -> Self {
        Self {
            sender,
            body: body.into(),
            timestamp,
            sequence_hint: None,
            guid: None,
            date_read: None,
            date_delivered: None,
        }
    }

    #[must_use]
    pub fn with_sequence_hint(mut self, sequence: i64) -> Self {
        self.sequence_hint = Some(sequence);
        self
    }

    #[must_use]
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }
}

/// Attachment content. Rich-text payload encodings are not modeled; bytes
/// are stored opaquely.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AttachmentPayload {
    Bytes { data: Vec<u8> },
    Reference { path: String, total_bytes: u64 },
    Placeholder,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttachmentSpec {
    pub mime_type: String,
    pub transfer_name: Option<String>,
    pub uti: Option<String>,
    pub payload: AttachmentPayload,
}

impl AttachmentSpec {
    #[must_use]
    pub fn new(mime_type: impl Into<String>, payload: AttachmentPayload) -> Self {
        Self { mime_type: mime_type.into(), transfer_name: None, uti: None, payload }
    }

    #[must_use]
    pub fn with_transfer_name(mut self, name: impl Into<String>) -> Self {
        self.transfer_name = Some(name.into());
        self
    }

    /// Best-effort uniform type identifier for the MIME type.
    #[must_use]
    pub fn resolved_uti(&self) -> Option<String> {
        if self.uti.is_some() {
            return self.uti.clone();
        }
        let uti = match self.mime_type.as_str() {
            "image/jpeg" => "public.jpeg",
            "image/png" => "public.png",
            "image/heic" => "public.heic",
            "image/gif" => "com.compuserve.gif",
            "video/quicktime" => "com.apple.quicktime-movie",
            "video/mp4" => "public.mpeg-4",
            "audio/x-m4a" | "audio/mp4" => "public.mpeg-4-audio",
            "application/pdf" => "com.adobe.pdf",
            "text/plain" => "public.plain-text",
            "text/vcard" => "public.vcard",
            _ => return None,
        };
        Some(uti.to_string())
    }
}

/// Externally generated message content for one thread, before timestamps
/// are assigned. `sender == None` is the artifact owner.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScriptedMessage {
    #[serde(default)]
    pub sender: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConversationRequest {
    pub thread_guid: String,
    pub participants: Vec<String>,
    pub message_count: usize,
}

/// Supplies message content. Implementations may be scripted files or
/// generative backends; the construction engine only consumes the result.
pub trait ConversationSource {
    /// Produce the ordered messages for one conversation.
    ///
    /// # Errors
    /// Returns an error when the backend cannot produce content.
    fn messages_for(
        &mut self,
        request: &ConversationRequest,
    ) -> Result<Vec<ScriptedMessage>, FoundryError>;
}
