//! GUID shapes for chats, messages, and attachments.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Service, ThreadKind};

const MESSAGE_PREFIX: &str = "p:0/";
const ATTACHMENT_PREFIX: &str = "at_0_";
const GROUP_IDENTIFIER_PREFIX: &str = "chat";
const GROUP_IDENTIFIER_HEX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GuidKind<'a> {
    Message,
    Attachment,
    /// Direct chats are keyed by the other participant's identifier.
    DirectChat { service: Service, identifier: &'a str },
    GroupChat { service: Service },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuidFamily {
    Message,
    Attachment,
    Chat,
}

impl GuidFamily {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Attachment => "attachment",
            Self::Chat => "chat",
        }
    }
}

/// Produce a GUID of the requested kind. Message, attachment, and group chat
/// GUIDs embed a random v4 UUID; direct chat GUIDs are derived from the
/// participant and are unique only as long as the participant is.
#[must_use]
pub fn new_guid(kind: GuidKind<'_>) -> String {
    match kind {
        GuidKind::Message => format!("{MESSAGE_PREFIX}{}", Uuid::new_v4()),
        GuidKind::Attachment => format!("{ATTACHMENT_PREFIX}{}", Uuid::new_v4()),
        GuidKind::DirectChat { service, identifier } => {
            chat_guid(service, ThreadKind::Direct, identifier)
        }
        GuidKind::GroupChat { service } => {
            chat_guid(service, ThreadKind::Group, &new_group_identifier())
        }
    }
}

/// `chat.chat_identifier` for a new group chat, e.g. `chat1a2b3c4d5e6f`.
#[must_use]
pub fn new_group_identifier() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{GROUP_IDENTIFIER_PREFIX}{}", &simple[..GROUP_IDENTIFIER_HEX_LEN])
}

#[must_use]
pub fn chat_guid(service: Service, kind: ThreadKind, identifier: &str) -> String {
    let separator = match kind {
        ThreadKind::Direct => '-',
        ThreadKind::Group => '+',
    };
    format!("{service};{separator};{identifier}")
}

/// Classify a GUID by shape. Returns `None` for strings matching no family.
#[must_use]
pub fn classify(guid: &str) -> Option<GuidFamily> {
    if let Some(rest) = guid.strip_prefix(MESSAGE_PREFIX) {
        return Uuid::parse_str(rest).ok().map(|_| GuidFamily::Message);
    }
    if let Some(rest) = guid.strip_prefix(ATTACHMENT_PREFIX) {
        return Uuid::parse_str(rest).ok().map(|_| GuidFamily::Attachment);
    }

    let mut parts = guid.splitn(3, ';');
    let (Some(service), Some(separator), Some(identifier)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    if Service::parse(service).is_none() || identifier.is_empty() {
        return None;
    }
    matches!(separator, "-" | "+").then_some(GuidFamily::Chat)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn message_and_attachment_guids_have_family_prefixes() {
        let message = new_guid(GuidKind::Message);
        let attachment = new_guid(GuidKind::Attachment);
        assert!(message.starts_with("p:0/"));
        assert!(attachment.starts_with("at_0_"));
        assert_eq!(classify(&message), Some(GuidFamily::Message));
        assert_eq!(classify(&attachment), Some(GuidFamily::Attachment));
    }

    #[test]
    fn chat_guids_encode_service_and_kind() {
        let direct = new_guid(GuidKind::DirectChat {
            service: Service::IMessage,
            identifier: "+15551234567",
        });
        assert_eq!(direct, "iMessage;-;+15551234567");

        let group = new_guid(GuidKind::GroupChat { service: Service::Sms });
        assert!(group.starts_with("SMS;+;chat"));
        assert_eq!(group.len(), "SMS;+;chat".len() + 12);
        assert_eq!(classify(&group), Some(GuidFamily::Chat));
    }

    #[test]
    fn generated_guids_do_not_collide() {
        let guids = (0..10_000).map(|_| new_guid(GuidKind::Message)).collect::<HashSet<_>>();
        assert_eq!(guids.len(), 10_000);
    }

    #[test]
    fn malformed_guids_are_unclassified() {
        for raw in ["", "p:0/not-a-uuid", "at_0_", "Fax;-;+1555", "iMessage;?;x", "iMessage;-;"] {
            assert_eq!(classify(raw), None, "{raw} should not classify");
        }
    }
}
