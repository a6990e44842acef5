//! YAML conversation scripts for `foundry build`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use foundry_core::distributor::OWNER_PROFILE_KEY;
use foundry_core::{
    AttachmentPayload, AttachmentSpec, BehaviorProfiles, ContactSpec, ConversationRequest,
    ConversationSource, FoundryError, LatencyClass, ScriptedMessage, Service, ThreadSpec,
};
use foundry_store_sqlite::{populate_thread, ArtifactBuilder, PopulateRequest, ThreadInfo};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::FoundryConfig;

const DEFAULT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub window: Option<Window>,
    #[serde(default)]
    pub contacts: Vec<ScriptContact>,
    pub threads: Vec<ScriptThread>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Window {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptContact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    /// Latency class spelling, e.g. `minutes` or `hours (slow replier)`.
    #[serde(default)]
    pub latency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptThread {
    #[serde(default = "default_kind")]
    pub kind: String,
    pub participants: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub window: Option<Window>,
    pub messages: Vec<ScriptLine>,
}

fn default_kind() -> String {
    "direct".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptLine {
    /// Sender identifier; absent or `me` for the device owner.
    #[serde(default)]
    pub from: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<ScriptAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptAttachment {
    pub mime_type: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Inline the bytes of this file. Without it the attachment is a placeholder.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ScriptLine {
    fn sender(&self) -> Option<&str> {
        self.from
            .as_deref()
            .map(str::trim)
            .filter(|from| !from.eq_ignore_ascii_case(OWNER_PROFILE_KEY))
    }
}

impl Script {
    pub fn from_path(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script file {}", path.display()))?;
        Self::parse(&body).with_context(|| format!("invalid script file {}", path.display()))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let script: Self = serde_yaml::from_str(yaml).context("failed to parse YAML")?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<()> {
        if self.threads.is_empty() {
            bail!("script defines no threads");
        }
        for (index, thread) in self.threads.iter().enumerate() {
            if ThreadKindSpelling::parse(&thread.kind).is_none() {
                bail!("thread {index}: unknown kind {:?} (expected direct or group)", thread.kind);
            }
            if let Some(window) = thread.window.or(self.window) {
                if window.end <= window.start {
                    bail!("thread {index}: window end must be after start");
                }
            }
        }
        Ok(())
    }

    /// Contact latency classes layered over the configured profiles.
    pub fn behavior_profiles(&self, config: &FoundryConfig) -> Result<BehaviorProfiles> {
        let mut profiles = config.behavior_profiles()?;
        for contact in &self.contacts {
            if let Some(latency) = &contact.latency {
                let canonical = foundry_core::normalize_identifier(&contact.id)?.canonical;
                let class = LatencyClass::parse_lenient(latency, LatencyClass::default());
                profiles.insert(canonical, class);
            }
        }
        Ok(profiles)
    }
}

enum ThreadKindSpelling {
    Direct,
    Group,
}

impl ThreadKindSpelling {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "direct" | "dm" | "1:1" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Serves one thread's scripted lines to the populate pipeline.
#[derive(Debug)]
pub struct ScriptConversation<'a> {
    lines: &'a [ScriptLine],
}

impl<'a> ScriptConversation<'a> {
    #[must_use]
    pub fn new(lines: &'a [ScriptLine]) -> Self {
        Self { lines }
    }
}

impl ConversationSource for ScriptConversation<'_> {
    fn messages_for(
        &mut self,
        request: &ConversationRequest,
    ) -> Result<Vec<ScriptedMessage>, FoundryError> {
        Ok(self
            .lines
            .iter()
            .take(request.message_count)
            .map(|line| ScriptedMessage {
                sender: line.sender().map(str::to_string),
                body: line.text.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuiltThread {
    pub guid: String,
    pub kind: String,
    pub participants: Vec<String>,
    pub messages: usize,
    pub attachments: usize,
}

/// Play `script` into `builder`. Thread `n` is timestamped with `seed + n`.
pub fn play(
    script: &Script,
    builder: &mut ArtifactBuilder,
    config: &FoundryConfig,
    seed: u64,
) -> Result<Vec<BuiltThread>> {
    let default_service = config.service();
    let profiles = script.behavior_profiles(config)?;
    let fallback_window = script.window.map_or_else(default_window, Ok)?;

    let mut contact_refs = BTreeMap::new();
    for contact in &script.contacts {
        let mut spec = ContactSpec::new(contact.id.clone())
            .with_service(service_or(contact.service.as_deref(), default_service));
        if let Some(name) = &contact.name {
            spec = spec.with_display_name(name.clone());
        }
        let contact_ref = builder.add_contact_with(spec)?;
        contact_refs.insert(contact.id.clone(), contact_ref);
    }

    let mut built = Vec::with_capacity(script.threads.len());
    for (index, thread) in script.threads.iter().enumerate() {
        let service = service_or(thread.service.as_deref(), default_service);
        let mut participants = Vec::with_capacity(thread.participants.len());
        for id in &thread.participants {
            let contact_ref = match contact_refs.get(id) {
                Some(existing) => *existing,
                None => {
                    builder.add_contact_with(ContactSpec::new(id.clone()).with_service(service))?
                }
            };
            participants.push(contact_ref);
        }

        let spec = match ThreadKindSpelling::parse(&thread.kind) {
            Some(ThreadKindSpelling::Group) => ThreadSpec::group(thread.name.clone()),
            Some(ThreadKindSpelling::Direct) | None => ThreadSpec::direct(),
        };
        let thread_ref = builder
            .create_thread(&participants, ThreadSpec { service: Some(service), ..spec })
            .with_context(|| format!("failed to create thread {index}"))?;

        let window = thread.window.unwrap_or(fallback_window);
        let request = PopulateRequest {
            thread: thread_ref,
            message_count: thread.messages.len(),
            start: window.start,
            end: window.end,
            profiles: &profiles,
            distributor: config.distributor_config(),
            seed: seed.wrapping_add(index as u64),
        };
        let mut source = ScriptConversation::new(&thread.messages);
        let message_refs = populate_thread(builder, &mut source, &request)
            .with_context(|| format!("failed to populate thread {index}"))?;

        let mut attachments = 0;
        for (line, message_ref) in thread.messages.iter().zip(&message_refs) {
            for attachment in &line.attachments {
                builder.add_attachment(*message_ref, attachment_spec(attachment)?)?;
                attachments += 1;
            }
        }

        let info: ThreadInfo = builder.thread_info(thread_ref)?;
        built.push(BuiltThread {
            guid: info.guid,
            kind: info.kind.as_str().to_string(),
            participants: info
                .participants
                .into_iter()
                .map(|contact| contact.identifier.canonical)
                .collect(),
            messages: info.message_count,
            attachments,
        });
    }
    Ok(built)
}

fn service_or(value: Option<&str>, default: Service) -> Service {
    value.map_or(default, |value| Service::parse_lenient(value, default))
}

fn default_window() -> Result<Window> {
    let end = OffsetDateTime::now_utc();
    let start = end
        .checked_sub(Duration::days(DEFAULT_WINDOW_DAYS))
        .ok_or_else(|| anyhow!("default window start is out of range"))?;
    Ok(Window { start, end })
}

fn attachment_spec(attachment: &ScriptAttachment) -> Result<AttachmentSpec> {
    let payload = match &attachment.path {
        Some(path) => AttachmentPayload::Bytes {
            data: std::fs::read(path)
                .with_context(|| format!("failed to read attachment {}", path.display()))?,
        },
        None => AttachmentPayload::Placeholder,
    };
    let file_name = attachment.path.as_deref().and_then(Path::file_name);
    let name = attachment
        .name
        .clone()
        .or_else(|| file_name.map(|name| name.to_string_lossy().into_owned()));
    let spec = AttachmentSpec::new(attachment.mime_type.clone(), payload);
    Ok(match name {
        Some(name) => spec.with_transfer_name(name),
        None => spec,
    })
}
