use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use foundry_core::dialect::PROPERTIES_TABLE;
use foundry_core::guid::{chat_guid, new_group_identifier};
use foundry_core::{
    new_guid, normalize_identifier, AttachmentPayload, AttachmentRef, AttachmentSpec, Contact,
    ContactRef, ContactSpec, Dialect, FoundryError, GuidKind, MessageRef, MessageSpec,
    NativeTimestamp, Service, SessionId, ThreadKind, ThreadRef, ThreadSpec, ValidationReport,
};
use rusqlite::{params, Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;
use uuid::Uuid;

pub mod populate;
mod sink;
pub mod validator;

pub use populate::{populate_thread, PopulateRequest};
pub use validator::{validate_connection, validate_path};

use sink::{io_error, map_sqlite_error, with_retry, StagingGuard};

pub const DEFAULT_IO_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_COUNTRY: &str = "US";

const UNIQUE_IDENTIFIER_KEY: &str = "_UniqueIdentifier";
/// `chat.state` for an active conversation.
const CHAT_STATE_ACTIVE: i64 = 3;
/// `attachment.transfer_state` once bytes are present.
const TRANSFER_STATE_FINISHED: i64 = 5;
const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ArtifactTarget {
    /// Written to a staging file beside `path` and renamed into place on finalize.
    File { path: PathBuf },
    /// Built in memory; optionally backed up to `backup_to` on finalize.
    InMemory { backup_to: Option<PathBuf> },
}

impl ArtifactTarget {
    #[must_use]
    pub fn output_path(&self) -> Option<&Path> {
        match self {
            Self::File { path } => Some(path.as_path()),
            Self::InMemory { backup_to } => backup_to.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuilderOptions {
    pub target: ArtifactTarget,
    pub service: Service,
    pub country: String,
    pub io_retry_attempts: u32,
    /// Root for inline attachment bytes. Defaults to `<output>.attachments`.
    pub attachment_dir: Option<PathBuf>,
}

impl BuilderOptions {
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_target(ArtifactTarget::File { path: path.into() })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_target(ArtifactTarget::InMemory { backup_to: None })
    }

    fn with_target(target: ArtifactTarget) -> Self {
        Self {
            target,
            service: Service::default(),
            country: DEFAULT_COUNTRY.to_string(),
            io_retry_attempts: DEFAULT_IO_RETRY_ATTEMPTS,
            attachment_dir: None,
        }
    }

    #[must_use]
    pub fn with_service(mut self, service: Service) -> Self {
        self.service = service;
        self
    }

    #[must_use]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = country.into();
        self
    }

    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.io_retry_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_attachment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.attachment_dir = Some(dir.into());
        self
    }

    fn attachment_root(&self) -> Option<PathBuf> {
        self.attachment_dir.clone().or_else(|| {
            self.target.output_path().map(|output| output.with_extension("attachments"))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EntityCounts {
    pub contacts: usize,
    pub threads: usize,
    pub messages: usize,
    pub attachments: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub path: Option<PathBuf>,
    pub dialect: String,
    pub client_version: Option<String>,
    pub sha256: Option<String>,
    pub counts: EntityCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_ref: ThreadRef,
    pub guid: String,
    pub chat_identifier: String,
    pub kind: ThreadKind,
    pub service: Service,
    pub participants: Vec<Contact>,
    pub message_count: usize,
}

#[derive(Debug, Clone)]
struct ThreadState {
    guid: String,
    chat_identifier: String,
    kind: ThreadKind,
    service: Service,
    participants: Vec<i64>,
    last_sort_id: i64,
    last_date: Option<NativeTimestamp>,
    message_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct MessageState {
    date: NativeTimestamp,
    from_me: bool,
}

#[derive(Debug, Clone)]
struct PlannedMessage {
    guid: String,
    sort_id: i64,
    handle_id: i64,
    from_me: bool,
    body: String,
    date: NativeTimestamp,
    date_read: i64,
    date_delivered: i64,
}

/// Append-only construction session over one artifact.
///
/// The builder exclusively owns the connection and every in-memory cache.
/// Dropping it without [`ArtifactBuilder::finalize`] discards the artifact.
pub struct ArtifactBuilder {
    conn: Connection,
    // Declared after `conn` so the connection closes before staged files go.
    staging: StagingGuard,
    session: SessionId,
    dialect: Dialect,
    options: BuilderOptions,
    contact_keys: HashMap<(String, Service), i64>,
    contacts: HashMap<i64, Contact>,
    threads: HashMap<i64, ThreadState>,
    chat_guids: HashSet<String>,
    messages: HashMap<i64, MessageState>,
    message_guids: HashSet<String>,
    attachments: usize,
}

impl ArtifactBuilder {
    /// Open a new artifact session and lay down the dialect's schema.
    ///
    /// # Errors
    /// Returns [`FoundryError::DurableIo`] when the sink cannot be created and
    /// [`FoundryError::Config`] when the output path is unusable.
    pub fn open(options: BuilderOptions, dialect: &Dialect) -> Result<Self, FoundryError> {
        let session = SessionId::next();
        let (conn, staging) = match &options.target {
            ArtifactTarget::File { path } => {
                let staging_path = staging_path_for(path)?;
                let staging = StagingGuard::new(Some(staging_path.clone()));
                let conn = Connection::open(&staging_path)
                    .map_err(|err| map_sqlite_error("open artifact", 1, &err))?;
                (conn, staging)
            }
            ArtifactTarget::InMemory { .. } => {
                let conn = Connection::open_in_memory()
                    .map_err(|err| map_sqlite_error("open artifact", 1, &err))?;
                (conn, StagingGuard::new(None))
            }
        };

        let mut builder = Self {
            conn,
            staging,
            session,
            dialect: dialect.clone(),
            options,
            contact_keys: HashMap::new(),
            contacts: HashMap::new(),
            threads: HashMap::new(),
            chat_guids: HashSet::new(),
            messages: HashMap::new(),
            message_guids: HashSet::new(),
            attachments: 0,
        };
        builder.initialize()?;

        tracing::info!(
            session = %builder.session,
            dialect = %builder.dialect.name,
            staging = ?builder.staging.staging_path(),
            "opened artifact session"
        );
        Ok(builder)
    }

    /// Open a session, run `work`, and finalize on success. On error the
    /// session is dropped and the partial artifact discarded.
    ///
    /// # Errors
    /// Propagates errors from opening, from `work`, and from finalizing.
    pub fn build_with<T, E>(
        options: BuilderOptions,
        dialect: &Dialect,
        work: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<(T, ArtifactSummary), E>
    where
        E: From<FoundryError>,
    {
        let mut builder = Self::open(options, dialect)?;
        let value = work(&mut builder)?;
        let summary = builder.finalize()?;
        Ok((value, summary))
    }

    fn initialize(&mut self) -> Result<(), FoundryError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(|err| map_sqlite_error("configure artifact", 1, &err))?;

        let statements = self.dialect.schema_sql();
        let mut metadata = Vec::new();
        if self.dialect.table(PROPERTIES_TABLE).is_some() {
            metadata.extend(self.dialect.metadata.clone());
            let unique_identifier = Uuid::new_v4().to_string().to_uppercase();
            metadata.push((UNIQUE_IDENTIFIER_KEY.to_string(), unique_identifier));
        }

        with_retry(&mut self.conn, self.options.io_retry_attempts, "create schema", |conn| {
            let tx = conn.transaction()?;
            for statement in &statements {
                tx.execute_batch(statement)?;
            }
            for (key, value) in &metadata {
                tx.execute(
                    &format!("INSERT INTO {PROPERTIES_TABLE} (key, value) VALUES (?1, ?2)"),
                    params![key, value],
                )?;
            }
            tx.commit()
        })
    }

    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[must_use]
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    #[must_use]
    pub fn counts(&self) -> EntityCounts {
        EntityCounts {
            contacts: self.contacts.len(),
            threads: self.threads.len(),
            messages: self.messages.len(),
            attachments: self.attachments,
        }
    }

    /// Register a contact with the session's default service.
    ///
    /// # Errors
    /// Returns [`FoundryError::InvalidIdentifier`] for malformed identifiers.
    pub fn add_contact(&mut self, identifier: &str) -> Result<ContactRef, FoundryError> {
        self.add_contact_with(ContactSpec::new(identifier))
    }

    /// Register a contact, returning the existing ref when the normalized
    /// identifier is already known for the same service.
    ///
    /// # Errors
    /// Returns [`FoundryError::InvalidIdentifier`] for malformed identifiers and
    /// sink errors when the row cannot be written.
    pub fn add_contact_with(&mut self, spec: ContactSpec) -> Result<ContactRef, FoundryError> {
        let identifier = normalize_identifier(&spec.identifier)?;
        let service = spec.service.unwrap_or(self.options.service);
        let key = (identifier.canonical.clone(), service);
        if let Some(rowid) = self.contact_keys.get(&key) {
            tracing::debug!(handle = %identifier.canonical, rowid, "contact already registered");
            return Ok(ContactRef::new(self.session, *rowid));
        }

        let country = spec.country.as_deref().unwrap_or(&self.options.country).to_lowercase();
        let attempts = self.options.io_retry_attempts;
        let rowid = with_retry(&mut self.conn, attempts, "insert handle", |conn| {
            conn.execute(
                "INSERT INTO handle (id, country, service, uncanonicalized_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![identifier.canonical, country, service.as_str(), identifier.original],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        let contact_ref = ContactRef::new(self.session, rowid);
        tracing::debug!(handle = %identifier.canonical, rowid, "inserted handle");
        self.contact_keys.insert(key, rowid);
        self.contacts.insert(
            rowid,
            Contact { contact_ref, identifier, service, display_name: spec.display_name },
        );
        Ok(contact_ref)
    }

    /// # Errors
    /// Returns [`FoundryError::UnknownContact`] for stale or foreign refs.
    pub fn contact(&self, contact: ContactRef) -> Result<&Contact, FoundryError> {
        let rowid = self.resolve_contact(contact)?;
        self.contacts.get(&rowid).ok_or_else(|| FoundryError::UnknownContact(contact.to_string()))
    }

    /// Create a thread over `participants` (never including the owner).
    /// Repeated refs count once.
    ///
    /// # Errors
    /// Returns [`FoundryError::EmptyParticipants`] or
    /// [`FoundryError::InvalidThreadKind`] when the participant count does not
    /// fit the kind, [`FoundryError::UnknownContact`] for stale refs, and
    /// [`FoundryError::DuplicateGuid`] for a second direct thread with the
    /// same contact and service.
    pub fn create_thread(
        &mut self,
        participants: &[ContactRef],
        spec: ThreadSpec,
    ) -> Result<ThreadRef, FoundryError> {
        let mut handles = Vec::with_capacity(participants.len());
        for participant in participants {
            let rowid = self.resolve_contact(*participant)?;
            if !handles.contains(&rowid) {
                handles.push(rowid);
            }
        }
        spec.kind.check_participants(handles.len())?;

        let service = spec.service.unwrap_or(self.options.service);
        let (chat_identifier, room_name) = match spec.kind {
            ThreadKind::Direct => {
                let contact = handles
                    .first()
                    .and_then(|rowid| self.contacts.get(rowid))
                    .ok_or_else(|| FoundryError::UnknownContact(format!("{participants:?}")))?;
                (contact.identifier.canonical.clone(), None)
            }
            ThreadKind::Group => {
                let identifier = new_group_identifier();
                (identifier.clone(), Some(identifier))
            }
        };
        let guid = chat_guid(service, spec.kind, &chat_identifier);
        if self.chat_guids.contains(&guid) {
            return Err(FoundryError::DuplicateGuid { entity: "chat".to_string(), guid });
        }

        let display_name = spec.display_name.clone().unwrap_or_default();
        let group_id = Uuid::new_v4().to_string().to_uppercase();
        let attempts = self.options.io_retry_attempts;
        let rowid = with_retry(&mut self.conn, attempts, "insert chat", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chat (guid, style, state, chat_identifier, service_name, room_name,
                                   display_name, group_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    guid,
                    spec.kind.chat_style(),
                    CHAT_STATE_ACTIVE,
                    chat_identifier,
                    service.as_str(),
                    room_name,
                    display_name,
                    group_id
                ],
            )?;
            let chat_id = tx.last_insert_rowid();
            for handle_id in &handles {
                tx.execute(
                    "INSERT INTO chat_handle_join (chat_id, handle_id) VALUES (?1, ?2)",
                    params![chat_id, handle_id],
                )?;
            }
            tx.commit()?;
            Ok(chat_id)
        })?;

        tracing::debug!(%guid, rowid, participants = handles.len(), "inserted chat");
        self.chat_guids.insert(guid.clone());
        self.threads.insert(
            rowid,
            ThreadState {
                guid,
                chat_identifier,
                kind: spec.kind,
                service,
                participants: handles,
                last_sort_id: 0,
                last_date: None,
                message_count: 0,
            },
        );
        Ok(ThreadRef::new(self.session, rowid))
    }

    /// # Errors
    /// Returns [`FoundryError::UnknownThread`] for stale or foreign refs.
    pub fn thread_info(&self, thread: ThreadRef) -> Result<ThreadInfo, FoundryError> {
        let rowid = self.resolve_thread(thread)?;
        let state = self.thread_state(thread, rowid)?;
        let participants = state
            .participants
            .iter()
            .filter_map(|handle_id| self.contacts.get(handle_id).cloned())
            .collect();
        Ok(ThreadInfo {
            thread_ref: thread,
            guid: state.guid.clone(),
            chat_identifier: state.chat_identifier.clone(),
            kind: state.kind,
            service: state.service,
            participants,
            message_count: state.message_count,
        })
    }

    /// # Errors
    /// Returns [`FoundryError::UnknownThread`] for stale or foreign refs.
    pub fn message_count(&self, thread: ThreadRef) -> Result<usize, FoundryError> {
        let rowid = self.resolve_thread(thread)?;
        Ok(self.thread_state(thread, rowid)?.message_count)
    }

    /// Append one message to `thread`.
    ///
    /// # Errors
    /// Same as [`ArtifactBuilder::add_messages_batch`].
    pub fn add_message(
        &mut self,
        thread: ThreadRef,
        spec: MessageSpec,
    ) -> Result<MessageRef, FoundryError> {
        self.add_messages_batch(thread, std::slice::from_ref(&spec))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                FoundryError::UnknownMessage(format!("insert into {thread} returned no row"))
            })
    }

    /// Append `specs` in order inside one transaction. Either every row lands
    /// or none do, and the session caches only change after commit.
    ///
    /// # Errors
    /// Returns [`FoundryError::UnknownThread`]/[`FoundryError::UnknownContact`]
    /// for stale refs, [`FoundryError::SenderNotParticipant`],
    /// [`FoundryError::DuplicateGuid`] for repeated explicit GUIDs,
    /// [`FoundryError::IntegrityViolation`] when the sink rejects a row, and
    /// [`FoundryError::DurableIo`] after exhausting retries.
    pub fn add_messages_batch(
        &mut self,
        thread: ThreadRef,
        specs: &[MessageSpec],
    ) -> Result<Vec<MessageRef>, FoundryError> {
        let chat_id = self.resolve_thread(thread)?;
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.thread_state(thread, chat_id)?;
        let mut pending_guids = HashSet::new();
        let mut last_sort_id = state.last_sort_id;
        let mut last_date = state.last_date;
        let mut planned = Vec::with_capacity(specs.len());
        for spec in specs {
            let message = self.plan_message(state, last_sort_id, &pending_guids, spec)?;
            if last_date.is_some_and(|previous| message.date < previous) {
                tracing::debug!(
                    thread = %state.guid,
                    guid = %message.guid,
                    "message timestamp precedes the previous message"
                );
            }
            last_sort_id = last_sort_id.max(message.sort_id);
            last_date = Some(message.date);
            pending_guids.insert(message.guid.clone());
            planned.push(message);
        }
        let service = state.service;
        let room_names = (state.kind == ThreadKind::Group).then(|| state.chat_identifier.clone());

        let attempts = self.options.io_retry_attempts;
        let rowids = with_retry(&mut self.conn, attempts, "insert messages", |conn| {
            let tx = conn.transaction()?;
            let mut rowids = Vec::with_capacity(planned.len());
            for message in &planned {
                rowids.push(insert_message(&tx, chat_id, service, room_names.as_deref(), message)?);
            }
            tx.commit()?;
            Ok(rowids)
        })?;

        tracing::debug!(%thread, messages = rowids.len(), "inserted messages");
        let refs = rowids.iter().map(|rowid| MessageRef::new(self.session, *rowid)).collect();
        for (rowid, message) in rowids.into_iter().zip(planned) {
            self.record_message(chat_id, rowid, message);
        }
        Ok(refs)
    }

    fn plan_message(
        &self,
        state: &ThreadState,
        last_sort_id: i64,
        pending_guids: &HashSet<String>,
        spec: &MessageSpec,
    ) -> Result<PlannedMessage, FoundryError> {
        let (handle_id, from_me) = match spec.sender {
            Some(sender) => {
                let rowid = self.resolve_contact(sender)?;
                if !state.participants.contains(&rowid) {
                    return Err(FoundryError::SenderNotParticipant {
                        contact: sender.to_string(),
                        thread: state.guid.clone(),
                    });
                }
                (rowid, false)
            }
            None => (0, true),
        };

        let guid = spec.guid.clone().unwrap_or_else(|| new_guid(GuidKind::Message));
        if self.message_guids.contains(&guid) || pending_guids.contains(&guid) {
            return Err(FoundryError::DuplicateGuid { entity: "message".to_string(), guid });
        }

        let date = spec.timestamp;
        let (read_default, delivered_default) =
            if from_me { (0, date.nanos()) } else { (date.nanos(), 0) };
        let date_read = spec.date_read.map_or(read_default, NativeTimestamp::nanos);
        let date_delivered = spec.date_delivered.map_or(delivered_default, NativeTimestamp::nanos);

        Ok(PlannedMessage {
            guid,
            sort_id: spec.sequence_hint.unwrap_or(last_sort_id + 1),
            handle_id,
            from_me,
            body: spec.body.clone(),
            date,
            date_read,
            date_delivered,
        })
    }

    fn record_message(&mut self, chat_id: i64, rowid: i64, message: PlannedMessage) {
        if let Some(state) = self.threads.get_mut(&chat_id) {
            state.last_sort_id = state.last_sort_id.max(message.sort_id);
            state.last_date = Some(message.date);
            state.message_count += 1;
        }
        self.messages.insert(rowid, MessageState { date: message.date, from_me: message.from_me });
        self.message_guids.insert(message.guid);
    }

    /// Attach a payload to an existing message.
    ///
    /// # Errors
    /// Returns [`FoundryError::UnknownMessage`] for stale refs,
    /// [`FoundryError::DurableIo`] when inline bytes cannot be written, and
    /// sink errors when the rows cannot be inserted.
    pub fn add_attachment(
        &mut self,
        message: MessageRef,
        spec: AttachmentSpec,
    ) -> Result<AttachmentRef, FoundryError> {
        let message_id = self.resolve_message(message)?;
        let parent = *self
            .messages
            .get(&message_id)
            .ok_or_else(|| FoundryError::UnknownMessage(message.to_string()))?;

        let guid = new_guid(GuidKind::Attachment);
        let transfer_name = spec.transfer_name.clone().unwrap_or_else(|| guid.clone());
        let (filename, total_bytes, transfer_state, written) = match &spec.payload {
            AttachmentPayload::Bytes { data } => {
                let (filename, written) = self.write_attachment_bytes(&guid, &transfer_name, data)?;
                (Some(filename), byte_len(data.len() as u64), TRANSFER_STATE_FINISHED, written)
            }
            AttachmentPayload::Reference { path, total_bytes } => {
                (Some(path.clone()), byte_len(*total_bytes), TRANSFER_STATE_FINISHED, None)
            }
            AttachmentPayload::Placeholder => (None, 0, 0, None),
        };
        let uti = spec.resolved_uti();
        let created_date = parent.date.nanos() / NANOS_PER_SECOND;

        let attempts = self.options.io_retry_attempts;
        let inserted = with_retry(&mut self.conn, attempts, "insert attachment", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO attachment (guid, created_date, start_date, filename, uti, mime_type,
                                         transfer_state, is_outgoing, transfer_name, total_bytes,
                                         original_guid)
                 VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?1)",
                params![
                    guid,
                    created_date,
                    filename,
                    uti,
                    spec.mime_type,
                    transfer_state,
                    i64::from(parent.from_me),
                    transfer_name,
                    total_bytes
                ],
            )?;
            let attachment_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (?1, ?2)",
                params![message_id, attachment_id],
            )?;
            tx.execute(
                "UPDATE message SET cache_has_attachments = 1 WHERE ROWID = ?1",
                params![message_id],
            )?;
            tx.commit()?;
            Ok(attachment_id)
        });

        let rowid = match inserted {
            Ok(rowid) => rowid,
            Err(err) => {
                if let Some(path) = written {
                    let _ = fs::remove_file(path);
                }
                return Err(err);
            }
        };

        tracing::debug!(%guid, rowid, message_id, "inserted attachment");
        self.attachments += 1;
        Ok(AttachmentRef::new(self.session, rowid))
    }

    /// Returns the stored `filename` and, when bytes hit disk, the written path.
    fn write_attachment_bytes(
        &mut self,
        guid: &str,
        transfer_name: &str,
        data: &[u8],
    ) -> Result<(String, Option<PathBuf>), FoundryError> {
        let bucket = guid.trim_start_matches("at_0_").get(..2).unwrap_or("00").to_lowercase();
        let Some(root) = self.options.attachment_root() else {
            let filename =
                format!("~/Library/Messages/Attachments/{bucket}/{guid}/{transfer_name}");
            return Ok((filename, None));
        };

        let dir = root.join(&bucket).join(guid);
        for ancestor in [root.clone(), root.join(&bucket), dir.clone()] {
            if !ancestor.exists() {
                fs::create_dir_all(&ancestor)
                    .map_err(|err| io_error("create attachment directory", &ancestor, &err))?;
                self.staging.track_dir(ancestor);
            }
        }
        let path = dir.join(transfer_name);
        fs::write(&path, data).map_err(|err| io_error("write attachment", &path, &err))?;
        self.staging.track_file(path.clone());
        Ok((path.display().to_string(), Some(path)))
    }

    /// Validate the artifact as built so far.
    ///
    /// # Errors
    /// Returns [`FoundryError::DurableIo`] when the artifact cannot be read.
    pub fn validate(&self) -> Result<ValidationReport, FoundryError> {
        validate_connection(&self.conn, &self.dialect)
    }

    /// Flush and close the artifact, moving it into place.
    ///
    /// # Errors
    /// Returns [`FoundryError::DurableIo`] when closing, backing up, renaming,
    /// or hashing fails. The artifact is discarded in that case.
    pub fn finalize(self) -> Result<ArtifactSummary, FoundryError> {
        let counts = self.counts();
        let Self { conn, staging, session, dialect, options, .. } = self;

        if let ArtifactTarget::InMemory { backup_to: Some(output) } = &options.target {
            ensure_parent_dir(output)?;
            conn.backup(DatabaseName::Main, output, None)
                .map_err(|err| map_sqlite_error("back up artifact", 1, &err))?;
        }
        conn.close().map_err(|(_, err)| map_sqlite_error("close artifact", 1, &err))?;

        let output = options.target.output_path().map(Path::to_path_buf);
        let rename_to = match &options.target {
            ArtifactTarget::File { path } => Some(path.as_path()),
            ArtifactTarget::InMemory { .. } => None,
        };
        staging.commit(rename_to)?;

        let sha256 = output.as_deref().map(file_sha256).transpose()?;
        tracing::info!(
            %session,
            dialect = %dialect.name,
            path = ?output,
            messages = counts.messages,
            "finalized artifact"
        );
        Ok(ArtifactSummary {
            path: output,
            client_version: dialect.client_version().map(str::to_string),
            dialect: dialect.name,
            sha256,
            counts,
        })
    }

    fn resolve_contact(&self, contact: ContactRef) -> Result<i64, FoundryError> {
        if contact.session() == self.session && self.contacts.contains_key(&contact.rowid()) {
            Ok(contact.rowid())
        } else {
            Err(FoundryError::UnknownContact(contact.to_string()))
        }
    }

    fn resolve_thread(&self, thread: ThreadRef) -> Result<i64, FoundryError> {
        if thread.session() == self.session && self.threads.contains_key(&thread.rowid()) {
            Ok(thread.rowid())
        } else {
            Err(FoundryError::UnknownThread(thread.to_string()))
        }
    }

    fn resolve_message(&self, message: MessageRef) -> Result<i64, FoundryError> {
        if message.session() == self.session && self.messages.contains_key(&message.rowid()) {
            Ok(message.rowid())
        } else {
            Err(FoundryError::UnknownMessage(message.to_string()))
        }
    }

    fn thread_state(&self, thread: ThreadRef, rowid: i64) -> Result<&ThreadState, FoundryError> {
        self.threads.get(&rowid).ok_or_else(|| FoundryError::UnknownThread(thread.to_string()))
    }
}

fn insert_message(
    conn: &Connection,
    chat_id: i64,
    service: Service,
    room_names: Option<&str>,
    message: &PlannedMessage,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO message (guid, text, handle_id, service, date, date_read, date_delivered,
                              is_delivered, is_finished, is_from_me, is_sent, is_read,
                              cache_roomnames, sort_id, part_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 1, ?8, ?8, ?9, ?10, ?11, 1)",
        params![
            message.guid,
            message.body,
            message.handle_id,
            service.as_str(),
            message.date.nanos(),
            message.date_read,
            message.date_delivered,
            i64::from(message.from_me),
            i64::from(!message.from_me),
            room_names,
            message.sort_id
        ],
    )?;
    let message_id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO chat_message_join (chat_id, message_id, message_date) VALUES (?1, ?2, ?3)",
        params![chat_id, message_id, message.date.nanos()],
    )?;
    Ok(message_id)
}

fn byte_len(len: u64) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn staging_path_for(output: &Path) -> Result<PathBuf, FoundryError> {
    let file_name = output
        .file_name()
        .ok_or_else(|| {
            FoundryError::Config(format!("output path has no file name: {}", output.display()))
        })?;
    ensure_parent_dir(output)?;
    let staging_name = format!(".{}.{}.staging", file_name.to_string_lossy(), Ulid::new());
    Ok(output.with_file_name(staging_name))
}

fn ensure_parent_dir(path: &Path) -> Result<(), FoundryError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)
                .map_err(|err| io_error("create output directory", parent, &err))
        }
        _ => Ok(()),
    }
}

fn file_sha256(path: &Path) -> Result<String, FoundryError> {
    let mut file = File::open(path).map_err(|err| io_error("hash artifact", path, &err))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| io_error("hash artifact", path, &err))?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use foundry_core::{
        resolve_dialect, AttachmentPayload, AttachmentSpec, BehaviorProfiles, ContactSpec,
        ConversationRequest, ConversationSource, DistributorConfig, FoundryError, LatencyClass,
        MessageSpec, NativeTimestamp, ScriptedMessage, Service, ThreadSpec, ViolationKind,
    };
    use rusqlite::params;
    use time::macros::datetime;

    use super::*;

    const ALICE: &str = "+15551234567";
    const BOB: &str = "bob@example.com";
    const HOUR: i64 = 3_600 * 1_000_000_000;

    fn sequoia() -> Result<Dialect> {
        Ok(resolve_dialect("sequoia")?)
    }

    fn memory_builder() -> Result<ArtifactBuilder> {
        Ok(ArtifactBuilder::open(BuilderOptions::in_memory(), &sequoia()?)?)
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("foundry-store-{}", Ulid::new()))
    }

    fn count_rows(builder: &ArtifactBuilder, sql: &str) -> Result<i64> {
        builder
            .conn
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run {sql}"))
    }

    fn sort_id_of(builder: &ArtifactBuilder, message: MessageRef) -> Result<i64> {
        let sort_id = builder.conn.query_row(
            "SELECT sort_id FROM message WHERE ROWID = ?1",
            params![message.rowid()],
            |row| row.get(0),
        )?;
        Ok(sort_id)
    }

    fn has_violation(report: &ValidationReport, kind: ViolationKind, table: &str) -> bool {
        report.violations.iter().any(|violation| violation.kind == kind && violation.table == table)
    }

    fn stamp(hours: i64) -> NativeTimestamp {
        NativeTimestamp(700_000_000 * 1_000_000_000 + hours * HOUR)
    }

    #[test]
    fn two_contacts_one_direct_thread_validates_clean() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        builder.add_contact(BOB)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;

        let question = MessageSpec::new(Some(alice), "are we still on for tonight?", stamp(0));
        builder.add_message(thread, question)?;
        builder.add_message(thread, MessageSpec::new(None, "yes, 7pm", stamp(1)))?;

        let report = builder.validate()?;
        assert!(report.is_valid(), "unexpected violations: {:?}", report.violations);
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM message")?, 2);
        assert_eq!(builder.message_count(thread)?, 2);
        Ok(())
    }

    #[test]
    fn owner_messages_use_the_sentinel_handle() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        let reply = builder.add_message(thread, MessageSpec::new(None, "on my way", stamp(0)))?;

        let (handle_id, is_from_me, sort_id): (i64, i64, i64) = builder.conn.query_row(
            "SELECT handle_id, is_from_me, sort_id FROM message WHERE ROWID = ?1",
            params![reply.rowid()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!((handle_id, is_from_me, sort_id), (0, 1, 1));
        Ok(())
    }

    #[test]
    fn repeated_contacts_collapse_to_one_handle() -> Result<()> {
        let mut builder = memory_builder()?;
        let spellings = [
            "+15551234567",
            "(555) 123-4567",
            "555.123.4567",
            "1 555 123 4567",
            " +1 555 123 4567 ",
        ];
        let refs = spellings
            .iter()
            .map(|raw| builder.add_contact(raw))
            .collect::<Result<Vec<_>, _>>()?;

        assert!(refs.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM handle")?, 1);
        assert_eq!(builder.counts().contacts, 1);

        let sms = builder.add_contact_with(ContactSpec::new(ALICE).with_service(Service::Sms))?;
        assert_ne!(sms, refs[0]);
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM handle")?, 2);
        Ok(())
    }

    #[test]
    fn malformed_identifiers_are_rejected_without_writing() -> Result<()> {
        let mut builder = memory_builder()?;
        assert!(matches!(
            builder.add_contact("not a number"),
            Err(FoundryError::InvalidIdentifier { .. })
        ));
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM handle")?, 0);
        Ok(())
    }

    #[test]
    fn direct_threads_require_exactly_one_participant() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let bob = builder.add_contact(BOB)?;

        assert!(matches!(
            builder.create_thread(&[], ThreadSpec::direct()),
            Err(FoundryError::EmptyParticipants { .. })
        ));
        assert!(matches!(
            builder.create_thread(&[alice, bob], ThreadSpec::direct()),
            Err(FoundryError::InvalidThreadKind { participants: 2, .. })
        ));
        assert!(matches!(
            builder.create_thread(&[alice], ThreadSpec::group(None)),
            Err(FoundryError::InvalidThreadKind { participants: 1, .. })
        ));

        let thread = builder.create_thread(&[alice, alice], ThreadSpec::direct())?;
        assert_eq!(builder.thread_info(thread)?.guid, "iMessage;-;+15551234567");
        assert!(matches!(
            builder.create_thread(&[alice], ThreadSpec::direct()),
            Err(FoundryError::DuplicateGuid { .. })
        ));
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM chat")?, 1);
        Ok(())
    }

    #[test]
    fn group_threads_join_every_participant() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let bob = builder.add_contact(BOB)?;
        let thread =
            builder.create_thread(&[alice, bob], ThreadSpec::group(Some("Weekend".to_string())))?;

        let info = builder.thread_info(thread)?;
        assert_eq!(info.kind, ThreadKind::Group);
        assert!(info.guid.starts_with("iMessage;+;chat"));
        assert_eq!(info.participants.len(), 2);
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM chat_handle_join")?, 2);
        assert_eq!(count_rows(&builder, "SELECT style FROM chat")?, 45);

        builder.add_message(thread, MessageSpec::new(Some(bob), "who's driving?", stamp(0)))?;
        assert!(builder.validate()?.is_valid());
        Ok(())
    }

    #[test]
    fn senders_must_belong_to_the_thread() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let bob = builder.add_contact(BOB)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;

        assert!(matches!(
            builder.add_message(thread, MessageSpec::new(Some(bob), "hi", stamp(0))),
            Err(FoundryError::SenderNotParticipant { .. })
        ));
        assert_eq!(builder.message_count(thread)?, 0);
        Ok(())
    }

    #[test]
    fn refs_from_another_session_are_rejected() -> Result<()> {
        let mut first = memory_builder()?;
        let alice = first.add_contact(ALICE)?;
        let thread = first.create_thread(&[alice], ThreadSpec::direct())?;
        let message = first.add_message(thread, MessageSpec::new(None, "hello", stamp(0)))?;

        let mut second = memory_builder()?;
        let local_alice = second.add_contact(ALICE)?;
        assert_eq!(local_alice.rowid(), alice.rowid());
        assert_ne!(local_alice, alice);

        assert!(matches!(
            second.add_message(thread, MessageSpec::new(None, "hello", stamp(0))),
            Err(FoundryError::UnknownThread(_))
        ));
        assert!(matches!(
            second.create_thread(&[alice], ThreadSpec::direct()),
            Err(FoundryError::UnknownContact(_))
        ));
        assert!(matches!(
            second.add_attachment(
                message,
                AttachmentSpec::new("image/png", AttachmentPayload::Placeholder)
            ),
            Err(FoundryError::UnknownMessage(_))
        ));
        Ok(())
    }

    #[test]
    fn explicit_guids_must_be_unique() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        let guid = "p:0/5B1E3B86-0B5A-4E57-9C83-2D0C1F1E7C11";

        builder.add_message(thread, MessageSpec::new(None, "first", stamp(0)).with_guid(guid))?;
        assert!(matches!(
            builder.add_message(thread, MessageSpec::new(None, "second", stamp(1)).with_guid(guid)),
            Err(FoundryError::DuplicateGuid { .. })
        ));

        let batch = [
            MessageSpec::new(None, "a", stamp(2)).with_guid("p:0/dup"),
            MessageSpec::new(None, "b", stamp(3)).with_guid("p:0/dup"),
        ];
        assert!(matches!(
            builder.add_messages_batch(thread, &batch),
            Err(FoundryError::DuplicateGuid { .. })
        ));
        assert_eq!(builder.message_count(thread)?, 1);
        Ok(())
    }

    #[test]
    fn failed_batches_leave_no_rows_behind() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        for hour in 0..3 {
            let warmup = MessageSpec::new(Some(alice), format!("warmup {hour}"), stamp(hour));
            builder.add_message(thread, warmup)?;
        }

        let colliding = "p:0/00000000-0000-4000-8000-000000000100";
        builder.conn.execute(
            "INSERT INTO message (guid, text) VALUES (?1, 'planted')",
            params![colliding],
        )?;
        let rows_before = count_rows(&builder, "SELECT COUNT(*) FROM message")?;

        let mut batch = (0..99)
            .map(|index| MessageSpec::new(Some(alice), format!("bulk {index}"), stamp(10 + index)))
            .collect::<Vec<_>>();
        batch.push(MessageSpec::new(None, "last", stamp(200)).with_guid(colliding));

        let result = builder.add_messages_batch(thread, &batch);
        assert!(matches!(result, Err(FoundryError::IntegrityViolation { .. })), "{result:?}");
        assert_eq!(builder.message_count(thread)?, 3);
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM message")?, rows_before);
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM chat_message_join")?, 3);

        let next =
            builder.add_message(thread, MessageSpec::new(None, "after rollback", stamp(300)))?;
        assert_eq!(sort_id_of(&builder, next)?, 4);
        Ok(())
    }

    #[test]
    fn sequence_hints_are_persisted() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        let hinted = MessageSpec::new(None, "ten", stamp(0)).with_sequence_hint(10);
        builder.add_message(thread, hinted)?;
        let next = builder.add_message(thread, MessageSpec::new(None, "eleven", stamp(1)))?;

        assert_eq!(sort_id_of(&builder, next)?, 11);
        Ok(())
    }

    #[test]
    fn out_of_order_timestamps_are_warnings() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        builder.add_message(thread, MessageSpec::new(None, "later", stamp(5)))?;
        let early =
            builder.add_message(thread, MessageSpec::new(Some(alice), "earlier", stamp(1)))?;

        let report = builder.validate()?;
        assert!(!report.has_errors());
        assert_eq!(report.count_of(ViolationKind::TimestampOrder), 1);
        assert_eq!(report.violations[0].rowids, vec![early.rowid()]);
        Ok(())
    }

    #[test]
    fn validator_reports_every_injected_violation() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let bob = builder.add_contact(BOB)?;
        let direct = builder.create_thread(&[alice], ThreadSpec::direct())?;
        let group = builder.create_thread(&[alice, bob], ThreadSpec::group(None))?;
        let first = builder.add_message(direct, MessageSpec::new(Some(alice), "one", stamp(0)))?;
        let second = builder.add_message(direct, MessageSpec::new(None, "two", stamp(1)))?;
        builder.add_message(group, MessageSpec::new(Some(bob), "three", stamp(2)))?;

        builder.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        builder.conn.execute(
            "DELETE FROM chat_message_join WHERE message_id = ?1",
            params![first.rowid()],
        )?;
        builder.conn.execute(
            "UPDATE message SET handle_id = 999 WHERE ROWID = ?1",
            params![second.rowid()],
        )?;
        builder.conn.execute("DELETE FROM chat WHERE ROWID = ?1", params![group.rowid()])?;
        builder.conn.execute("UPDATE chat SET guid = 'garbage'", [])?;

        let report = builder.validate()?;
        assert!(report.has_errors());
        assert_eq!(report.count_of(ViolationKind::OrphanRow), 1);
        assert!(report.violations.iter().any(|violation| {
            violation.kind == ViolationKind::ForeignKey
                && violation.table == "message"
                && violation.rowids == vec![second.rowid()]
        }));
        assert!(has_violation(&report, ViolationKind::ForeignKey, "chat_handle_join"));
        assert!(has_violation(&report, ViolationKind::ForeignKey, "chat_message_join"));
        assert_eq!(report.count_of(ViolationKind::MalformedGuid), 1);
        Ok(())
    }

    #[test]
    fn validating_against_a_newer_dialect_reports_structure() -> Result<()> {
        let sonoma = resolve_dialect("sonoma")?;
        let mut builder = ArtifactBuilder::open(BuilderOptions::in_memory(), &sonoma)?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        builder.add_message(thread, MessageSpec::new(None, "hi", stamp(0)))?;
        assert!(builder.validate()?.is_valid());

        let report = validate_connection(&builder.conn, &sequoia()?)?;
        assert!(report.has_errors());
        assert!(report.violations.iter().any(|violation| {
            violation.kind == ViolationKind::MissingColumn
                && violation.detail.contains("associated_message_emoji")
        }));
        assert_eq!(report.count_of(ViolationKind::MetadataMismatch), 1);
        assert_eq!(report.count_of(ViolationKind::MissingTable), 0);
        Ok(())
    }

    #[test]
    fn missing_tables_and_duplicate_keys_are_reported() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE handle (ROWID INTEGER PRIMARY KEY AUTOINCREMENT UNIQUE,
                                  id TEXT NOT NULL, country TEXT, service TEXT NOT NULL,
                                  uncanonicalized_id TEXT, person_centric_id TEXT DEFAULT NULL);
             INSERT INTO handle (id, service) VALUES ('+15551234567', 'iMessage');
             INSERT INTO handle (id, service) VALUES ('+15551234567', 'iMessage');",
        )?;

        let dialect = sequoia()?;
        let report = validate_connection(&conn, &dialect)?;
        assert_eq!(report.count_of(ViolationKind::MissingTable), dialect.tables.len() - 1);
        let duplicate = report
            .violations
            .iter()
            .find(|violation| violation.kind == ViolationKind::DuplicateKey)
            .ok_or_else(|| anyhow!("duplicate handle not reported"))?;
        assert_eq!(duplicate.table, "handle");
        assert_eq!(duplicate.rowids, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn attachments_link_to_their_message() -> Result<()> {
        let dir = temp_dir();
        let options = BuilderOptions::in_memory().with_attachment_dir(dir.join("attachments"));
        let mut builder = ArtifactBuilder::open(options, &sequoia()?)?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        let message =
            builder.add_message(thread, MessageSpec::new(Some(alice), "photo", stamp(0)))?;

        let png = AttachmentPayload::Bytes { data: vec![0x89, b'P', b'N', b'G'] };
        let inline = AttachmentSpec::new("image/png", png).with_transfer_name("pic.png");
        let attachment = builder.add_attachment(message, inline)?;
        let pending = AttachmentSpec::new("application/pdf", AttachmentPayload::Placeholder);
        builder.add_attachment(message, pending)?;

        let (filename, uti, total_bytes): (String, String, i64) = builder.conn.query_row(
            "SELECT filename, uti, total_bytes FROM attachment WHERE ROWID = ?1",
            params![attachment.rowid()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!(uti, "public.png");
        assert_eq!(total_bytes, 4);
        let written = PathBuf::from(&filename);
        assert!(written.exists());
        assert_eq!(std::fs::read(&written)?, vec![0x89, b'P', b'N', b'G']);

        assert!(builder.validate()?.is_valid());
        assert_eq!(builder.counts().attachments, 2);

        drop(builder);
        assert!(!written.exists(), "discarded session should remove attachment bytes");
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn finalize_moves_the_artifact_into_place() -> Result<()> {
        let dir = temp_dir();
        let output = dir.join("chat.db");
        let dialect = sequoia()?;

        let options = BuilderOptions::file(&output);
        let (thread_guid, summary) = ArtifactBuilder::build_with(options, &dialect, |builder| {
            let alice = builder.add_contact(ALICE)?;
            let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
            builder.add_message(thread, MessageSpec::new(Some(alice), "ping", stamp(0)))?;
            builder.add_message(thread, MessageSpec::new(None, "pong", stamp(1)))?;
            Ok::<_, FoundryError>(builder.thread_info(thread)?.guid)
        })?;

        assert_eq!(thread_guid, "iMessage;-;+15551234567");
        assert_eq!(summary.path.as_deref(), Some(output.as_path()));
        assert_eq!(summary.counts.messages, 2);
        assert_eq!(summary.client_version.as_deref(), Some("15002"));
        let digest = summary.sha256.clone().unwrap_or_default();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));

        let leftovers = std::fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".staging"))
            .count();
        assert_eq!(leftovers, 0);

        let report = validate_path(&output, &dialect)?;
        assert!(report.is_valid(), "unexpected violations: {:?}", report.violations);

        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup {}", dir.display()))?;
        Ok(())
    }

    #[test]
    fn dropped_sessions_discard_the_staging_file() -> Result<()> {
        let dir = temp_dir();
        let output = dir.join("abandoned.db");
        let staging = {
            let mut builder = ArtifactBuilder::open(BuilderOptions::file(&output), &sequoia()?)?;
            builder.add_contact(ALICE)?;
            let staging = builder
                .staging
                .staging_path()
                .map(Path::to_path_buf)
                .ok_or_else(|| anyhow!("no staging path"))?;
            assert!(staging.exists());
            staging
        };

        assert!(!staging.exists());
        assert!(!output.exists());

        let options = BuilderOptions::file(&output);
        let failed = ArtifactBuilder::build_with(options, &sequoia()?, |builder| {
            builder.add_contact(ALICE)?;
            builder.add_contact("bogus")
        });
        assert!(matches!(failed, Err(FoundryError::InvalidIdentifier { .. })));
        assert!(!output.exists());

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn in_memory_builds_can_be_backed_up_on_finalize() -> Result<()> {
        let dir = temp_dir();
        let output = dir.join("memory.db");
        let mut options = BuilderOptions::in_memory();
        options.target = ArtifactTarget::InMemory { backup_to: Some(output.clone()) };

        let mut builder = ArtifactBuilder::open(options, &sequoia()?)?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        builder.add_message(thread, MessageSpec::new(None, "saved", stamp(0)))?;
        let summary = builder.finalize()?;

        assert!(output.exists());
        assert!(summary.sha256.is_some());
        assert!(validate_path(&output, &sequoia()?)?.is_valid());

        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup {}", dir.display()))?;
        Ok(())
    }

    struct ScriptSource {
        script: Vec<ScriptedMessage>,
        requests: Vec<ConversationRequest>,
    }

    impl ConversationSource for ScriptSource {
        fn messages_for(
            &mut self,
            request: &ConversationRequest,
        ) -> Result<Vec<ScriptedMessage>, FoundryError> {
            self.requests.push(request.clone());
            Ok(self.script.iter().take(request.message_count).cloned().collect())
        }
    }

    fn scripted(sender: Option<&str>, body: &str) -> ScriptedMessage {
        ScriptedMessage { sender: sender.map(str::to_string), body: body.to_string() }
    }

    #[test]
    fn populate_thread_timestamps_and_inserts_scripted_messages() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;

        let mut source = ScriptSource {
            script: vec![
                scripted(Some("(555) 123-4567"), "lunch?"),
                scripted(None, "sure"),
                scripted(Some(ALICE), "noon"),
                scripted(None, "see you"),
            ],
            requests: Vec::new(),
        };
        let profiles = BehaviorProfiles::new().with(ALICE, LatencyClass::Minutes);
        let request = PopulateRequest {
            thread,
            message_count: 4,
            start: datetime!(2024-06-03 09:00:00 UTC),
            end: datetime!(2024-06-10 09:00:00 UTC),
            profiles: &profiles,
            distributor: DistributorConfig::default(),
            seed: 99,
        };

        let refs = populate_thread(&mut builder, &mut source, &request)?;
        assert_eq!(refs.len(), 4);
        assert_eq!(source.requests[0].participants, vec![ALICE.to_string()]);
        assert_eq!(builder.message_count(thread)?, 4);
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM message WHERE is_from_me = 1")?, 2);
        assert!(builder.validate()?.is_valid());
        Ok(())
    }

    #[test]
    fn populate_thread_rejects_strangers() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        let mut source =
            ScriptSource { script: vec![scripted(Some(BOB), "who dis")], requests: Vec::new() };
        let profiles = BehaviorProfiles::new();
        let request = PopulateRequest {
            thread,
            message_count: 1,
            start: datetime!(2024-06-03 09:00:00 UTC),
            end: datetime!(2024-06-04 09:00:00 UTC),
            profiles: &profiles,
            distributor: DistributorConfig::default(),
            seed: 1,
        };

        assert!(matches!(
            populate_thread(&mut builder, &mut source, &request),
            Err(FoundryError::SenderNotParticipant { .. })
        ));
        assert_eq!(builder.message_count(thread)?, 0);
        Ok(())
    }

    fn attachment_flag(builder: &ArtifactBuilder, message: MessageRef) -> Result<i64> {
        let flag = builder.conn.query_row(
            "SELECT cache_has_attachments FROM message WHERE ROWID = ?1",
            params![message.rowid()],
            |row| row.get(0),
        )?;
        Ok(flag)
    }

    #[test]
    fn attachments_flag_their_message() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        let plain = builder.add_message(thread, MessageSpec::new(Some(alice), "hi", stamp(0)))?;
        let photo = builder.add_message(thread, MessageSpec::new(None, "look", stamp(1)))?;

        let placeholder = AttachmentSpec::new("image/jpeg", AttachmentPayload::Placeholder);
        builder.add_attachment(photo, placeholder)?;

        assert_eq!(attachment_flag(&builder, photo)?, 1);
        assert_eq!(attachment_flag(&builder, plain)?, 0);
        Ok(())
    }

    #[test]
    fn busy_artifacts_are_retried_up_to_the_attempt_budget() -> Result<()> {
        let dir = temp_dir();
        let output = dir.join("locked.db");
        let options = BuilderOptions::file(&output).with_retry_attempts(3);
        let mut builder = ArtifactBuilder::open(options, &sequoia()?)?;
        builder.conn.busy_timeout(Duration::from_millis(10))?;

        let staging = builder
            .staging
            .staging_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("no staging path"))?;
        let locker = Connection::open(&staging)?;
        locker.execute_batch("BEGIN EXCLUSIVE;")?;

        match builder.add_contact(ALICE) {
            Err(FoundryError::DurableIo { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected a durable io failure, got {other:?}"),
        }

        locker.execute_batch("COMMIT;")?;
        drop(locker);
        builder.add_contact(ALICE)?;
        assert_eq!(count_rows(&builder, "SELECT COUNT(*) FROM handle")?, 1);
        assert_eq!(builder.counts().contacts, 1);

        drop(builder);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn transient_failures_recover_on_a_later_attempt() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        let mut calls = 0;
        let value = with_retry(&mut conn, 3, "insert message", |_| {
            calls += 1;
            if calls == 1 {
                let busy = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
                return Err(rusqlite::Error::SqliteFailure(busy, None));
            }
            Ok(7)
        })?;
        assert_eq!((value, calls), (7, 2));
        Ok(())
    }

    #[test]
    fn constraint_failures_are_not_retried() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE handle (id TEXT UNIQUE);
             INSERT INTO handle VALUES ('dup');",
        )?;

        let mut calls = 0;
        let result = with_retry(&mut conn, 5, "insert handle", |conn| {
            calls += 1;
            conn.execute("INSERT INTO handle (id) VALUES ('dup')", [])
        });
        assert!(matches!(result, Err(FoundryError::IntegrityViolation { .. })), "{result:?}");
        assert_eq!(calls, 1);
        Ok(())
    }

    #[test]
    fn mistyped_cells_are_reported_instead_of_aborting() -> Result<()> {
        let mut builder = memory_builder()?;
        let alice = builder.add_contact(ALICE)?;
        let thread = builder.create_thread(&[alice], ThreadSpec::direct())?;
        builder.add_message(thread, MessageSpec::new(Some(alice), "one", stamp(0)))?;
        let odd = builder.add_message(thread, MessageSpec::new(None, "two", stamp(1)))?;

        builder.conn.execute(
            "UPDATE message SET date = 'yesterday' WHERE ROWID = ?1",
            params![odd.rowid()],
        )?;
        builder.conn.execute(
            "UPDATE chat SET guid = X'00FF' WHERE ROWID = ?1",
            params![thread.rowid()],
        )?;

        let report = builder.validate()?;
        assert!(report.violations.iter().any(|violation| {
            violation.kind == ViolationKind::TimestampOrder && violation.rowids == vec![odd.rowid()]
        }));
        assert!(report.violations.iter().any(|violation| {
            violation.kind == ViolationKind::MalformedGuid
                && violation.table == "chat"
                && violation.rowids == vec![thread.rowid()]
        }));
        Ok(())
    }
}
