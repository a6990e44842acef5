//! Filling a thread from an external conversation source.

use foundry_core::{
    normalize_identifier, BehaviorProfiles, ContactRef, ConversationRequest, ConversationSource,
    DistributorConfig, FoundryError, MessageRef, MessageSpec, TemporalDistributor, ThreadRef,
};
use time::OffsetDateTime;

use crate::ArtifactBuilder;

#[derive(Debug, Clone)]
pub struct PopulateRequest<'a> {
    pub thread: ThreadRef,
    pub message_count: usize,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub profiles: &'a BehaviorProfiles,
    pub distributor: DistributorConfig,
    pub seed: u64,
}

/// Ask `source` for the thread's messages, timestamp them with the temporal
/// distributor over the actual sender sequence, and insert them as one batch.
///
/// # Errors
/// Returns source errors unchanged, [`FoundryError::SenderNotParticipant`]
/// when the source names someone outside the thread, distributor errors for
/// bad windows or tuning, and any batch insert error.
pub fn populate_thread(
    builder: &mut ArtifactBuilder,
    source: &mut dyn ConversationSource,
    request: &PopulateRequest<'_>,
) -> Result<Vec<MessageRef>, FoundryError> {
    let info = builder.thread_info(request.thread)?;
    let conversation = ConversationRequest {
        thread_guid: info.guid.clone(),
        participants: info
            .participants
            .iter()
            .map(|contact| contact.identifier.canonical.clone())
            .collect(),
        message_count: request.message_count,
    };
    let scripted = source.messages_for(&conversation)?;
    if scripted.is_empty() {
        return Ok(Vec::new());
    }

    let mut senders: Vec<Option<ContactRef>> = Vec::with_capacity(scripted.len());
    let mut classes = Vec::with_capacity(scripted.len());
    for message in &scripted {
        match message.sender.as_deref() {
            None => {
                senders.push(None);
                classes.push(request.profiles.class_for_sender(None));
            }
            Some(raw) => {
                let canonical = normalize_identifier(raw)?.canonical;
                let contact = info
                    .participants
                    .iter()
                    .find(|contact| contact.identifier.canonical == canonical)
                    .ok_or_else(|| FoundryError::SenderNotParticipant {
                        contact: raw.to_string(),
                        thread: info.guid.clone(),
                    })?;
                senders.push(Some(contact.contact_ref));
                classes.push(request.profiles.class_for_sender(Some(&canonical)));
            }
        }
    }

    let mut distributor = TemporalDistributor::new(request.distributor.clone(), request.seed)?;
    let timestamps = distributor.distribute(&classes, request.start, request.end)?;
    let specs = scripted
        .into_iter()
        .zip(senders)
        .zip(timestamps)
        .map(|((message, sender), timestamp)| MessageSpec::new(sender, message.body, timestamp))
        .collect::<Vec<_>>();

    tracing::debug!(
        thread = %info.guid,
        messages = specs.len(),
        "populating thread from conversation source"
    );
    builder.add_messages_batch(request.thread, &specs)
}
