//! # Chunk Assembler
//!
//! Attachments too large for one broker message are uploaded as chunks
//! ahead of a finalize message. Chunks land in the [`AttachmentCache`] under
//! the event-scoped [`CacheKey`]; the finalize message reassembles them in
//! ascending `chunk_index` order, persists the result and releases the
//! chunks.
//!
//! ## Cache Layout:
//!
//! - `{cache_key}:a` holds the JSON list of descriptors cached with an event.
//! - `{cache_key}:a:{id}:{chunk_index}` holds one chunk.
//!
//! Both entry points are safe to replay. Appending a chunk overwrites the
//! same key with the same bytes. Replaying a finalize after its chunks were
//! released finds the first chunk missing and is consumed as
//! [`AttachmentOutcome::Incomplete`].

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use crate::collaborators::{AttachmentStore, CacheBackend, EventLookup};
use crate::core::effects::bounded;
use crate::core::killswitch::{KillswitchContext, KillswitchStore, LOAD_SHED_PIPELINE};
use crate::error::{CollaboratorError, IngestError};
use crate::model::{
    Attachment, AttachmentDescriptor, AttachmentMessage, AttachmentType, CacheKey, ChunkMessage, Project,
};

/// # Attachment Cache
///
/// Short-lived storage for attachment descriptors and chunks.
#[derive(Clone)]
pub struct AttachmentCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    timeout: Duration,
}

impl AttachmentCache {
    /// Creates the cache. Entries expire after `ttl`; every call is bounded
    /// by `timeout`.
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration, timeout: Duration) -> Self {
        Self { backend, ttl, timeout }
    }

    fn descriptors_key(key: &CacheKey) -> String {
        format!("{}:a", key)
    }

    fn chunk_key(key: &CacheKey, id: &str, chunk_index: u32) -> String {
        format!("{}:a:{}:{}", key, id, chunk_index)
    }

    /// Caches the descriptors submitted with an event.
    pub async fn set(&self, key: &CacheKey, attachments: &[AttachmentDescriptor]) -> Result<(), CollaboratorError> {
        let value = Bytes::from(serde_json::to_vec(attachments)?);
        let cache_key = Self::descriptors_key(key);
        bounded(
            "attachments.set",
            self.timeout,
            self.backend.set(&cache_key, value, self.ttl),
        )
        .await
    }

    /// Reads the descriptors cached with an event; empty when none were.
    pub async fn get(&self, key: &CacheKey) -> Result<Vec<AttachmentDescriptor>, CollaboratorError> {
        let cache_key = Self::descriptors_key(key);
        match bounded("attachments.get", self.timeout, self.backend.get(&cache_key)).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Stores one chunk. No ordering or completeness check.
    pub async fn set_chunk(
        &self,
        key: &CacheKey,
        id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<(), CollaboratorError> {
        let cache_key = Self::chunk_key(key, id, chunk_index);
        bounded(
            "attachments.set_chunk",
            self.timeout,
            self.backend.set(&cache_key, data, self.ttl),
        )
        .await
    }

    /// Assembles an attachment. Inline data is used as-is; otherwise chunks
    /// `0..chunks` are read and concatenated in index order. A gap fails with
    /// [`CollaboratorError::MissingChunk`].
    pub async fn get_from_chunks(
        &self,
        key: &CacheKey,
        descriptor: &AttachmentDescriptor,
    ) -> Result<Attachment, CollaboratorError> {
        let data = match &descriptor.data {
            Some(inline) => inline.clone(),
            None => {
                let mut buffer = BytesMut::new();
                for chunk_index in 0..descriptor.chunks {
                    let cache_key = Self::chunk_key(key, &descriptor.id, chunk_index);
                    let chunk = bounded("attachments.get_chunk", self.timeout, self.backend.get(&cache_key))
                        .await?
                        .ok_or_else(|| CollaboratorError::MissingChunk {
                            id: descriptor.id.clone(),
                            chunk_index,
                        })?;
                    buffer.extend_from_slice(&chunk);
                }
                buffer.freeze()
            }
        };

        Ok(Attachment {
            attachment_type: descriptor.attachment_type.clone(),
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            content_type: descriptor.content_type.clone(),
            data,
            chunks: if descriptor.data.is_some() { 0 } else { descriptor.chunks },
        })
    }

    /// Releases the chunks an attachment was assembled from.
    pub async fn delete(&self, key: &CacheKey, attachment: &Attachment) -> Result<(), CollaboratorError> {
        if attachment.chunks == 0 {
            return Ok(());
        }
        let keys: Vec<String> = (0..attachment.chunks)
            .map(|idx| Self::chunk_key(key, &attachment.id, idx))
            .collect();
        bounded("attachments.delete", self.timeout, self.backend.delete(&keys)).await
    }
}

/// How an individual attachment finalize ended. Every variant consumes the
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentOutcome {
    /// Assembled and persisted.
    Saved,
    /// The organization may not store attachments.
    NotEntitled,
    /// Dropped by a killswitch.
    Shed,
    /// A chunk was missing; nothing was persisted.
    Incomplete,
    /// The declared type may not be finalized individually.
    Discarded,
}

/// # Chunk Assembler
///
/// Handles attachment chunks and individual attachment finalize messages.
pub struct ChunkAssembler {
    cache: AttachmentCache,
    lookup: Arc<dyn EventLookup>,
    store: Arc<dyn AttachmentStore>,
    killswitches: KillswitchStore,
    timeout: Duration,
}

impl ChunkAssembler {
    /// Creates the assembler.
    pub fn new(
        cache: AttachmentCache,
        lookup: Arc<dyn EventLookup>,
        store: Arc<dyn AttachmentStore>,
        killswitches: KillswitchStore,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            lookup,
            store,
            killswitches,
            timeout,
        }
    }

    /// Appends one chunk. Never fails for a missing predecessor.
    pub async fn process_attachment_chunk(&self, message: &ChunkMessage) -> Result<(), IngestError> {
        let cache_key = CacheKey::for_event(message.project_id, &message.event_id);
        self.cache
            .set_chunk(&cache_key, &message.id, message.chunk_index, message.payload.clone())
            .await?;
        debug!(
            event_id = %message.event_id,
            attachment_id = %message.id,
            chunk_index = message.chunk_index,
            "attachment chunk cached"
        );
        Ok(())
    }

    /// Finalizes one attachment uploaded separately from its event.
    pub async fn process_individual_attachment(
        &self,
        message: &AttachmentMessage,
        project: &Project,
    ) -> Result<AttachmentOutcome, IngestError> {
        let event_id = message.event_id.as_str();
        let cache_key = CacheKey::for_event(project.id, event_id);

        if !project.features.event_attachments {
            info!(project_id = project.id, "organization has no event attachments");
            return Ok(AttachmentOutcome::NotEntitled);
        }

        let ctx = KillswitchContext::pre_parse(project.id, event_id, true);
        if self.killswitches.matches(LOAD_SHED_PIPELINE, &ctx) {
            return Ok(AttachmentOutcome::Shed);
        }

        // The event may not be stored yet; an unknown group is fine.
        let group_id = match bounded(
            "events.group_id",
            self.timeout,
            self.lookup.group_id(project.id, event_id),
        )
        .await
        {
            Ok(group_id) => group_id,
            Err(CollaboratorError::RateLimited(reason)) => {
                warn!(project_id = project.id, event_id, %reason, "group lookup rate limited");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let descriptor = &message.attachment;
        let attachment = match self.cache.get_from_chunks(&cache_key, descriptor).await {
            Ok(attachment) => attachment,
            Err(CollaboratorError::MissingChunk { id, chunk_index }) => {
                warn!(
                    project_id = project.id,
                    event_id,
                    attachment_id = %id,
                    chunk_index,
                    "attachment incomplete, dropping finalize"
                );
                return Ok(AttachmentOutcome::Incomplete);
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match AttachmentType::parse(&descriptor.attachment_type) {
            Some(kind) if kind.is_individually_persistable() => {
                bounded(
                    "attachments.save",
                    self.timeout,
                    self.store.save(&cache_key, &attachment, project, event_id, group_id),
                )
                .await?;
                AttachmentOutcome::Saved
            }
            _ => {
                error!(
                    attachment_type = %descriptor.attachment_type,
                    project_id = project.id,
                    event_id,
                    "invalid individual attachment type"
                );
                AttachmentOutcome::Discarded
            }
        };

        if let Err(e) = self.cache.delete(&cache_key, &attachment).await {
            warn!(event_id, attachment_id = %attachment.id, error = %e, "failed to release attachment chunks");
        }

        Ok(outcome)
    }
}
