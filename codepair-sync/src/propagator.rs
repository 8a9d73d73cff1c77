//! Origin-tagged application of document and language changes.
//!
//! Every change enters through [`UpdatePropagator::ingest`] tagged with where
//! it came from. Only local edits produce outbound effects, so applying a
//! remote update can never echo back onto the bus.
//!
//! ```text
//! LocalEdit(Document)  ──► apply ──► Publish(code-update) + SchedulePersist
//! LocalEdit(Language)  ──► apply ──► Publish(language-update)
//!                                    (+ PersistLanguage if creator)
//! RemoteEdit { .. }    ──► apply ──► nothing
//! Snapshot { .. }      ──► apply ──► nothing
//! ```

use uuid::Uuid;

use crate::language::Language;
use crate::protocol::BroadcastMessage;

/// A change to the shared document state.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    Document(String),
    Language(Language),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    LocalEdit(Edit),
    RemoteEdit { origin_id: Uuid, edit: Edit },
    /// Stored state loaded on join.
    Snapshot { content: String, language: Language },
}

impl Mutation {
    /// Remote mutation carried by a broadcast, if it touches the document.
    pub fn from_broadcast(message: BroadcastMessage) -> Option<Self> {
        match message {
            BroadcastMessage::CodeUpdate { content, origin_id } => Some(Mutation::RemoteEdit {
                origin_id,
                edit: Edit::Document(content),
            }),
            BroadcastMessage::LanguageUpdate { language, origin_id } => Some(Mutation::RemoteEdit {
                origin_id,
                edit: Edit::Language(language),
            }),
            BroadcastMessage::CursorUpdate { .. } => None,
        }
    }
}

/// Side effect the session must carry out after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(BroadcastMessage),
    SchedulePersist,
    PersistLanguage(Language),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentState {
    pub content: String,
    pub language: Language,
}

/// Applies mutations to the local document and decides what to broadcast.
#[derive(Debug)]
pub struct UpdatePropagator {
    local_id: Uuid,
    is_creator: bool,
    document: DocumentState,
    echoes_discarded: u64,
}

impl UpdatePropagator {
    pub fn new(local_id: Uuid, is_creator: bool) -> Self {
        Self {
            local_id,
            is_creator,
            document: DocumentState::default(),
            echoes_discarded: 0,
        }
    }

    pub fn document(&self) -> &DocumentState {
        &self.document
    }

    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    pub fn echoes_discarded(&self) -> u64 {
        self.echoes_discarded
    }

    pub fn ingest(&mut self, mutation: Mutation) -> Vec<Effect> {
        match mutation {
            Mutation::LocalEdit(edit) => self.apply_local(edit),
            Mutation::RemoteEdit { origin_id, .. } if origin_id == self.local_id => {
                self.echoes_discarded += 1;
                log::debug!("discarding echo of own update");
                Vec::new()
            }
            Mutation::RemoteEdit { edit, .. } => {
                self.apply(edit);
                Vec::new()
            }
            Mutation::Snapshot { content, language } => {
                self.document = DocumentState { content, language };
                Vec::new()
            }
        }
    }

    fn apply_local(&mut self, edit: Edit) -> Vec<Effect> {
        // An editor re-emitting the value it was just given is not a new edit.
        let unchanged = match &edit {
            Edit::Document(content) => *content == self.document.content,
            Edit::Language(language) => *language == self.document.language,
        };
        if unchanged {
            return Vec::new();
        }

        self.apply(edit.clone());
        match edit {
            Edit::Document(content) => vec![
                Effect::Publish(BroadcastMessage::CodeUpdate {
                    content,
                    origin_id: self.local_id,
                }),
                Effect::SchedulePersist,
            ],
            Edit::Language(language) => {
                let mut effects = vec![Effect::Publish(BroadcastMessage::LanguageUpdate {
                    language,
                    origin_id: self.local_id,
                })];
                if self.is_creator {
                    effects.push(Effect::PersistLanguage(language));
                }
                effects
            }
        }
    }

    fn apply(&mut self, edit: Edit) {
        match edit {
            Edit::Document(content) => self.document.content = content,
            Edit::Language(language) => self.document.language = language,
        }
    }
}
