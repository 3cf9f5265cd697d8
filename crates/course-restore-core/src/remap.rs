use std::collections::BTreeMap;

use crate::{QuestionId, QuestionKey, RestoreError};

/// Natural-key lookup against the destination store.
pub trait QuestionLookup {
    /// # Errors
    /// [`RestoreError::Destination`] when the lookup itself fails.
    fn find_feedback_question(&self, key: &QuestionKey) -> Result<Option<QuestionId>, RestoreError>;
}

/// Per-file memo table translating source question ids to destination ids.
///
/// Each file gets a fresh (or [`reset`](Self::reset)) cache so translations
/// never leak across files or shards.
#[derive(Debug, Default)]
pub struct IdRemapCache {
    by_source: BTreeMap<QuestionId, QuestionId>,
    by_key: BTreeMap<QuestionKey, QuestionId>,
    lookups: usize,
}

impl IdRemapCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.by_source.clear();
        self.by_key.clear();
        self.lookups = 0;
    }

    /// Translate `source_id` by resolving `key` against the destination.
    ///
    /// A source id or natural key already resolved in this file is answered
    /// from memory; only the first sighting reaches `lookup`.
    ///
    /// # Errors
    /// Returns [`RestoreError::UnresolvableReference`] when the destination has
    /// no question for `key`, or the lookup's own error.
    pub fn resolve<L>(
        &mut self,
        source_id: &QuestionId,
        key: &QuestionKey,
        lookup: &L,
    ) -> Result<QuestionId, RestoreError>
    where
        L: QuestionLookup + ?Sized,
    {
        if let Some(known) = self.by_source.get(source_id) {
            return Ok(known.clone());
        }

        let destination_id = if let Some(known) = self.by_key.get(key) {
            known.clone()
        } else {
            self.lookups += 1;
            let found = lookup.find_feedback_question(key)?.ok_or_else(|| {
                RestoreError::UnresolvableReference { source_id: source_id.clone(), key: key.clone() }
            })?;
            self.by_key.insert(key.clone(), found.clone());
            found
        };

        self.by_source.insert(source_id.clone(), destination_id.clone());
        Ok(destination_id)
    }

    #[must_use]
    pub fn get(&self, source_id: &QuestionId) -> Option<&QuestionId> {
        self.by_source.get(source_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    /// Number of destination lookups since the last reset.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups
    }
}
