use std::collections::BTreeMap;

use crate::{
    EntityKind, FeedbackQuestion, FeedbackResponse, FeedbackResponseComment, IdRemapCache,
    QuestionId, QuestionKey, QuestionLookup, RestoreError,
};

/// A record that points at a feedback question by surrogate id.
pub trait QuestionReference {
    const KIND: EntityKind;

    fn question_id(&self) -> &QuestionId;

    fn set_question_id(&mut self, id: QuestionId);
}

impl QuestionReference for FeedbackResponse {
    const KIND: EntityKind = EntityKind::FeedbackResponse;

    fn question_id(&self) -> &QuestionId {
        &self.feedback_question_id
    }

    fn set_question_id(&mut self, id: QuestionId) {
        self.feedback_question_id = id;
    }
}

impl QuestionReference for FeedbackResponseComment {
    const KIND: EntityKind = EntityKind::FeedbackResponseComment;

    fn question_id(&self) -> &QuestionId {
        &self.feedback_question_id
    }

    fn set_question_id(&mut self, id: QuestionId) {
        self.feedback_question_id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedRecord {
    pub kind: EntityKind,
    /// Bundle-local key of the record.
    pub key: String,
    pub error: RestoreError,
}

#[derive(Debug, Clone)]
pub struct Repaired<T> {
    pub records: Vec<T>,
    pub dropped: Vec<DroppedRecord>,
}

impl<T> Default for Repaired<T> {
    fn default() -> Self {
        Self { records: Vec::new(), dropped: Vec::new() }
    }
}

/// Rewrites question references from source ids to destination ids.
///
/// The parent question is located in the bundle's own question collection,
/// which yields the natural key the cache resolves against the destination.
#[derive(Debug)]
pub struct ReferenceRepairer<'a> {
    questions: BTreeMap<&'a QuestionId, QuestionKey>,
}

impl<'a> ReferenceRepairer<'a> {
    #[must_use]
    pub fn new(questions: &'a BTreeMap<String, FeedbackQuestion>) -> Self {
        let questions = questions
            .values()
            .filter_map(|question| {
                question.surrogate_id.as_ref().map(|id| (id, question.natural_key()))
            })
            .collect();
        Self { questions }
    }

    /// Rewrite one record's question reference in place.
    ///
    /// # Errors
    /// [`RestoreError::BrokenIntraBundleReference`] when the parent question
    /// is not in the bundle, otherwise whatever [`IdRemapCache::resolve`] reports.
    pub fn repair<T, L>(
        &self,
        record_key: &str,
        record: &mut T,
        cache: &mut IdRemapCache,
        lookup: &L,
    ) -> Result<(), RestoreError>
    where
        T: QuestionReference,
        L: QuestionLookup + ?Sized,
    {
        let source_id = record.question_id().clone();
        let Some(key) = self.questions.get(&source_id) else {
            return Err(RestoreError::BrokenIntraBundleReference {
                record: format!("{} {record_key}", T::KIND),
                source_id,
            });
        };
        let destination_id = cache.resolve(&source_id, key, lookup)?;
        record.set_question_id(destination_id);
        Ok(())
    }

    /// Repair every record, separating the ones that could not be repaired.
    pub fn repair_all<T, L>(
        &self,
        records: &BTreeMap<String, T>,
        cache: &mut IdRemapCache,
        lookup: &L,
    ) -> Repaired<T>
    where
        T: QuestionReference + Clone,
        L: QuestionLookup + ?Sized,
    {
        let mut repaired = Repaired::default();
        for (record_key, record) in records {
            let mut record = record.clone();
            match self.repair(record_key, &mut record, cache, lookup) {
                Ok(()) => repaired.records.push(record),
                Err(error) => repaired.dropped.push(DroppedRecord {
                    kind: T::KIND,
                    key: record_key.clone(),
                    error,
                }),
            }
        }
        repaired
    }
}
