use std::collections::BTreeMap;

use course_restore_core::{
    DataBundle, Destination, DroppedRecord, EntityKind, FeedbackQuestion, IdRemapCache, Phase,
    PhaseState, QuestionId, QuestionKey, QuestionLookup, ReferenceRepairer, RestoreError,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Nothing to persist for this phase.
    Skipped,
    Persisted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchFailure {
    pub kind: EntityKind,
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub attempted: usize,
    pub persisted: usize,
    pub failures: Vec<BatchFailure>,
}

impl PhaseOutcome {
    fn new(phase: Phase) -> Self {
        Self { phase, status: PhaseStatus::Skipped, attempted: 0, persisted: 0, failures: Vec::new() }
    }

    fn record_batch(&mut self, kind: EntityKind, attempted: usize, result: Result<usize, RestoreError>) {
        self.attempted += attempted;
        match result {
            Ok(persisted) => {
                self.persisted += persisted;
                if self.status == PhaseStatus::Skipped {
                    self.status = PhaseStatus::Persisted;
                }
            }
            Err(err) => {
                tracing::warn!("Error in uploading {}: {}", kind, err);
                self.status = PhaseStatus::Failed;
                self.failures.push(BatchFailure {
                    kind,
                    category: err.category().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
}

/// A single record left out of its batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordDiagnostic {
    pub phase: Phase,
    pub kind: EntityKind,
    pub key: String,
    pub category: String,
    pub message: String,
}

impl RecordDiagnostic {
    fn from_dropped(phase: Phase, dropped: DroppedRecord) -> Self {
        Self {
            phase,
            kind: dropped.kind,
            key: dropped.key,
            category: dropped.error.category().to_string(),
            message: dropped.error.to_string(),
        }
    }
}

/// Result of running every phase over one bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOutcome {
    pub state: PhaseState,
    pub phases: Vec<PhaseOutcome>,
    pub records: Vec<RecordDiagnostic>,
}

impl FileOutcome {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.records.is_empty()
            && self.phases.iter().all(|phase| phase.status != PhaseStatus::Failed)
    }

    #[must_use]
    pub fn failed_phases(&self) -> Vec<Phase> {
        self.phases
            .iter()
            .filter(|outcome| outcome.status == PhaseStatus::Failed)
            .map(|outcome| outcome.phase)
            .collect()
    }

    #[must_use]
    pub fn phase(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|outcome| outcome.phase == phase)
    }
}

/// Questions persisted by phase 6 of the current file, consulted before the
/// destination itself.
struct PersistedQuestions<'a, D: ?Sized> {
    persisted: &'a BTreeMap<QuestionKey, QuestionId>,
    destination: &'a D,
}

impl<D: QuestionLookup + ?Sized> QuestionLookup for PersistedQuestions<'_, D> {
    fn find_feedback_question(&self, key: &QuestionKey) -> Result<Option<QuestionId>, RestoreError> {
        if let Some(id) = self.persisted.get(key) {
            return Ok(Some(id.clone()));
        }
        tracing::debug!("question {} not persisted by this file, asking destination", key);
        self.destination.find_feedback_question(key)
    }
}

/// Persists one bundle into a destination in dependency order.
pub struct BundlePersister<'a, D: ?Sized> {
    destination: &'a mut D,
}

impl<'a, D: Destination + ?Sized> BundlePersister<'a, D> {
    pub fn new(destination: &'a mut D) -> Self {
        Self { destination }
    }

    /// Run all nine phases. Failures are recorded in the outcome and never
    /// stop later phases.
    pub fn persist(&mut self, bundle: &DataBundle, cache: &mut IdRemapCache) -> FileOutcome {
        let repairer = ReferenceRepairer::new(&bundle.feedback_questions);
        let mut persisted_questions = BTreeMap::new();
        let mut outcome =
            FileOutcome { state: PhaseState::Loaded, phases: Vec::new(), records: Vec::new() };

        while let Some(phase) = outcome.state.pending_phase() {
            let mut phase_outcome = PhaseOutcome::new(phase);
            match phase {
                Phase::Accounts => {
                    let records = bundle.accounts.values().cloned().collect::<Vec<_>>();
                    self.batch(&mut phase_outcome, EntityKind::Account, &records, |d, r| {
                        d.create_accounts(r)
                    });
                }
                Phase::Courses => {
                    let records = bundle.courses.values().cloned().collect::<Vec<_>>();
                    self.batch(&mut phase_outcome, EntityKind::Course, &records, |d, r| {
                        d.create_courses(r)
                    });
                }
                Phase::Instructors => {
                    let records = bundle.instructors.values().cloned().collect::<Vec<_>>();
                    self.batch(&mut phase_outcome, EntityKind::Instructor, &records, |d, r| {
                        d.create_instructors(r)
                    });
                }
                Phase::Students => {
                    let records = bundle.students.values().cloned().collect::<Vec<_>>();
                    self.batch(&mut phase_outcome, EntityKind::Student, &records, |d, r| {
                        d.create_students(r)
                    });
                }
                Phase::FeedbackSessions => {
                    let records = bundle.feedback_sessions.values().cloned().collect::<Vec<_>>();
                    self.batch(&mut phase_outcome, EntityKind::FeedbackSession, &records, |d, r| {
                        d.create_feedback_sessions(r)
                    });
                }
                Phase::FeedbackQuestions => {
                    cache.reset();
                    self.persist_questions(
                        bundle,
                        &mut phase_outcome,
                        &mut outcome.records,
                        &mut persisted_questions,
                    );
                }
                Phase::FeedbackResponses => {
                    let lookup = PersistedQuestions {
                        persisted: &persisted_questions,
                        destination: &*self.destination,
                    };
                    let repaired = repairer.repair_all(&bundle.feedback_responses, cache, &lookup);
                    outcome.records.extend(
                        repaired.dropped.into_iter().map(|d| RecordDiagnostic::from_dropped(phase, d)),
                    );
                    self.batch(
                        &mut phase_outcome,
                        EntityKind::FeedbackResponse,
                        &repaired.records,
                        |d, r| d.create_feedback_responses(r),
                    );
                }
                Phase::Comments => {
                    let lookup = PersistedQuestions {
                        persisted: &persisted_questions,
                        destination: &*self.destination,
                    };
                    let repaired =
                        repairer.repair_all(&bundle.feedback_response_comments, cache, &lookup);
                    outcome.records.extend(
                        repaired.dropped.into_iter().map(|d| RecordDiagnostic::from_dropped(phase, d)),
                    );
                    self.batch(
                        &mut phase_outcome,
                        EntityKind::FeedbackResponseComment,
                        &repaired.records,
                        |d, r| d.create_feedback_response_comments(r),
                    );

                    let comments = bundle.comments.values().cloned().collect::<Vec<_>>();
                    self.batch(&mut phase_outcome, EntityKind::Comment, &comments, |d, r| {
                        d.create_comments(r)
                    });
                }
                Phase::Profiles => {
                    let records = bundle.profiles.values().cloned().collect::<Vec<_>>();
                    self.batch(&mut phase_outcome, EntityKind::StudentProfile, &records, |d, r| {
                        d.create_student_profiles(r)
                    });
                }
            }
            outcome.phases.push(phase_outcome);
            outcome.state = outcome.state.next();
        }

        outcome.state = outcome.state.next();
        outcome
    }

    fn batch<T>(
        &mut self,
        outcome: &mut PhaseOutcome,
        kind: EntityKind,
        records: &[T],
        create: impl FnOnce(&mut D, &[T]) -> Result<usize, RestoreError>,
    ) {
        if records.is_empty() {
            return;
        }
        let result = create(&mut *self.destination, records);
        outcome.record_batch(kind, records.len(), result);
    }

    fn persist_questions(
        &mut self,
        bundle: &DataBundle,
        outcome: &mut PhaseOutcome,
        records: &mut Vec<RecordDiagnostic>,
        persisted: &mut BTreeMap<QuestionKey, QuestionId>,
    ) {
        if bundle.feedback_questions.is_empty() {
            return;
        }

        let mut ready: Vec<FeedbackQuestion> = Vec::new();
        for (key, question) in &bundle.feedback_questions {
            match self.destination.feedback_session_exists(&question.session_name, &question.course_id)
            {
                Ok(true) => ready.push(question.clone()),
                Ok(false) => {
                    let err = RestoreError::MissingSession {
                        session_name: question.session_name.clone(),
                        course_id: question.course_id.clone(),
                    };
                    tracing::warn!("{}", err);
                    records.push(RecordDiagnostic::from_dropped(
                        Phase::FeedbackQuestions,
                        DroppedRecord { kind: EntityKind::FeedbackQuestion, key: key.clone(), error: err },
                    ));
                }
                Err(err) => {
                    records.push(RecordDiagnostic::from_dropped(
                        Phase::FeedbackQuestions,
                        DroppedRecord { kind: EntityKind::FeedbackQuestion, key: key.clone(), error: err },
                    ));
                }
            }
        }

        outcome.attempted += bundle.feedback_questions.len() - ready.len();
        if ready.is_empty() {
            outcome.status = PhaseStatus::Failed;
            return;
        }
        let result = self.destination.create_feedback_questions(&ready).map(|ids| {
            let count = ids.len();
            persisted.extend(ids);
            count
        });
        outcome.record_batch(EntityKind::FeedbackQuestion, ready.len(), result);
    }
}
