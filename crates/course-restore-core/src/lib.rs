use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

mod bundle;
mod phase;
mod remap;
mod repair;

pub use bundle::{load_bundle, load_bundle_file, DataBundle};
pub use phase::{Phase, PhaseState};
pub use remap::{IdRemapCache, QuestionLookup};
pub use repair::{DroppedRecord, QuestionReference, ReferenceRepairer, Repaired};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RestoreError {
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),
    #[error("invalid parameters for {kind}: {detail}")]
    InvalidParameters { kind: EntityKind, detail: String },
    #[error("unresolvable reference: question {source_id} ({key}) has no persisted counterpart")]
    UnresolvableReference { source_id: QuestionId, key: QuestionKey },
    #[error(
        "broken intra-bundle reference: {record} points at question {source_id} which is not in the bundle"
    )]
    BrokenIntraBundleReference { record: String, source_id: QuestionId },
    #[error("error finding session {session_name}:{course_id}")]
    MissingSession { session_name: String, course_id: String },
    #[error("destination error: {0}")]
    Destination(String),
}

impl RestoreError {
    fn invalid(kind: EntityKind, detail: impl Into<String>) -> Self {
        Self::InvalidParameters { kind, detail: detail.into() }
    }

    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::MalformedBundle(_) => "malformed_bundle",
            Self::InvalidParameters { .. } => "invalid_parameters",
            Self::UnresolvableReference { .. } => "unresolvable_reference",
            Self::BrokenIntraBundleReference { .. } => "broken_intra_bundle_reference",
            Self::MissingSession { .. } => "missing_session",
            Self::Destination(_) => "destination",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Course,
    Instructor,
    Student,
    FeedbackSession,
    FeedbackQuestion,
    FeedbackResponse,
    FeedbackResponseComment,
    Comment,
    StudentProfile,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Course => "course",
            Self::Instructor => "instructor",
            Self::Student => "student",
            Self::FeedbackSession => "feedback_session",
            Self::FeedbackQuestion => "feedback_question",
            Self::FeedbackResponse => "feedback_response",
            Self::FeedbackResponseComment => "feedback_response_comment",
            Self::Comment => "comment",
            Self::StudentProfile => "student_profile",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surrogate identifier of a feedback question.
///
/// Values read from a bundle belong to the store that captured it; values
/// returned by a [`Destination`] belong to the destination store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct QuestionId(pub String);

impl QuestionId {
    /// Mint a fresh destination-side identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for QuestionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for QuestionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable business key of a feedback question.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QuestionKey {
    pub session_name: String,
    pub course_id: String,
    pub question_number: u32,
}

impl QuestionKey {
    #[must_use]
    pub fn new(session_name: &str, course_id: &str, question_number: u32) -> Self {
        Self {
            session_name: session_name.to_string(),
            course_id: course_id.to_string(),
            question_number,
        }
    }
}

impl Display for QuestionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}#{}", self.session_name, self.course_id, self.question_number)
    }
}

/// Free text that older bundles wrap as `{"value": "..."}`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TextValue(pub String);

impl TextValue {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for TextValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TextValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped {
            value: String,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Plain(String),
            Wrapped(Wrapped),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Plain(value) | Raw::Wrapped(Wrapped { value }) => Ok(Self(value)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub google_id: String,
    pub name: String,
    pub email: String,
    pub institute: String,
    pub is_instructor: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Course {
    pub id: String,
    pub name: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Instructor {
    pub google_id: Option<String>,
    pub course_id: String,
    pub name: String,
    pub email: String,
    pub role: Option<String>,
    pub is_archived: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Student {
    #[serde(alias = "courseId")]
    pub course: String,
    pub email: String,
    pub name: String,
    pub google_id: Option<String>,
    pub team: String,
    pub section: Option<String>,
    pub comments: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackSession {
    #[serde(rename = "feedbackSessionName", alias = "sessionName")]
    pub session_name: String,
    pub course_id: String,
    pub creator_email: Option<String>,
    pub instructions: Option<TextValue>,
    pub created_time: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub session_visible_from_time: Option<String>,
    pub results_visible_from_time: Option<String>,
    pub time_zone: Option<f64>,
    pub grace_period: Option<i64>,
    pub responding_instructor_list: Vec<String>,
    pub responding_student_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackQuestion {
    #[serde(rename = "feedbackQuestionId", alias = "id")]
    pub surrogate_id: Option<QuestionId>,
    #[serde(rename = "feedbackSessionName", alias = "sessionName")]
    pub session_name: String,
    pub course_id: String,
    pub question_number: u32,
    pub question_text: TextValue,
    pub question_type: Option<String>,
    pub giver_type: Option<String>,
    pub recipient_type: Option<String>,
    /// Type-specific attributes kept verbatim.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl FeedbackQuestion {
    #[must_use]
    pub fn natural_key(&self) -> QuestionKey {
        QuestionKey::new(&self.session_name, &self.course_id, self.question_number)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackResponse {
    pub feedback_question_id: QuestionId,
    #[serde(rename = "feedbackSessionName", alias = "sessionName")]
    pub session_name: String,
    pub course_id: String,
    #[serde(alias = "giverEmail")]
    pub giver: String,
    #[serde(alias = "recipientEmail")]
    pub recipient: String,
    pub giver_section: Option<String>,
    pub recipient_section: Option<String>,
    pub feedback_question_type: Option<String>,
    #[serde(alias = "responseMetaData")]
    pub answer: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackResponseComment {
    pub feedback_question_id: QuestionId,
    pub feedback_response_id: Option<String>,
    #[serde(rename = "feedbackSessionName", alias = "sessionName")]
    pub session_name: String,
    pub course_id: String,
    pub giver_email: String,
    pub created_at: Option<String>,
    #[serde(alias = "text")]
    pub comment_text: TextValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Comment {
    pub course_id: String,
    pub giver_email: String,
    pub recipient_type: Option<String>,
    pub recipients: Vec<String>,
    pub status: Option<String>,
    #[serde(alias = "text")]
    pub comment_text: TextValue,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StudentProfile {
    pub google_id: String,
    pub short_name: Option<String>,
    pub email: Option<String>,
    pub institute: Option<String>,
    pub nationality: Option<String>,
    pub gender: Option<String>,
    pub more_info: Option<TextValue>,
    pub picture_key: Option<String>,
}

fn require_non_empty(kind: EntityKind, field: &str, value: &str) -> Result<(), RestoreError> {
    if value.trim().is_empty() {
        return Err(RestoreError::invalid(kind, format!("{field} MUST be non-empty")));
    }
    Ok(())
}

fn require_email(kind: EntityKind, field: &str, value: &str) -> Result<(), RestoreError> {
    require_non_empty(kind, field, value)?;
    let well_formed = value
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
    if !well_formed || value.chars().any(char::is_whitespace) {
        return Err(RestoreError::invalid(kind, format!("{field} is not a valid email: {value}")));
    }
    Ok(())
}

fn require_identifier(kind: EntityKind, field: &str, value: &str) -> Result<(), RestoreError> {
    require_non_empty(kind, field, value)?;
    if value.chars().any(char::is_whitespace) {
        return Err(RestoreError::invalid(
            kind,
            format!("{field} MUST NOT contain whitespace: {value}"),
        ));
    }
    Ok(())
}

const MAX_COURSE_ID_LENGTH: usize = 40;

impl Account {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::Account;
        require_identifier(kind, "googleId", &self.google_id)?;
        require_non_empty(kind, "name", &self.name)?;
        require_email(kind, "email", &self.email)
    }
}

impl Course {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::Course;
        require_identifier(kind, "id", &self.id)?;
        if self.id.chars().count() > MAX_COURSE_ID_LENGTH {
            return Err(RestoreError::invalid(
                kind,
                format!("id {} exceeds {MAX_COURSE_ID_LENGTH} characters", self.id),
            ));
        }
        require_non_empty(kind, "name", &self.name)
    }
}

impl Instructor {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::Instructor;
        require_identifier(kind, "courseId", &self.course_id)?;
        require_non_empty(kind, "name", &self.name)?;
        require_email(kind, "email", &self.email)
    }
}

impl Student {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::Student;
        require_identifier(kind, "course", &self.course)?;
        require_non_empty(kind, "name", &self.name)?;
        require_email(kind, "email", &self.email)
    }
}

impl FeedbackSession {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::FeedbackSession;
        require_non_empty(kind, "feedbackSessionName", &self.session_name)?;
        require_identifier(kind, "courseId", &self.course_id)?;
        if let Some(creator_email) = &self.creator_email {
            require_email(kind, "creatorEmail", creator_email)?;
        }
        if self.grace_period.is_some_and(|minutes| minutes < 0) {
            return Err(RestoreError::invalid(kind, "gracePeriod MUST be >= 0"));
        }
        Ok(())
    }
}

impl FeedbackQuestion {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::FeedbackQuestion;
        require_non_empty(kind, "feedbackSessionName", &self.session_name)?;
        require_identifier(kind, "courseId", &self.course_id)?;
        if self.question_number == 0 {
            return Err(RestoreError::invalid(kind, "questionNumber MUST be >= 1"));
        }
        Ok(())
    }
}

impl FeedbackResponse {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::FeedbackResponse;
        require_non_empty(kind, "feedbackQuestionId", self.feedback_question_id.as_str())?;
        require_non_empty(kind, "feedbackSessionName", &self.session_name)?;
        require_identifier(kind, "courseId", &self.course_id)?;
        require_non_empty(kind, "giver", &self.giver)?;
        require_non_empty(kind, "recipient", &self.recipient)
    }
}

impl FeedbackResponseComment {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::FeedbackResponseComment;
        require_non_empty(kind, "feedbackQuestionId", self.feedback_question_id.as_str())?;
        require_identifier(kind, "courseId", &self.course_id)?;
        require_non_empty(kind, "giverEmail", &self.giver_email)?;
        require_non_empty(kind, "commentText", self.comment_text.as_str())
    }
}

impl Comment {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::Comment;
        require_identifier(kind, "courseId", &self.course_id)?;
        require_email(kind, "giverEmail", &self.giver_email)?;
        require_non_empty(kind, "commentText", self.comment_text.as_str())
    }
}

impl StudentProfile {
    /// # Errors
    /// Returns [`RestoreError::InvalidParameters`] naming the offending field.
    pub fn validate(&self) -> Result<(), RestoreError> {
        let kind = EntityKind::StudentProfile;
        require_identifier(kind, "googleId", &self.google_id)?;
        if let Some(email) = &self.email {
            if !email.is_empty() {
                require_email(kind, "email", email)?;
            }
        }
        Ok(())
    }
}

/// Persistence collaborator the restore pipeline writes into.
///
/// Every `create_*` call is one logical batch: either all records are written
/// or the call fails and none are.
pub trait Destination: QuestionLookup {
    /// # Errors
    /// [`RestoreError::InvalidParameters`] when any record fails validation,
    /// [`RestoreError::Destination`] on storage failure.
    fn create_accounts(&mut self, records: &[Account]) -> Result<usize, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_courses(&mut self, records: &[Course]) -> Result<usize, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_instructors(&mut self, records: &[Instructor]) -> Result<usize, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_students(&mut self, records: &[Student]) -> Result<usize, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_feedback_sessions(
        &mut self,
        records: &[FeedbackSession],
    ) -> Result<usize, RestoreError>;
    /// Persist questions and report the surrogate id each one received.
    ///
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_feedback_questions(
        &mut self,
        records: &[FeedbackQuestion],
    ) -> Result<Vec<(QuestionKey, QuestionId)>, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_feedback_responses(
        &mut self,
        records: &[FeedbackResponse],
    ) -> Result<usize, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_feedback_response_comments(
        &mut self,
        records: &[FeedbackResponseComment],
    ) -> Result<usize, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_comments(&mut self, records: &[Comment]) -> Result<usize, RestoreError>;
    /// # Errors
    /// See [`Destination::create_accounts`].
    fn create_student_profiles(
        &mut self,
        records: &[StudentProfile],
    ) -> Result<usize, RestoreError>;
    /// # Errors
    /// [`RestoreError::Destination`] when the lookup itself fails.
    fn feedback_session_exists(
        &self,
        session_name: &str,
        course_id: &str,
    ) -> Result<bool, RestoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub file_name: String,
    pub shard: String,
    pub sha256: String,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
}

/// Durable record of bundle files that completed all phases.
pub trait RestoreLedger {
    /// # Errors
    /// [`RestoreError::Destination`] when the ledger cannot be read.
    fn committed_files(&self) -> Result<Vec<LedgerEntry>, RestoreError>;
    /// # Errors
    /// [`RestoreError::Destination`] when the entry cannot be written.
    fn record_committed(&mut self, entry: &LedgerEntry) -> Result<(), RestoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_value_accepts_plain_and_wrapped_forms() -> Result<(), serde_json::Error> {
        let plain: TextValue = serde_json::from_str("\"hello\"")?;
        let wrapped: TextValue = serde_json::from_str("{\"value\": \"hello\"}")?;
        assert_eq!(plain, wrapped);
        assert_eq!(serde_json::to_string(&wrapped)?, "\"hello\"");
        Ok(())
    }

    #[test]
    fn question_keeps_type_specific_details() -> Result<(), serde_json::Error> {
        let question: FeedbackQuestion = serde_json::from_str(
            r#"{
                "feedbackQuestionId": "old-42",
                "feedbackSessionName": "S1",
                "courseId": "C1",
                "questionNumber": 1,
                "questionText": "Rate your team",
                "questionType": "RUBRIC",
                "numberOfEntitiesToGiveFeedbackTo": -100,
                "showResponsesTo": ["INSTRUCTORS"]
            }"#,
        )?;
        assert_eq!(question.surrogate_id, Some(QuestionId::from("old-42")));
        assert_eq!(question.natural_key(), QuestionKey::new("S1", "C1", 1));
        assert_eq!(question.details.len(), 2);
        assert!(question.details.contains_key("showResponsesTo"));
        Ok(())
    }

    #[test]
    fn session_name_alias_is_accepted() -> Result<(), serde_json::Error> {
        let response: FeedbackResponse = serde_json::from_str(
            r#"{"feedbackQuestionId": "q", "sessionName": "S1", "courseId": "C1",
                "giver": "a@x.com", "recipient": "b@x.com", "responseMetaData": {"value": "ok"}}"#,
        )?;
        assert_eq!(response.session_name, "S1");
        assert_eq!(response.answer["value"], "ok");
        Ok(())
    }

    #[test]
    fn validation_names_the_offending_field() {
        let account = Account {
            google_id: "alice".to_string(),
            name: "Alice".to_string(),
            email: "not-an-email".to_string(),
            institute: String::new(),
            is_instructor: false,
        };
        let Err(err) = account.validate() else {
            panic!("expected invalid email to be rejected");
        };
        assert_eq!(err.category(), "invalid_parameters");
        assert!(err.to_string().contains("email"));

        let course = Course { id: "CS 101".to_string(), name: "Intro".to_string(), created_at: None };
        assert!(course.validate().is_err());

        let question = FeedbackQuestion {
            session_name: "S1".to_string(),
            course_id: "C1".to_string(),
            question_number: 0,
            ..FeedbackQuestion::default()
        };
        assert!(question.validate().is_err());
    }

    #[test]
    fn generated_question_ids_are_distinct() {
        let a = QuestionId::generate();
        let b = QuestionId::generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
