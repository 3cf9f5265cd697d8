use serde::{Deserialize, Serialize};

/// Persistence phases in dependency order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Accounts,
    Courses,
    Instructors,
    Students,
    FeedbackSessions,
    FeedbackQuestions,
    FeedbackResponses,
    /// Feedback response comments, then free comments.
    Comments,
    Profiles,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Accounts,
        Phase::Courses,
        Phase::Instructors,
        Phase::Students,
        Phase::FeedbackSessions,
        Phase::FeedbackQuestions,
        Phase::FeedbackResponses,
        Phase::Comments,
        Phase::Profiles,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Courses => "courses",
            Self::Instructors => "instructors",
            Self::Students => "students",
            Self::FeedbackSessions => "feedback_sessions",
            Self::FeedbackQuestions => "feedback_questions",
            Self::FeedbackResponses => "feedback_responses",
            Self::Comments => "comments",
            Self::Profiles => "profiles",
        }
    }

    /// State a file reaches once this phase has been attempted.
    #[must_use]
    pub fn completed_state(self) -> PhaseState {
        match self {
            Self::Accounts => PhaseState::AccountsDone,
            Self::Courses => PhaseState::CoursesDone,
            Self::Instructors => PhaseState::InstructorsDone,
            Self::Students => PhaseState::StudentsDone,
            Self::FeedbackSessions => PhaseState::SessionsDone,
            Self::FeedbackQuestions => PhaseState::QuestionsDone,
            Self::FeedbackResponses => PhaseState::ResponsesDone,
            Self::Comments => PhaseState::CommentsDone,
            Self::Profiles => PhaseState::ProfilesDone,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one bundle file through the phases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Loaded,
    AccountsDone,
    CoursesDone,
    InstructorsDone,
    StudentsDone,
    SessionsDone,
    QuestionsDone,
    ResponsesDone,
    CommentsDone,
    ProfilesDone,
    Committed,
}

impl PhaseState {
    /// The phase that runs from this state, if any.
    #[must_use]
    pub fn pending_phase(self) -> Option<Phase> {
        match self {
            Self::Loaded => Some(Phase::Accounts),
            Self::AccountsDone => Some(Phase::Courses),
            Self::CoursesDone => Some(Phase::Instructors),
            Self::InstructorsDone => Some(Phase::Students),
            Self::StudentsDone => Some(Phase::FeedbackSessions),
            Self::SessionsDone => Some(Phase::FeedbackQuestions),
            Self::QuestionsDone => Some(Phase::FeedbackResponses),
            Self::ResponsesDone => Some(Phase::Comments),
            Self::CommentsDone => Some(Phase::Profiles),
            Self::ProfilesDone | Self::Committed => None,
        }
    }

    /// Advance by one step. `Committed` is terminal.
    #[must_use]
    pub fn next(self) -> Self {
        match self.pending_phase() {
            Some(phase) => phase.completed_state(),
            None => Self::Committed,
        }
    }

    #[must_use]
    pub fn is_committed(self) -> bool {
        self == Self::Committed
    }
}
