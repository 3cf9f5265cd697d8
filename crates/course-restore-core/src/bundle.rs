use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    Account, Comment, Course, FeedbackQuestion, FeedbackResponse, FeedbackResponseComment,
    FeedbackSession, Instructor, QuestionId, RestoreError, Student, StudentProfile,
};

/// One deserialized bundle file. Keys are bundle-local and carry no meaning
/// outside the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataBundle {
    #[serde(default, deserialize_with = "nullable_map")]
    pub accounts: BTreeMap<String, Account>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub courses: BTreeMap<String, Course>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub instructors: BTreeMap<String, Instructor>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub students: BTreeMap<String, Student>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub feedback_sessions: BTreeMap<String, FeedbackSession>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub feedback_questions: BTreeMap<String, FeedbackQuestion>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub feedback_responses: BTreeMap<String, FeedbackResponse>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub feedback_response_comments: BTreeMap<String, FeedbackResponseComment>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub comments: BTreeMap<String, Comment>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub profiles: BTreeMap<String, StudentProfile>,
}

fn nullable_map<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<BTreeMap<String, T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl DataBundle {
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.accounts.len()
            + self.courses.len()
            + self.instructors.len()
            + self.students.len()
            + self.feedback_sessions.len()
            + self.feedback_questions.len()
            + self.feedback_responses.len()
            + self.feedback_response_comments.len()
            + self.comments.len()
            + self.profiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Index this bundle's questions by the surrogate id they had in the
    /// store that produced the bundle.
    #[must_use]
    pub fn questions_by_source_id(&self) -> BTreeMap<&QuestionId, &FeedbackQuestion> {
        self.feedback_questions
            .values()
            .filter_map(|question| question.surrogate_id.as_ref().map(|id| (id, question)))
            .collect()
    }
}

/// Parse raw bundle content.
///
/// # Errors
/// Returns [`RestoreError::MalformedBundle`] when the content is not a JSON
/// object of the expected shape. Missing collections are not an error.
pub fn load_bundle(content: &str) -> Result<DataBundle, RestoreError> {
    if content.trim().is_empty() {
        return Err(RestoreError::MalformedBundle("bundle content is empty".to_string()));
    }
    serde_json::from_str(content).map_err(|err| RestoreError::MalformedBundle(err.to_string()))
}

/// Read and parse one bundle file.
///
/// # Errors
/// Returns [`RestoreError::MalformedBundle`] when the file cannot be read or parsed.
pub fn load_bundle_file(path: &Path) -> Result<DataBundle, RestoreError> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        RestoreError::MalformedBundle(format!("failed to read {}: {err}", path.display()))
    })?;
    load_bundle(&content).map_err(|err| match err {
        RestoreError::MalformedBundle(detail) => {
            RestoreError::MalformedBundle(format!("{}: {detail}", path.display()))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_collections_load_as_empty() -> Result<(), RestoreError> {
        let bundle = load_bundle(
            r#"{"courses": {"C1": {"id": "C1", "name": "Course One"}}, "comments": null}"#,
        )?;
        assert_eq!(bundle.courses.len(), 1);
        assert!(bundle.accounts.is_empty());
        assert!(bundle.comments.is_empty());
        assert!(bundle.feedback_responses.is_empty());
        assert_eq!(bundle.record_count(), 1);
        Ok(())
    }

    #[test]
    fn empty_object_is_an_empty_bundle() -> Result<(), RestoreError> {
        let bundle = load_bundle("{}")?;
        assert!(bundle.is_empty());
        Ok(())
    }

    #[test]
    fn non_object_content_is_malformed() {
        for content in ["", "[]", "42", "{\"courses\": []}", "{\"courses\": {\"C1\": 7}}", "{"] {
            let err = load_bundle(content);
            assert!(
                matches!(err, Err(RestoreError::MalformedBundle(_))),
                "expected malformed bundle for {content:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn unknown_top_level_members_are_ignored() -> Result<(), RestoreError> {
        let bundle = load_bundle(r#"{"adminEmails": {}, "accounts": {}}"#)?;
        assert!(bundle.is_empty());
        Ok(())
    }

    #[test]
    fn generator_style_records_load() -> Result<(), RestoreError> {
        let bundle = load_bundle(
            r#"{
            "accounts": {
                "D1_Stu1": {"googleId": "D1_Stu1", "name": "D1_Stu1",
                            "email": "D1_Stu1@gmail.com", "institute": ""}
            },
            "instructors": {
                "D1_Instr1": {"googleId": "googleIdOf_D1_Instr1", "courseId": "courseIdOf_Course1",
                              "name": "nameOf_D1_Instr1", "email": "emailOf_D1_Instr1@gmail.com"}
            },
            "students": {
                "D1_Stu1Team1_in_Course1": {"email": "D1_Stu1Email@gmail.com",
                    "name": "Student 1 in D1_Course1", "team": "Team 1", "id": "D1_Stu1Email",
                    "comments": "comment", "course": "courseIdOf_D1_Course1",
                    "profile": {"value": "Student 1 in D1_Course1"}}
            }
        }"#,
        )?;
        assert_eq!(bundle.accounts.len(), 1);
        assert_eq!(bundle.instructors.len(), 1);
        assert_eq!(bundle.students.len(), 1);
        let student = &bundle.students["D1_Stu1Team1_in_Course1"];
        assert_eq!(student.course, "courseIdOf_D1_Course1");
        Ok(())
    }

    #[test]
    fn questions_are_indexed_by_source_id() -> Result<(), RestoreError> {
        let bundle = load_bundle(
            r#"{"feedbackQuestions": {
                "q1": {"feedbackQuestionId": "old-42", "feedbackSessionName": "S1",
                       "courseId": "C1", "questionNumber": 1},
                "q2": {"feedbackSessionName": "S1", "courseId": "C1", "questionNumber": 2}
            }}"#,
        )?;
        let index = bundle.questions_by_source_id();
        assert_eq!(index.len(), 1);
        let Some(question) = index.get(&QuestionId::from("old-42")) else {
            panic!("question old-42 should be indexed");
        };
        assert_eq!(question.question_number, 1);
        Ok(())
    }

    #[test]
    fn unreadable_file_is_malformed() {
        let path = std::env::temp_dir().join(format!("course-restore-missing-{}", ulid::Ulid::new()));
        let err = load_bundle_file(&path);
        assert!(matches!(err, Err(RestoreError::MalformedBundle(_))));
    }
}
