use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use course_restore_core::{
    Account, Comment, Course, Destination, FeedbackQuestion, FeedbackResponse,
    FeedbackResponseComment, FeedbackSession, Instructor, LedgerEntry, QuestionId, QuestionKey,
    QuestionLookup, RestoreError, RestoreLedger, Student, StudentProfile, TextValue,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
  google_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  email TEXT NOT NULL,
  institute TEXT NOT NULL,
  is_instructor INTEGER NOT NULL CHECK (is_instructor IN (0, 1)),
  restored_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS courses (
  course_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT,
  restored_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instructors (
  course_id TEXT NOT NULL,
  email TEXT NOT NULL,
  google_id TEXT,
  name TEXT NOT NULL,
  role TEXT,
  is_archived INTEGER NOT NULL CHECK (is_archived IN (0, 1)),
  restored_at TEXT NOT NULL,
  PRIMARY KEY (course_id, email)
);

CREATE TABLE IF NOT EXISTS students (
  course_id TEXT NOT NULL,
  email TEXT NOT NULL,
  name TEXT NOT NULL,
  google_id TEXT,
  team TEXT NOT NULL,
  section TEXT,
  comments TEXT,
  registration_key TEXT,
  restored_at TEXT NOT NULL,
  PRIMARY KEY (course_id, email)
);

CREATE TABLE IF NOT EXISTS feedback_sessions (
  session_name TEXT NOT NULL,
  course_id TEXT NOT NULL,
  creator_email TEXT,
  instructions TEXT,
  created_time TEXT,
  start_time TEXT,
  end_time TEXT,
  session_visible_from_time TEXT,
  results_visible_from_time TEXT,
  time_zone REAL,
  grace_period INTEGER CHECK (grace_period IS NULL OR grace_period >= 0),
  responding_instructors_json TEXT NOT NULL,
  responding_students_json TEXT NOT NULL,
  restored_at TEXT NOT NULL,
  PRIMARY KEY (session_name, course_id)
);

CREATE TABLE IF NOT EXISTS feedback_questions (
  question_id TEXT PRIMARY KEY,
  session_name TEXT NOT NULL,
  course_id TEXT NOT NULL,
  question_number INTEGER NOT NULL CHECK (question_number >= 1),
  question_text TEXT NOT NULL,
  question_type TEXT,
  giver_type TEXT,
  recipient_type TEXT,
  details_json TEXT NOT NULL,
  restored_at TEXT NOT NULL,
  UNIQUE(session_name, course_id, question_number)
);

CREATE TABLE IF NOT EXISTS feedback_responses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  question_id TEXT NOT NULL,
  session_name TEXT NOT NULL,
  course_id TEXT NOT NULL,
  giver TEXT NOT NULL,
  recipient TEXT NOT NULL,
  giver_section TEXT,
  recipient_section TEXT,
  question_type TEXT,
  answer_json TEXT NOT NULL,
  restored_at TEXT NOT NULL,
  UNIQUE(question_id, giver, recipient),
  FOREIGN KEY (question_id) REFERENCES feedback_questions(question_id)
);

CREATE TABLE IF NOT EXISTS feedback_response_comments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  question_id TEXT NOT NULL,
  response_ref TEXT,
  session_name TEXT NOT NULL,
  course_id TEXT NOT NULL,
  giver_email TEXT NOT NULL,
  created_at TEXT NOT NULL,
  comment_text TEXT NOT NULL,
  restored_at TEXT NOT NULL,
  UNIQUE(question_id, giver_email, created_at, comment_text),
  FOREIGN KEY (question_id) REFERENCES feedback_questions(question_id)
);

CREATE TABLE IF NOT EXISTS comments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  course_id TEXT NOT NULL,
  giver_email TEXT NOT NULL,
  recipient_type TEXT,
  recipients_json TEXT NOT NULL,
  status TEXT,
  comment_text TEXT NOT NULL,
  created_at TEXT NOT NULL,
  restored_at TEXT NOT NULL,
  UNIQUE(course_id, giver_email, created_at, comment_text)
);

CREATE TABLE IF NOT EXISTS student_profiles (
  google_id TEXT PRIMARY KEY,
  short_name TEXT,
  email TEXT,
  institute TEXT,
  nationality TEXT,
  gender TEXT,
  more_info TEXT,
  picture_key TEXT,
  restored_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feedback_responses_question ON feedback_responses(question_id);
CREATE INDEX IF NOT EXISTS idx_feedback_response_comments_question ON feedback_response_comments(question_id);
CREATE INDEX IF NOT EXISTS idx_students_course ON students(course_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS restore_ledger (
  file_name TEXT PRIMARY KEY,
  shard TEXT NOT NULL,
  sha256 TEXT NOT NULL,
  committed_at TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Row counts per restored entity table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityCounts {
    pub accounts: u64,
    pub courses: u64,
    pub instructors: u64,
    pub students: u64,
    pub feedback_sessions: u64,
    pub feedback_questions: u64,
    pub feedback_responses: u64,
    pub feedback_response_comments: u64,
    pub comments: u64,
    pub student_profiles: u64,
}

impl SqliteStore {
    /// Open a SQLite-backed destination store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "feedback_questions")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        // Entity tables predate migration tracking.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "restore_ledger")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create restore_ledger table")?;
        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;
        tx.commit().context("failed to commit migration v2")?;
        tracing::debug!("applied schema migration 2 (restore_ledger)");
        Ok(())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Count rows in every entity table.
    ///
    /// # Errors
    /// Returns an error when a count query fails.
    pub fn entity_counts(&self) -> Result<EntityCounts> {
        Ok(EntityCounts {
            accounts: count_rows(&self.conn, "accounts")?,
            courses: count_rows(&self.conn, "courses")?,
            instructors: count_rows(&self.conn, "instructors")?,
            students: count_rows(&self.conn, "students")?,
            feedback_sessions: count_rows(&self.conn, "feedback_sessions")?,
            feedback_questions: count_rows(&self.conn, "feedback_questions")?,
            feedback_responses: count_rows(&self.conn, "feedback_responses")?,
            feedback_response_comments: count_rows(&self.conn, "feedback_response_comments")?,
            comments: count_rows(&self.conn, "comments")?,
            student_profiles: count_rows(&self.conn, "student_profiles")?,
        })
    }

    /// Load every stored course.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_courses(&self) -> Result<Vec<Course>> {
        let mut stmt = self
            .conn
            .prepare("SELECT course_id, name, created_at FROM courses ORDER BY course_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Course { id: row.get(0)?, name: row.get(1)?, created_at: row.get(2)? })
        })?;

        let mut courses = Vec::new();
        for row in rows {
            courses.push(row?);
        }
        Ok(courses)
    }

    /// Natural key and destination id of every stored question.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_feedback_questions(&self) -> Result<Vec<(QuestionKey, QuestionId)>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_name, course_id, question_number, question_id
             FROM feedback_questions
             ORDER BY course_id ASC, session_name ASC, question_number ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                QuestionKey {
                    session_name: row.get(0)?,
                    course_id: row.get(1)?,
                    question_number: row.get(2)?,
                },
                QuestionId(row.get(3)?),
            ))
        })?;

        let mut questions = Vec::new();
        for row in rows {
            questions.push(row?);
        }
        Ok(questions)
    }

    /// Load every stored feedback response.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_feedback_responses(&self) -> Result<Vec<FeedbackResponse>> {
        let mut stmt = self.conn.prepare(
            "SELECT question_id, session_name, course_id, giver, recipient,
                    giver_section, recipient_section, question_type, answer_json
             FROM feedback_responses
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut responses = Vec::new();

        while let Some(row) = rows.next()? {
            let answer_json: String = row.get(8)?;
            responses.push(FeedbackResponse {
                feedback_question_id: QuestionId(row.get(0)?),
                session_name: row.get(1)?,
                course_id: row.get(2)?,
                giver: row.get(3)?,
                recipient: row.get(4)?,
                giver_section: row.get(5)?,
                recipient_section: row.get(6)?,
                feedback_question_type: row.get(7)?,
                answer: serde_json::from_str(&answer_json)
                    .context("failed to deserialize response answer")?,
            });
        }

        Ok(responses)
    }

    fn write_batch<T>(
        &mut self,
        table: &str,
        records: &[T],
        mut write: impl FnMut(&Transaction<'_>, &T, &str) -> Result<()>,
    ) -> Result<usize> {
        let restored_at = now_rfc3339()?;
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start {table} transaction"))?;
        for record in records {
            write(&tx, record, &restored_at)?;
        }
        tx.commit().with_context(|| format!("failed to commit {table} batch"))?;
        tracing::debug!("upserted {} rows into {}", records.len(), table);
        Ok(records.len())
    }

    fn upsert_accounts(&mut self, records: &[Account]) -> Result<usize> {
        self.write_batch("accounts", records, |tx, account, restored_at| {
            tx.execute(
                "INSERT INTO accounts(google_id, name, email, institute, is_instructor, restored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(google_id) DO UPDATE SET
                   name = excluded.name,
                   email = excluded.email,
                   institute = excluded.institute,
                   is_instructor = excluded.is_instructor,
                   restored_at = excluded.restored_at",
                params![
                    account.google_id,
                    account.name,
                    account.email,
                    account.institute,
                    account.is_instructor,
                    restored_at,
                ],
            )
            .with_context(|| format!("failed to upsert account {}", account.google_id))?;
            Ok(())
        })
    }

    fn upsert_courses(&mut self, records: &[Course]) -> Result<usize> {
        self.write_batch("courses", records, |tx, course, restored_at| {
            tx.execute(
                "INSERT INTO courses(course_id, name, created_at, restored_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(course_id) DO UPDATE SET
                   name = excluded.name,
                   created_at = excluded.created_at,
                   restored_at = excluded.restored_at",
                params![course.id, course.name, course.created_at, restored_at],
            )
            .with_context(|| format!("failed to upsert course {}", course.id))?;
            Ok(())
        })
    }

    fn upsert_instructors(&mut self, records: &[Instructor]) -> Result<usize> {
        self.write_batch("instructors", records, |tx, instructor, restored_at| {
            tx.execute(
                "INSERT INTO instructors(course_id, email, google_id, name, role, is_archived, restored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(course_id, email) DO UPDATE SET
                   google_id = excluded.google_id,
                   name = excluded.name,
                   role = excluded.role,
                   is_archived = excluded.is_archived,
                   restored_at = excluded.restored_at",
                params![
                    instructor.course_id,
                    instructor.email,
                    instructor.google_id,
                    instructor.name,
                    instructor.role,
                    instructor.is_archived,
                    restored_at,
                ],
            )
            .with_context(|| {
                format!("failed to upsert instructor {} in {}", instructor.email, instructor.course_id)
            })?;
            Ok(())
        })
    }

    fn upsert_students(&mut self, records: &[Student]) -> Result<usize> {
        self.write_batch("students", records, |tx, student, restored_at| {
            tx.execute(
                "INSERT INTO students(
                    course_id, email, name, google_id, team, section, comments,
                    registration_key, restored_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(course_id, email) DO UPDATE SET
                   name = excluded.name,
                   google_id = excluded.google_id,
                   team = excluded.team,
                   section = excluded.section,
                   comments = excluded.comments,
                   registration_key = excluded.registration_key,
                   restored_at = excluded.restored_at",
                params![
                    student.course,
                    student.email,
                    student.name,
                    student.google_id,
                    student.team,
                    student.section,
                    student.comments,
                    student.key,
                    restored_at,
                ],
            )
            .with_context(|| {
                format!("failed to upsert student {} in {}", student.email, student.course)
            })?;
            Ok(())
        })
    }

    fn upsert_feedback_sessions(&mut self, records: &[FeedbackSession]) -> Result<usize> {
        self.write_batch("feedback_sessions", records, |tx, session, restored_at| {
            tx.execute(
                "INSERT INTO feedback_sessions(
                    session_name, course_id, creator_email, instructions, created_time,
                    start_time, end_time, session_visible_from_time, results_visible_from_time,
                    time_zone, grace_period, responding_instructors_json,
                    responding_students_json, restored_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(session_name, course_id) DO UPDATE SET
                   creator_email = excluded.creator_email,
                   instructions = excluded.instructions,
                   created_time = excluded.created_time,
                   start_time = excluded.start_time,
                   end_time = excluded.end_time,
                   session_visible_from_time = excluded.session_visible_from_time,
                   results_visible_from_time = excluded.results_visible_from_time,
                   time_zone = excluded.time_zone,
                   grace_period = excluded.grace_period,
                   responding_instructors_json = excluded.responding_instructors_json,
                   responding_students_json = excluded.responding_students_json,
                   restored_at = excluded.restored_at",
                params![
                    session.session_name,
                    session.course_id,
                    session.creator_email,
                    session.instructions.as_ref().map(TextValue::as_str),
                    session.created_time,
                    session.start_time,
                    session.end_time,
                    session.session_visible_from_time,
                    session.results_visible_from_time,
                    session.time_zone,
                    session.grace_period,
                    serde_json::to_string(&session.responding_instructor_list)
                        .context("failed to serialize responding instructors")?,
                    serde_json::to_string(&session.responding_student_list)
                        .context("failed to serialize responding students")?,
                    restored_at,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to upsert feedback session {}:{}",
                    session.session_name, session.course_id
                )
            })?;
            Ok(())
        })
    }

    fn upsert_feedback_questions(
        &mut self,
        records: &[FeedbackQuestion],
    ) -> Result<Vec<(QuestionKey, QuestionId)>> {
        let restored_at = now_rfc3339()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start feedback_questions transaction")?;
        let mut persisted = Vec::with_capacity(records.len());

        for question in records {
            let key = question.natural_key();
            tx.execute(
                "INSERT INTO feedback_questions(
                    question_id, session_name, course_id, question_number, question_text,
                    question_type, giver_type, recipient_type, details_json, restored_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(session_name, course_id, question_number) DO UPDATE SET
                   question_text = excluded.question_text,
                   question_type = excluded.question_type,
                   giver_type = excluded.giver_type,
                   recipient_type = excluded.recipient_type,
                   details_json = excluded.details_json,
                   restored_at = excluded.restored_at",
                params![
                    QuestionId::generate().as_str(),
                    key.session_name,
                    key.course_id,
                    key.question_number,
                    question.question_text.as_str(),
                    question.question_type,
                    question.giver_type,
                    question.recipient_type,
                    serde_json::to_string(&question.details)
                        .context("failed to serialize question details")?,
                    restored_at,
                ],
            )
            .with_context(|| format!("failed to upsert feedback question {key}"))?;

            let question_id = find_question_id(&tx, &key)?
                .ok_or_else(|| anyhow!("feedback question {key} missing after upsert"))?;
            persisted.push((key, question_id));
        }

        tx.commit().context("failed to commit feedback_questions batch")?;
        tracing::debug!("upserted {} rows into feedback_questions", persisted.len());
        Ok(persisted)
    }

    fn upsert_feedback_responses(&mut self, records: &[FeedbackResponse]) -> Result<usize> {
        self.write_batch("feedback_responses", records, |tx, response, restored_at| {
            tx.execute(
                "INSERT INTO feedback_responses(
                    question_id, session_name, course_id, giver, recipient, giver_section,
                    recipient_section, question_type, answer_json, restored_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(question_id, giver, recipient) DO UPDATE SET
                   giver_section = excluded.giver_section,
                   recipient_section = excluded.recipient_section,
                   question_type = excluded.question_type,
                   answer_json = excluded.answer_json,
                   restored_at = excluded.restored_at",
                params![
                    response.feedback_question_id.as_str(),
                    response.session_name,
                    response.course_id,
                    response.giver,
                    response.recipient,
                    response.giver_section,
                    response.recipient_section,
                    response.feedback_question_type,
                    serde_json::to_string(&response.answer)
                        .context("failed to serialize response answer")?,
                    restored_at,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to upsert feedback response {} -> {} on question {}",
                    response.giver, response.recipient, response.feedback_question_id
                )
            })?;
            Ok(())
        })
    }

    fn upsert_feedback_response_comments(
        &mut self,
        records: &[FeedbackResponseComment],
    ) -> Result<usize> {
        self.write_batch("feedback_response_comments", records, |tx, comment, restored_at| {
            tx.execute(
                "INSERT INTO feedback_response_comments(
                    question_id, response_ref, session_name, course_id, giver_email,
                    created_at, comment_text, restored_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(question_id, giver_email, created_at, comment_text) DO UPDATE SET
                   response_ref = excluded.response_ref,
                   restored_at = excluded.restored_at",
                params![
                    comment.feedback_question_id.as_str(),
                    comment.feedback_response_id,
                    comment.session_name,
                    comment.course_id,
                    comment.giver_email,
                    comment.created_at.as_deref().unwrap_or_default(),
                    comment.comment_text.as_str(),
                    restored_at,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to upsert feedback response comment by {} on question {}",
                    comment.giver_email, comment.feedback_question_id
                )
            })?;
            Ok(())
        })
    }

    fn upsert_comments(&mut self, records: &[Comment]) -> Result<usize> {
        self.write_batch("comments", records, |tx, comment, restored_at| {
            tx.execute(
                "INSERT INTO comments(
                    course_id, giver_email, recipient_type, recipients_json, status,
                    comment_text, created_at, restored_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(course_id, giver_email, created_at, comment_text) DO UPDATE SET
                   recipient_type = excluded.recipient_type,
                   recipients_json = excluded.recipients_json,
                   status = excluded.status,
                   restored_at = excluded.restored_at",
                params![
                    comment.course_id,
                    comment.giver_email,
                    comment.recipient_type,
                    serde_json::to_string(&comment.recipients)
                        .context("failed to serialize comment recipients")?,
                    comment.status,
                    comment.comment_text.as_str(),
                    comment.created_at.as_deref().unwrap_or_default(),
                    restored_at,
                ],
            )
            .with_context(|| {
                format!("failed to upsert comment by {} in {}", comment.giver_email, comment.course_id)
            })?;
            Ok(())
        })
    }

    fn upsert_student_profiles(&mut self, records: &[StudentProfile]) -> Result<usize> {
        self.write_batch("student_profiles", records, |tx, profile, restored_at| {
            tx.execute(
                "INSERT INTO student_profiles(
                    google_id, short_name, email, institute, nationality, gender,
                    more_info, picture_key, restored_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(google_id) DO UPDATE SET
                   short_name = excluded.short_name,
                   email = excluded.email,
                   institute = excluded.institute,
                   nationality = excluded.nationality,
                   gender = excluded.gender,
                   more_info = excluded.more_info,
                   picture_key = excluded.picture_key,
                   restored_at = excluded.restored_at",
                params![
                    profile.google_id,
                    profile.short_name,
                    profile.email,
                    profile.institute,
                    profile.nationality,
                    profile.gender,
                    profile.more_info.as_ref().map(TextValue::as_str),
                    profile.picture_key,
                    restored_at,
                ],
            )
            .with_context(|| format!("failed to upsert student profile {}", profile.google_id))?;
            Ok(())
        })
    }

    fn list_ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_name, shard, sha256, committed_at
             FROM restore_ledger
             ORDER BY committed_at ASC, file_name ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let committed_at: String = row.get(3)?;
            entries.push(LedgerEntry {
                file_name: row.get(0)?,
                shard: row.get(1)?,
                sha256: row.get(2)?,
                committed_at: parse_rfc3339(&committed_at)?,
            });
        }

        Ok(entries)
    }

    fn upsert_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO restore_ledger(file_name, shard, sha256, committed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(file_name) DO UPDATE SET
                   shard = excluded.shard,
                   sha256 = excluded.sha256,
                   committed_at = excluded.committed_at",
                params![entry.file_name, entry.shard, entry.sha256, rfc3339(entry.committed_at)?],
            )
            .with_context(|| format!("failed to record ledger entry for {}", entry.file_name))?;
        Ok(())
    }
}

fn destination_error(err: &anyhow::Error) -> RestoreError {
    RestoreError::Destination(format!("{err:#}"))
}

impl QuestionLookup for SqliteStore {
    fn find_feedback_question(&self, key: &QuestionKey) -> Result<Option<QuestionId>, RestoreError> {
        find_question_id(&self.conn, key).map_err(|err| destination_error(&err))
    }
}

impl Destination for SqliteStore {
    fn create_accounts(&mut self, records: &[Account]) -> Result<usize, RestoreError> {
        records.iter().try_for_each(Account::validate)?;
        self.upsert_accounts(records).map_err(|err| destination_error(&err))
    }

    fn create_courses(&mut self, records: &[Course]) -> Result<usize, RestoreError> {
        records.iter().try_for_each(Course::validate)?;
        self.upsert_courses(records).map_err(|err| destination_error(&err))
    }

    fn create_instructors(&mut self, records: &[Instructor]) -> Result<usize, RestoreError> {
        records.iter().try_for_each(Instructor::validate)?;
        self.upsert_instructors(records).map_err(|err| destination_error(&err))
    }

    fn create_students(&mut self, records: &[Student]) -> Result<usize, RestoreError> {
        records.iter().try_for_each(Student::validate)?;
        self.upsert_students(records).map_err(|err| destination_error(&err))
    }

    fn create_feedback_sessions(
        &mut self,
        records: &[FeedbackSession],
    ) -> Result<usize, RestoreError> {
        records.iter().try_for_each(FeedbackSession::validate)?;
        self.upsert_feedback_sessions(records).map_err(|err| destination_error(&err))
    }

    fn create_feedback_questions(
        &mut self,
        records: &[FeedbackQuestion],
    ) -> Result<Vec<(QuestionKey, QuestionId)>, RestoreError> {
        records.iter().try_for_each(FeedbackQuestion::validate)?;
        self.upsert_feedback_questions(records).map_err(|err| destination_error(&err))
    }

    fn create_feedback_responses(
        &mut self,
        records: &[FeedbackResponse],
    ) -> Result<usize, RestoreError> {
        records.iter().try_for_each(FeedbackResponse::validate)?;
        self.upsert_feedback_responses(records).map_err(|err| destination_error(&err))
    }

    fn create_feedback_response_comments(
        &mut self,
        records: &[FeedbackResponseComment],
    ) -> Result<usize, RestoreError> {
        records.iter().try_for_each(FeedbackResponseComment::validate)?;
        self.upsert_feedback_response_comments(records).map_err(|err| destination_error(&err))
    }

    fn create_comments(&mut self, records: &[Comment]) -> Result<usize, RestoreError> {
        records.iter().try_for_each(Comment::validate)?;
        self.upsert_comments(records).map_err(|err| destination_error(&err))
    }

    fn create_student_profiles(
        &mut self,
        records: &[StudentProfile],
    ) -> Result<usize, RestoreError> {
        records.iter().try_for_each(StudentProfile::validate)?;
        self.upsert_student_profiles(records).map_err(|err| destination_error(&err))
    }

    fn feedback_session_exists(
        &self,
        session_name: &str,
        course_id: &str,
    ) -> Result<bool, RestoreError> {
        self.conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM feedback_sessions WHERE session_name = ?1 AND course_id = ?2
                 )",
                params![session_name, course_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|exists| exists == 1)
            .with_context(|| format!("failed to look up feedback session {session_name}:{course_id}"))
            .map_err(|err| destination_error(&err))
    }
}

impl RestoreLedger for SqliteStore {
    fn committed_files(&self) -> Result<Vec<LedgerEntry>, RestoreError> {
        self.list_ledger_entries().map_err(|err| destination_error(&err))
    }

    fn record_committed(&mut self, entry: &LedgerEntry) -> Result<(), RestoreError> {
        self.upsert_ledger_entry(entry).map_err(|err| destination_error(&err))
    }
}

fn find_question_id(conn: &Connection, key: &QuestionKey) -> Result<Option<QuestionId>> {
    conn.query_row(
        "SELECT question_id FROM feedback_questions
         WHERE session_name = ?1 AND course_id = ?2 AND question_number = ?3",
        params![key.session_name, key.course_id, key.question_number],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .with_context(|| format!("failed to look up feedback question {key}"))
    .map(|found| found.map(QuestionId))
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    tracing::debug!("applied schema migration 1 (entity tables)");
    Ok(())
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to count rows in {table}"))?;
    u64::try_from(count).with_context(|| format!("negative row count in {table}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "feedback_questions")? {
        return Ok((0, false));
    }

    if table_exists(conn, "restore_ledger")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn session(name: &str, course_id: &str) -> FeedbackSession {
        FeedbackSession {
            session_name: name.to_string(),
            course_id: course_id.to_string(),
            creator_email: Some("instr@uni.edu".to_string()),
            grace_period: Some(15),
            ..FeedbackSession::default()
        }
    }

    fn question(session_name: &str, number: u32) -> FeedbackQuestion {
        FeedbackQuestion {
            surrogate_id: Some(QuestionId(format!("old-{number}"))),
            session_name: session_name.to_string(),
            course_id: "C1".to_string(),
            question_number: number,
            question_text: TextValue("How did it go?".to_string()),
            question_type: Some("TEXT".to_string()),
            ..FeedbackQuestion::default()
        }
    }

    fn response(question_id: &QuestionId, giver: &str) -> FeedbackResponse {
        FeedbackResponse {
            feedback_question_id: question_id.clone(),
            session_name: "S1".to_string(),
            course_id: "C1".to_string(),
            giver: giver.to_string(),
            recipient: "team-a".to_string(),
            answer: json!({"value": "fine"}),
            ..FeedbackResponse::default()
        }
    }

    #[test]
    fn migrate_creates_latest_schema_and_clean_integrity() -> Result<()> {
        let store = migrated_store()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(store.entity_counts()?, EntityCounts::default());
        Ok(())
    }

    #[test]
    fn untracked_entity_tables_are_detected_and_upgraded() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);
        assert_eq!(status.pending_versions, vec![2]);

        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 2);
        assert!(!status.inferred_from_legacy);
        assert!(table_exists(&store.conn, "restore_ledger")?);
        Ok(())
    }

    #[test]
    fn question_upsert_keeps_destination_id_stable() -> Result<()> {
        let mut store = migrated_store()?;
        store.create_feedback_sessions(&[session("S1", "C1")])?;

        let first = store.create_feedback_questions(&[question("S1", 1), question("S1", 2)])?;
        let second = store.create_feedback_questions(&[question("S1", 1)])?;

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].0, QuestionKey::new("S1", "C1", 1));
        assert_eq!(second[0].1, first[0].1);
        assert_ne!(first[0].1, QuestionId::from("old-1"));
        assert_eq!(
            store.find_feedback_question(&QuestionKey::new("S1", "C1", 2))?,
            Some(first[1].1.clone())
        );
        assert_eq!(store.find_feedback_question(&QuestionKey::new("S1", "C1", 3))?, None);
        assert_eq!(store.list_feedback_questions()?.len(), 2);
        Ok(())
    }

    #[test]
    fn invalid_record_rejects_the_whole_batch() -> Result<()> {
        let mut store = migrated_store()?;
        let good = Course { id: "C1".to_string(), name: "Course".to_string(), created_at: None };
        let bad = Course { id: String::new(), name: "Nameless".to_string(), created_at: None };

        let result = store.create_courses(&[good, bad]);
        assert!(matches!(result, Err(RestoreError::InvalidParameters { .. })));
        assert_eq!(store.entity_counts()?.courses, 0);
        Ok(())
    }

    #[test]
    fn response_to_unknown_question_is_a_destination_failure() -> Result<()> {
        let mut store = migrated_store()?;
        let result = store.create_feedback_responses(&[response(&QuestionId::from("ghost"), "a@x.com")]);
        assert!(matches!(result, Err(RestoreError::Destination(_))));
        assert_eq!(store.entity_counts()?.feedback_responses, 0);
        Ok(())
    }

    #[test]
    fn repeated_batches_do_not_duplicate_rows() -> Result<()> {
        let mut store = migrated_store()?;
        store.create_feedback_sessions(&[session("S1", "C1")])?;
        let persisted = store.create_feedback_questions(&[question("S1", 1)])?;
        let question_id = persisted[0].1.clone();

        let responses = [response(&question_id, "a@x.com"), response(&question_id, "b@x.com")];
        let comment = FeedbackResponseComment {
            feedback_question_id: question_id.clone(),
            session_name: "S1".to_string(),
            course_id: "C1".to_string(),
            giver_email: "instr@uni.edu".to_string(),
            created_at: Some("2020-01-01T00:00:00Z".to_string()),
            comment_text: TextValue("noted".to_string()),
            ..FeedbackResponseComment::default()
        };

        for _ in 0..2 {
            store.create_feedback_responses(&responses)?;
            store.create_feedback_response_comments(std::slice::from_ref(&comment))?;
        }

        let counts = store.entity_counts()?;
        assert_eq!(counts.feedback_responses, 2);
        assert_eq!(counts.feedback_response_comments, 1);
        let stored = store.list_feedback_responses()?;
        assert!(stored.iter().all(|record| record.feedback_question_id == question_id));
        assert_eq!(stored[0].answer, json!({"value": "fine"}));
        assert!(store.integrity_check()?.foreign_key_violations.is_empty());
        Ok(())
    }

    #[test]
    fn session_existence_is_by_name_and_course() -> Result<()> {
        let mut store = migrated_store()?;
        store.create_feedback_sessions(&[session("S1", "C1")])?;
        assert!(store.feedback_session_exists("S1", "C1")?);
        assert!(!store.feedback_session_exists("S1", "C2")?);
        assert!(!store.feedback_session_exists("S9", "C1")?);
        Ok(())
    }

    #[test]
    fn ledger_records_and_replaces_entries() -> Result<()> {
        let mut store = migrated_store()?;
        let committed_at = OffsetDateTime::from_unix_timestamp(1_590_969_600)?;
        let mut entry = LedgerEntry {
            file_name: "course5.json".to_string(),
            shard: "2020_06_01 00.00.00".to_string(),
            sha256: "abc".to_string(),
            committed_at,
        };
        store.record_committed(&entry)?;
        entry.sha256 = "def".to_string();
        store.record_committed(&entry)?;

        let entries = store.committed_files()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], entry);
        Ok(())
    }

    #[test]
    fn backup_database_writes_a_readable_copy() -> Result<()> {
        let mut source = migrated_store()?;
        source.create_accounts(&[Account {
            google_id: "alice".to_string(),
            name: "Alice".to_string(),
            email: "alice@uni.edu".to_string(),
            institute: "Uni".to_string(),
            is_instructor: true,
        }])?;

        let backup_file =
            std::env::temp_dir().join(format!("course-restore-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let copy = SqliteStore::open(&backup_file)?;
        assert_eq!(copy.entity_counts()?.accounts, 1);
        drop(copy);

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }
}
