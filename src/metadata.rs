//! Metadata store: the relational home of users, courses, enrollments, and freshness
//! timestamps. Backed by `sqlx`'s SQLite pool, following the same "thin typed wrapper over a
//! pool" shape the upstream driver uses for its `Client` — a cheap `Clone`, an async
//! constructor that validates the connection, and one method per logical operation.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteConnectOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::{
    error::{Error, Result},
    model::{Course, CourseId, Enrollment, Source, User, UserId},
};

/// Handle to the relational metadata store. Cheaply `Clone`-able; every clone shares the
/// same underlying connection pool.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Connects to `database_url` (a SQLite file path or `sqlite::memory:`) and ensures the
    /// schema exists. Safe to call from multiple processes against the same file; table
    /// creation is `IF NOT EXISTS`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::storage(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS courses (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL,
                title TEXT NOT NULL,
                lms_fresh_at TEXT,
                exam_fresh_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enrollments (
                user_id INTEGER NOT NULL,
                course_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, course_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Courses a user is enrolled in. Empty iff the user has no enrollment rows yet, which
    /// the Orchestrator (C7) treats as "needs bootstrap".
    pub async fn enrolled_courses(&self, user_id: UserId) -> Result<Vec<Course>> {
        let courses = sqlx::query_as::<_, Course>(
            r#"
            SELECT c.id, c.code, c.title, c.lms_fresh_at, c.exam_fresh_at
            FROM courses c
            JOIN enrollments e ON e.course_id = c.id
            WHERE e.user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(courses)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT id, email FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Inserts a course if its external `code` is not already known, returning its internal
    /// id either way. Used by the bootstrap path (C7 step 1) when harvesting a user's course
    /// list for the first time.
    pub async fn upsert_course(&self, code: &str, title: &str) -> Result<CourseId> {
        if let Some(existing) =
            sqlx::query_as::<_, (CourseId,)>("SELECT id FROM courses WHERE code = ?")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(existing.0);
        }
        let inserted = sqlx::query("INSERT INTO courses (code, title) VALUES (?, ?)")
            .bind(code)
            .bind(title)
            .execute(&self.pool)
            .await?;
        Ok(inserted.last_insert_rowid())
    }

    pub async fn enroll(&self, user_id: UserId, course_id: CourseId) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO enrollments (user_id, course_id) VALUES (?, ?)",
        )
        .bind(user_id)
        .bind(course_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn enrollments_for_user(&self, user_id: UserId) -> Result<Vec<Enrollment>> {
        let rows = sqlx::query_as::<_, (UserId, CourseId)>(
            "SELECT user_id, course_id FROM enrollments WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(user_id, course_id)| Enrollment { user_id, course_id })
            .collect())
    }

    /// Advances the freshness timestamp for `(course_id, source)` to `now`. Single-row,
    /// single-statement write — per §5 no cross-course transaction is required. Never
    /// decrements: callers only invoke this after a successful scrape, and `now` is always
    /// the instant captured at the start of the run, which is monotonic across runs.
    pub async fn advance_freshness(
        &self,
        course_id: CourseId,
        source: Source,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let column = match source {
            Source::Lms => "lms_fresh_at",
            Source::Exam => "exam_fresh_at",
        };
        let sql = format!("UPDATE courses SET {column} = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(now.to_rfc3339())
            .bind(course_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn memory() -> Self {
        Self::connect("sqlite::memory:").await.expect("in-memory sqlite pool")
    }
}
