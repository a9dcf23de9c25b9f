//! Core entities shared across every component: courses, enrollments, on-disk artifacts,
//! and the chunk/vector records produced by ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type CourseId = i64;
pub type UserId = i64;

/// Which upstream a given piece of state or activity belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Lms,
    Exam,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Lms => write!(f, "lms"),
            Source::Exam => write!(f, "exam"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Course {
    pub id: CourseId,
    pub code: String,
    pub title: String,
    pub lms_fresh_at: Option<DateTime<Utc>>,
    pub exam_fresh_at: Option<DateTime<Utc>>,
}

impl Course {
    pub fn fresh_at(&self, source: Source) -> Option<DateTime<Utc>> {
        match source {
            Source::Lms => self.lms_fresh_at,
            Source::Exam => self.exam_fresh_at,
        }
    }

    /// Sanitized directory name this course's artifacts live under.
    pub fn folder_name(&self) -> String {
        sanitize_path_component(&self.title)
    }
}

/// Replace filesystem-hostile characters and cap length, per the course-folder sanitization
/// rule: `<>:"/\|?*` become `_`, result truncated to 200 chars.
pub fn sanitize_path_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if "<>:\"/\\|?*".contains(c) { '_' } else { c })
        .collect();
    out.truncate(200);
    out
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Enrollment {
    pub user_id: UserId,
    pub course_id: CourseId,
}

/// A file the scrapers have written to disk.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub course_id: CourseId,
    pub source: Source,
    pub path: std::path::PathBuf,
    pub filename: String,
    pub size: u64,
}

/// A span of standardized, cleaned document text ready for embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub course_id: CourseId,
    pub title: String,
    pub url: String,
    pub text: String,
}

/// A chunk paired with its embedding vector, ready to be upserted into the vector store.
#[derive(Clone, Debug)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub chunk: Chunk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_path_component("CS101: Intro/Advanced?"), "CS101_ Intro_Advanced_");
    }

    #[test]
    fn sanitize_truncates_to_200_chars() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_path_component(&long).len(), 200);
    }
}
