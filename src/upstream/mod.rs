//! Upstream scrape workers (C3, C4) and the authenticated-session abstraction they share.
//!
//! Both upstreams are "HTML over HTTPS behind an interactive login"; the only things that
//! differ between them are the login flow and the page-scraping algorithm, so both live
//! behind the same [`Session`] contract and are driven by the same [`crate::dispatch`] pool.

pub mod exam;
pub mod lms;

use std::sync::Arc;

use reqwest::{cookie::Jar, Client};

use crate::{
    error::{Error, Result},
    model::CourseId,
};

/// A named upstream. Kept distinct from [`crate::model::Source`], which tags *data* (a
/// course's freshness timestamp, a downloaded artifact); this one tags a *login flow*.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Upstream {
    Lms,
    Exam,
}

impl From<crate::model::Source> for Upstream {
    fn from(source: crate::model::Source) -> Self {
        match source {
            crate::model::Source::Lms => Upstream::Lms,
            crate::model::Source::Exam => Upstream::Exam,
        }
    }
}

/// A user's upstream credentials, held only for the lifetime of one update run.
///
/// `Debug` is implemented by hand so the password never reaches a log line; [`Drop`] zeroes
/// the password's backing bytes before the allocation is freed, per the credential-lifetime
/// design note.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

use zeroize::Zeroize;

/// Which phase of its lifecycle a [`Session`] is in. Transitions are driven entirely by
/// [`crate::broker::SessionBroker::acquire`]; nothing outside the broker mutates this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    LoggingIn,
    Authenticated,
    Closed,
}

/// An authenticated context against one upstream: an independent cookie jar plus the HTTP
/// client bound to it. Not `Clone` — each dispatcher worker owns exactly one, created fresh
/// by the broker and closed at the end of its `dispatch` call (§4.5).
pub struct Session {
    upstream: Upstream,
    state: SessionState,
    client: Client,
    jar: Arc<Jar>,
}

impl Session {
    pub(crate) fn new(upstream: Upstream, client: Client, jar: Arc<Jar>) -> Self {
        Self { upstream, state: SessionState::New, client, jar }
    }

    pub fn upstream(&self) -> Upstream {
        self.upstream
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// Extensions the union of document types a scrape worker is willing to keep; matches the
/// ingestion pipeline's standardizer dispatch so nothing is downloaded that cannot later be
/// ingested.
pub const ALLOWED_EXTENSIONS: &[&str] =
    &["pdf", "doc", "docx", "ppt", "pptx", "txt", "md", "html"];

/// Archive/image extensions explicitly rejected even if they otherwise look like a document
/// link (e.g. a `.zip` bundle of slides).
pub const REJECTED_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "gz", "tar", "jpg", "jpeg", "png", "gif", "bmp", "svg", "webp",
];

pub fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_allowed_document(filename: &str) -> bool {
    match extension_of(filename) {
        Some(ext) if REJECTED_EXTENSIONS.contains(&ext.as_str()) => false,
        Some(ext) => ALLOWED_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

/// Result of scraping a single course/course-code against one upstream. Mirrors the
/// `{new_files, duplicates, errors}` contract of §4.3/§4.4.
///
/// `new_files` is keyed per-course rather than a bare path list so the exam worker's
/// multi-folder fan-out (§4.4: several internal courses sharing one external code) can
/// report files written into sibling courses' folders without losing which course each file
/// belongs to — the Ingestion Pipeline (C6) needs that to pick the right vector collection.
#[derive(Debug, Default)]
pub struct ScrapeOutcome {
    pub new_files: Vec<(CourseId, std::path::PathBuf)>,
    pub duplicates: usize,
    pub errors: Vec<Error>,
    /// Set when the upstream could not be reached/parsed at all for this course (a fatal,
    /// per-course session error) — distinct from per-file errors, which live in `errors`
    /// without setting this.
    pub fatal: Option<Error>,
    /// Every course that was actually scraped (even if only with per-file errors), used by
    /// the exam worker to report success for every course sharing a code, not just the one
    /// the dispatcher happened to key the task on.
    pub courses_touched: Vec<CourseId>,
}

impl ScrapeOutcome {
    pub fn scraped_ok(&self) -> bool {
        self.fatal.is_none()
    }
}

/// Streams an HTTP response body to `path`, creating parent directories as needed. Shared by
/// both scrape workers; the caller is responsible for having already decided the file is
/// new (duplicate detection happens before this is called).
pub(crate) async fn stream_to_file(
    response: reqwest::Response,
    path: &std::path::Path,
) -> Result<u64> {
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(Error::from)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Case-insensitive "does a file with this name already exist" check, per the duplicate
/// rule in §3 (filename uniqueness within a course folder is case-folded).
pub(crate) async fn filename_exists_case_insensitive(dir: &std::path::Path, filename: &str) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    let target = filename.to_ascii_lowercase();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            if name.to_ascii_lowercase() == target {
                return true;
            }
        }
    }
    false
}
