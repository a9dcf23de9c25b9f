//! Update Orchestrator (C7): the top-level controller. Loads a user's enrollment (bootstrapping
//! it from the LMS on first run), asks the Freshness Policy what's due, runs the LMS and Exam
//! dispatchers concurrently, advances freshness timestamps for every course that scraped
//! successfully, and hands the union of new downloads to the Ingestion Pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use scraper::{Html, Selector};

use crate::{
    broker::{FormLoginFlow, SessionBroker},
    config::UpdateOptions,
    dispatch::{self, CancellationToken, CourseScraper, DispatchReport},
    error::{Error, Result},
    freshness,
    ingest::{embed::Embedder, standardize::Standardizer, vectorstore::VectorStore, IngestionPipeline},
    metadata::MetadataStore,
    model::{Course, CourseId, Source, UserId},
    progress::{Level, ProgressChannel, ProgressEvent, Stage},
    upstream::{exam, lms, Credentials, ScrapeOutcome, Session, Upstream},
    BoxFuture,
};

/// Per-source counts for one `update` run, named to match the downstream status display's
/// existing field names (§6 exit shape).
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub courses: usize,
    pub files_downloaded: usize,
    pub total_time: std::time::Duration,
}

#[derive(Clone, Debug, Default)]
pub struct ExamStats {
    pub courses: usize,
    pub courses_with_exams: usize,
    pub exams_downloaded: usize,
    pub total_time: std::time::Duration,
}

#[derive(Clone, Debug)]
pub struct UpdateStats {
    pub success: bool,
    pub moodle: SourceStats,
    pub exambase: ExamStats,
    pub total_time: std::time::Duration,
}

impl UpdateStats {
    fn noop(elapsed: std::time::Duration) -> Self {
        Self {
            success: true,
            moodle: SourceStats::default(),
            exambase: ExamStats::default(),
            total_time: elapsed,
        }
    }
}

/// Wraps one course's LMS scrape behind [`CourseScraper`], closing over the storage root,
/// the configured LMS base URL, and the redirect table (§4.3).
struct LmsScraper {
    root: PathBuf,
    base_url: reqwest::Url,
    redirects: Vec<crate::config::CourseRedirect>,
    progress: ProgressChannel,
    page_timeout: Duration,
    download_timeout: Duration,
}

impl CourseScraper for LmsScraper {
    fn scrape<'a>(&'a self, session: &'a Session, course: &'a Course) -> BoxFuture<'a, ScrapeOutcome> {
        Box::pin(async move {
            let landing_url = match self.base_url.join(&format!("course/view.php?id={}", course.code)) {
                Ok(url) => url,
                Err(err) => {
                    let mut outcome = ScrapeOutcome::default();
                    outcome.fatal = Some(Error::config(format!("invalid LMS landing URL: {err}")));
                    return outcome;
                }
            };
            lms::fetch_course(
                session,
                course,
                &self.root,
                &landing_url,
                &self.redirects,
                &self.progress,
                self.page_timeout,
                self.download_timeout,
            )
            .await
        })
    }
}

/// Wraps the exam worker behind [`CourseScraper`]. One task is queued per distinct course
/// code (built by [`group_exam_tasks`]); `code_to_dirs` lets a single search result fan out
/// to every course folder sharing that code (§4.4).
struct ExamScraper {
    search_url: reqwest::Url,
    code_to_dirs: HashMap<String, Vec<(CourseId, PathBuf)>>,
    progress: ProgressChannel,
    page_timeout: Duration,
    download_timeout: Duration,
}

impl CourseScraper for ExamScraper {
    fn scrape<'a>(&'a self, session: &'a Session, course: &'a Course) -> BoxFuture<'a, ScrapeOutcome> {
        Box::pin(async move {
            let Some(dirs) = self.code_to_dirs.get(&course.code) else {
                return ScrapeOutcome::default();
            };
            let pairs: Vec<(CourseId, &Path)> = dirs.iter().map(|(id, p)| (*id, p.as_path())).collect();
            exam::fetch_exams(
                session,
                &self.search_url,
                &course.code,
                &pairs,
                &self.progress,
                self.page_timeout,
                self.download_timeout,
            )
            .await
        })
    }
}

/// Groups `due_exam` by external course code: one representative [`Course`] per code becomes
/// the dispatcher's task (so the exam worker searches each code exactly once), and the
/// returned map lets [`ExamScraper`] find every folder that code's results must be written to.
fn group_exam_tasks(due_exam: &[Course], root: &Path) -> (Vec<Course>, HashMap<String, Vec<(CourseId, PathBuf)>>) {
    let mut by_code: HashMap<String, Vec<Course>> = HashMap::new();
    for course in due_exam {
        by_code.entry(course.code.clone()).or_default().push(course.clone());
    }

    let mut tasks = Vec::with_capacity(by_code.len());
    let mut code_to_dirs = HashMap::with_capacity(by_code.len());
    for (code, group) in by_code {
        let dirs = group.iter().map(|c| (c.id, root.join(c.folder_name()))).collect();
        code_to_dirs.insert(code, dirs);
        tasks.push(group.into_iter().next().expect("group is never empty"));
    }
    (tasks, code_to_dirs)
}

pub struct Orchestrator {
    metadata: MetadataStore,
    options: UpdateOptions,
    ingestion: IngestionPipeline,
    progress: ProgressChannel,
}

impl Orchestrator {
    /// Wires the pipeline's storage, embedding client, and vector store, validating `options`
    /// once at construction (§1.1 ambient stack: "validated once at construction, never
    /// re-read per call"). `standardizer` is supplied by the caller so the document-parser
    /// implementations — external collaborators per §1 — can be swapped without touching this
    /// crate.
    pub async fn new(metadata: MetadataStore, options: UpdateOptions, standardizer: Standardizer) -> Result<Self> {
        options.validate()?;

        let embedder = Arc::new(Embedder::new(options.embedding.clone())?);
        let index_dir = options.storage.root.join(&options.storage.index_dir);
        let store = VectorStore::open(&index_dir).await?;
        let progress = ProgressChannel::new(256);

        let ingestion = IngestionPipeline::new(
            standardizer,
            embedder,
            store,
            options.chunker,
            options.storage.clone(),
            progress.clone(),
        );

        Ok(Self { metadata, options, ingestion, progress })
    }

    /// Subscribes to this orchestrator's progress channel (C8); independent of any in-flight
    /// `update` call, so a caller may subscribe before the first run.
    pub fn subscribe_progress(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Runs one update for `user_id`, per §4.7. `credentials` is held only for the duration of
    /// this call — it is moved into the per-run [`SessionBroker`] and dropped (zeroing its
    /// password) when the broker goes out of scope at the end of this function.
    pub async fn update(&self, user_id: UserId, credentials: Credentials) -> Result<UpdateStats> {
        let run_start = Instant::now();
        self.progress.emit(Level::Info, Stage::Start, format!("update started for user {user_id}"));

        let broker = Arc::new(
            SessionBroker::new(credentials, self.options.upstream.headless)
                .with_flow(
                    Upstream::Lms,
                    Arc::new(FormLoginFlow::new(
                        &self.options.upstream.lms_login_url,
                        &self.options.upstream.login_failure_marker,
                    )?),
                )
                .with_flow(
                    Upstream::Exam,
                    Arc::new(FormLoginFlow::new(
                        &self.options.upstream.exam_login_url,
                        &self.options.upstream.login_failure_marker,
                    )?),
                ),
        );

        let mut courses = self.metadata.enrolled_courses(user_id).await?;
        if courses.is_empty() {
            courses = self.bootstrap_enrollment(user_id, &broker).await?;
        }

        let now = Utc::now();
        let due = freshness::compute_due(&courses, now, &self.options.freshness);

        if due.due_lms.is_empty() && due.due_exam.is_empty() {
            self.progress.emit(Level::Info, Stage::Done, "nothing due");
            return Ok(UpdateStats::noop(run_start.elapsed()));
        }

        let root = self.options.storage.root.join("knowledge_base");

        let lms_scraper: Arc<dyn CourseScraper> = Arc::new(LmsScraper {
            root: root.clone(),
            base_url: reqwest::Url::parse(&self.options.upstream.lms_base_url)
                .map_err(|e| Error::config(e.to_string()))?,
            redirects: self.options.course_redirects.clone(),
            progress: self.progress.clone(),
            page_timeout: self.options.dispatch.page_timeout,
            download_timeout: self.options.dispatch.download_timeout,
        });

        let (exam_tasks, code_to_dirs) = group_exam_tasks(&due.due_exam, &root);
        let exam_scraper: Arc<dyn CourseScraper> = Arc::new(ExamScraper {
            search_url: reqwest::Url::parse(&self.options.upstream.exam_search_url)
                .map_err(|e| Error::config(e.to_string()))?,
            code_to_dirs,
            progress: self.progress.clone(),
            page_timeout: self.options.dispatch.page_timeout,
            download_timeout: self.options.dispatch.download_timeout,
        });

        let due_lms_count = due.due_lms.len();
        let due_exam_count = due.due_exam.len();

        let lms_start = Instant::now();
        let exam_start = Instant::now();
        let (lms_report, exam_report) = tokio::join!(
            dispatch::dispatch(
                Upstream::Lms,
                due.due_lms,
                self.options.dispatch.parallel_workers,
                broker.clone(),
                lms_scraper,
                self.progress.clone(),
                CancellationToken::new(),
                None,
            ),
            dispatch::dispatch(
                Upstream::Exam,
                exam_tasks,
                self.options.dispatch.parallel_workers,
                broker.clone(),
                exam_scraper,
                self.progress.clone(),
                CancellationToken::new(),
                Some(self.options.dispatch.exam_poll_interval),
            ),
        );
        let lms_time = lms_start.elapsed();
        let exam_time = exam_start.elapsed();

        self.advance_freshness(&lms_report, Source::Lms, now).await;
        self.advance_freshness(&exam_report, Source::Exam, now).await;

        let mut new_files = lms_report.new_files();
        new_files.extend(exam_report.new_files());

        self.progress.emit(Level::Info, Stage::IngestionStart, format!("{} files to ingest", new_files.len()));
        let ingestion_stats = self.ingestion.ingest(&new_files).await;

        let success = !lms_report.source_fatal && !exam_report.source_fatal;

        let moodle = SourceStats {
            courses: due_lms_count,
            files_downloaded: lms_report.new_files().len(),
            total_time: lms_time,
        };
        let courses_with_exams = exam_report.results.iter().filter(|r| !r.new_files.is_empty()).count();
        let exambase = ExamStats {
            courses: due_exam_count,
            courses_with_exams,
            exams_downloaded: exam_report.new_files().len(),
            total_time: exam_time,
        };

        self.progress.emit(
            Level::Info,
            Stage::Done,
            format!(
                "update complete: {} files downloaded, {} ingested, success={success}",
                moodle.files_downloaded + exambase.exams_downloaded,
                ingestion_stats.files_processed
            ),
        );

        Ok(UpdateStats { success, moodle, exambase, total_time: run_start.elapsed() })
    }

    /// Advances freshness for every course a dispatcher reports as successfully scraped
    /// (§4.7 step 6); a per-course storage failure is logged but does not escalate, matching
    /// §7's `StorageError` propagation policy.
    async fn advance_freshness(&self, report: &DispatchReport, source: Source, now: chrono::DateTime<Utc>) {
        for course_id in report.courses_scraped_ok() {
            if let Err(err) = self.metadata.advance_freshness(course_id, source, now).await {
                self.progress.emit(
                    Level::Warn,
                    Stage::FileFailed,
                    format!("freshness advance failed for course {course_id} ({source}): {err}"),
                );
            }
        }
    }

    /// First-run bootstrap (§4.7 step 1): logs into the LMS, harvests the user's course
    /// dashboard, and inserts any course/enrollment rows the metadata store doesn't already
    /// have.
    async fn bootstrap_enrollment(&self, user_id: UserId, broker: &SessionBroker) -> Result<Vec<Course>> {
        self.progress.emit(Level::Info, Stage::Start, "bootstrapping enrollment from LMS dashboard");

        let mut session = broker.acquire(Upstream::Lms).await?;
        let dashboard_url = reqwest::Url::parse(&format!(
            "{}/my/",
            self.options.upstream.lms_base_url.trim_end_matches('/')
        ))
        .map_err(|e| Error::config(e.to_string()))?;

        let body = session
            .client()
            .get(dashboard_url)
            .send()
            .await?
            .error_for_status()
            .map_err(Error::from)?
            .text()
            .await
            .map_err(Error::from)?;
        session.close();

        let mut courses = Vec::new();
        for (code, title) in parse_course_links(&body) {
            let course_id = self.metadata.upsert_course(&code, &title).await?;
            self.metadata.enroll(user_id, course_id).await?;
            courses.push(Course { id: course_id, code, title, lms_fresh_at: None, exam_fresh_at: None });
        }
        Ok(courses)
    }
}

/// Extracts `(course_code, title)` pairs from an LMS dashboard page: every anchor linking to
/// `course/view.php?id=...`, deduplicated by code.
fn parse_course_links(html: &str) -> Vec<(String, String)> {
    let document = Html::parse_document(html);
    let sel = Selector::parse(r#"a[href*="course/view.php"]"#).unwrap();

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for el in document.select(&sel) {
        let Some(href) = el.value().attr("href") else { continue };
        let Some(code) = extract_course_id(href) else { continue };
        let title = el.text().collect::<String>().trim().to_string();
        if title.is_empty() || !seen.insert(code.clone()) {
            continue;
        }
        out.push((code, title));
    }
    out
}

fn extract_course_id(href: &str) -> Option<String> {
    let query = href.split('?').nth(1)?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "id").then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_course_id_reads_id_query_param() {
        assert_eq!(
            extract_course_id("/course/view.php?id=42&notifyeditingon=1"),
            Some("42".to_string())
        );
        assert_eq!(extract_course_id("/course/view.php"), None);
    }

    #[test]
    fn parse_course_links_dedupes_by_code() {
        let html = r#"
            <html><body>
                <a href="/course/view.php?id=1">Intro to CS</a>
                <a href="/course/view.php?id=1">Intro to CS (sidebar link)</a>
                <a href="/course/view.php?id=2">Algorithms</a>
            </body></html>
        "#;
        let links = parse_course_links(html);
        assert_eq!(links.len(), 2);
        assert!(links.contains(&("1".to_string(), "Intro to CS".to_string())));
        assert!(links.contains(&("2".to_string(), "Algorithms".to_string())));
    }

    #[test]
    fn group_exam_tasks_shares_one_task_per_code() {
        let root = PathBuf::from("/data/knowledge_base");
        let c1 = Course { id: 1, code: "XYZ100".to_string(), title: "Section A".to_string(), lms_fresh_at: None, exam_fresh_at: None };
        let c2 = Course { id: 2, code: "XYZ100".to_string(), title: "Section B".to_string(), lms_fresh_at: None, exam_fresh_at: None };
        let c3 = Course { id: 3, code: "ABC200".to_string(), title: "Other".to_string(), lms_fresh_at: None, exam_fresh_at: None };

        let (tasks, code_to_dirs) = group_exam_tasks(&[c1, c2, c3], &root);

        assert_eq!(tasks.len(), 2);
        assert_eq!(code_to_dirs.get("XYZ100").unwrap().len(), 2);
        assert_eq!(code_to_dirs.get("ABC200").unwrap().len(), 1);
    }
}
