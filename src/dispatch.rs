//! Parallel Dispatcher (C5): runs up to N workers per source against a shared task queue,
//! pulling courses (pull model, not pre-partitioned) so slow and fast courses naturally load
//! balance across the pool.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::{
    broker::SessionBroker,
    error::Error,
    model::{Course, CourseId},
    progress::{ProgressChannel, Stage},
    upstream::{ScrapeOutcome, Session, Upstream},
    BoxFuture,
};

/// Result of one dispatched task (one course for the LMS, one course-code group for the
/// exam repo — see [`crate::upstream::ScrapeOutcome::courses_touched`]).
#[derive(Debug)]
pub struct CourseResult {
    /// The task's nominal course id (the one the dispatcher queued).
    pub course_id: CourseId,
    /// Every course this task's scrape actually touched — for the LMS this is always just
    /// `course_id`; for the exam worker it is every course sharing the searched code.
    pub courses_touched: Vec<CourseId>,
    pub new_files: Vec<(CourseId, std::path::PathBuf)>,
    pub duplicates: usize,
    pub errors: Vec<Error>,
    pub scraped_ok: bool,
}

/// Aggregate result of one `dispatch` call: the per-course results plus a flag marking
/// whether the *source itself* suffered a catastrophic failure (e.g. every worker failed to
/// log in) — distinct from individual courses failing, which is recorded per-course.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub results: Vec<CourseResult>,
    pub source_fatal: bool,
}

impl DispatchReport {
    pub fn new_files(&self) -> Vec<(CourseId, std::path::PathBuf)> {
        self.results.iter().flat_map(|r| r.new_files.iter().cloned()).collect()
    }

    pub fn courses_scraped_ok(&self) -> impl Iterator<Item = CourseId> + '_ {
        self.results.iter().filter(|r| r.scraped_ok).flat_map(|r| r.courses_touched.iter().copied())
    }
}

/// Cooperative cancellation handle for an in-flight `dispatch` call. Setting it stops the
/// pool from pulling new tasks off the queue; workers mid-course still finish their current
/// file before observing it (§4.5 cancellation semantics).
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The per-upstream scraping algorithm (C3 or C4), supplied by the caller so the dispatcher
/// itself stays generic over "a source". Implementations close over whatever per-course
/// config (landing-page URL builder, search endpoint, storage root) their upstream needs.
pub trait CourseScraper: Send + Sync {
    fn scrape<'a>(&'a self, session: &'a Session, course: &'a Course) -> BoxFuture<'a, ScrapeOutcome>;
}

/// Runs `tasks` through a pool of `workers` concurrent workers against `upstream`, each
/// owning its own session acquired from `broker`. Workers are created eagerly and their
/// sessions closed (via `Session`'s `Drop`) when the pool drains (§4.5).
///
/// `poll_delay`, when set, is observed by each worker between consecutive tasks it pulls off
/// the queue — the exam repository's "be polite between distinct course codes" requirement
/// (§4.4 step 4). The LMS dispatcher passes `None`.
pub async fn dispatch(
    upstream: Upstream,
    tasks: Vec<Course>,
    workers: usize,
    broker: Arc<SessionBroker>,
    scraper: Arc<dyn CourseScraper>,
    progress: ProgressChannel,
    cancel: CancellationToken,
    poll_delay: Option<Duration>,
) -> DispatchReport {
    let workers = workers.max(1);
    let (task_tx, task_rx) = mpsc::channel::<Course>(tasks.len().max(1));
    for course in tasks {
        let _ = task_tx.send(course).await;
    }
    drop(task_tx);

    let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<CourseResult>(workers * 4);

    let mut handles = Vec::with_capacity(workers);

    for worker_id in 0..workers {
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let broker = broker.clone();
        let scraper = scraper.clone();
        let progress = progress.clone();
        let cancel = cancel.clone();
        let poll_delay = poll_delay;

        let handle: tokio::task::JoinHandle<Result<(), Error>> = tokio::spawn(async move {
            progress.emit(
                crate::progress::Level::Info,
                Stage::WorkerLaunched,
                format!("{upstream:?} worker {worker_id} launched"),
            );

            // Eagerly acquire the session; if login fails this worker contributes zero
            // courses but does not panic the pool (§4.2 AuthError is fatal to a worker, not
            // to the whole process).
            let mut session = broker.acquire(upstream).await?;
            let mut first_task = true;

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = { task_rx.lock().await.recv().await };
                let Some(course) = next else { break };

                if let Some(delay) = poll_delay {
                    if !first_task {
                        tokio::time::sleep(delay).await;
                    }
                }
                first_task = false;

                let outcome = scraper.scrape(&session, &course).await;
                let scraped_ok = outcome.fatal.is_none();
                let courses_touched = if outcome.courses_touched.is_empty() && scraped_ok {
                    vec![course.id]
                } else {
                    outcome.courses_touched
                };
                let result = CourseResult {
                    course_id: course.id,
                    courses_touched,
                    new_files: outcome.new_files,
                    duplicates: outcome.duplicates,
                    errors: outcome.errors,
                    scraped_ok,
                };
                progress.course_completed(course.id, upstream_source(upstream), result.new_files.len());
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }

            session.close();
            Ok(())
        });
        handles.push(handle);
    }
    drop(result_tx);

    let mut results = Vec::new();
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }

    let mut login_failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => login_failures += 1,
            Err(_join_err) => login_failures += 1,
        }
    }

    // The source is only considered catastrophically failed if *every* worker failed to
    // even log in — a few workers failing while others succeed just reduces parallelism.
    let source_fatal = login_failures == workers;

    DispatchReport { results, source_fatal }
}

fn upstream_source(upstream: Upstream) -> crate::model::Source {
    match upstream {
        Upstream::Lms => crate::model::Source::Lms,
        Upstream::Exam => crate::model::Source::Exam,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchOptions;
    use std::sync::atomic::AtomicUsize;

    struct CountingScraper {
        calls: Arc<AtomicUsize>,
    }

    impl CourseScraper for CountingScraper {
        fn scrape<'a>(&'a self, _session: &'a Session, course: &'a Course) -> BoxFuture<'a, ScrapeOutcome> {
            let calls = self.calls.clone();
            let course_title = course.title.clone();
            let course_id = course.id;
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut outcome = ScrapeOutcome::default();
                outcome.new_files.push((course_id, std::path::PathBuf::from(format!("{course_title}.pdf"))));
                outcome.courses_touched.push(course_id);
                outcome
            })
        }
    }

    fn course(id: crate::model::CourseId) -> Course {
        Course { id, code: format!("C{id}"), title: format!("Course {id}"), lms_fresh_at: None, exam_fresh_at: None }
    }

    #[tokio::test]
    async fn every_task_is_claimed_exactly_once() {
        use crate::upstream::Credentials;

        struct NoopFlow;
        #[async_trait::async_trait]
        impl crate::broker::LoginFlow for NoopFlow {
            async fn login(&self, _s: &Session, _c: &Credentials) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let broker = Arc::new(
            SessionBroker::new(Credentials::new("u", "p"), true)
                .with_flow(Upstream::Lms, Arc::new(NoopFlow)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let scraper: Arc<dyn CourseScraper> = Arc::new(CountingScraper { calls: calls.clone() });
        let progress = ProgressChannel::new(16);
        let opts = DispatchOptions::default();

        let tasks = (1..=6).map(course).collect::<Vec<_>>();
        let report = dispatch(
            Upstream::Lms,
            tasks,
            opts.parallel_workers,
            broker,
            scraper,
            progress,
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(report.results.len(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(!report.source_fatal);
    }
}
