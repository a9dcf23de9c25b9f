//! Cross-module integration test for the Update Orchestrator: a cold-start run (no prior
//! enrollment, no prior freshness) against a single local mock server standing in for both
//! the LMS and the exam repository, plus a mock embedding endpoint. Exercises bootstrap,
//! concurrent dispatch, freshness advancement, and ingestion end to end without any real
//! network dependency.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use kb_sync::config::{DispatchOptions, EmbeddingOptions, StorageOptions, UpdateOptions, UpstreamOptions};
use kb_sync::ingest::standardize::{Paragraph, PdfExtractor, PresentationExtractor, Slide, Standardizer, WordProcessingExtractor};
use kb_sync::ingest::vectorstore::VectorStore;
use kb_sync::metadata::MetadataStore;
use kb_sync::orchestrator::Orchestrator;
use kb_sync::upstream::Credentials;

type Handler = Box<dyn Fn(&str) -> (u16, &'static str, String) + Send + Sync>;

/// A minimal routing HTTP/1.1 server: one background thread, one route table keyed by
/// (method, path-without-query). Good enough to stand in for both upstreams and the
/// embedding endpoint within a single test, without pulling in an HTTP-mocking crate.
fn start_mock_server(routes: HashMap<(&'static str, &'static str), Handler>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let (method, path, body) = read_request(&mut stream);
            let response = routes
                .get(&(method.as_str(), path.as_str()))
                .map(|handler| handler(&body))
                .unwrap_or((404, "text/plain", "not found".to_string()));
            write_response(&mut stream, response.0, response.1, &response.2);
        }
    });
    format!("http://{addr}")
}

fn read_request(stream: &mut TcpStream) -> (String, String, String) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    let mut request_line = String::new();
    reader.read_line(&mut request_line).unwrap();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_string();
    let full_path = parts.next().unwrap_or("/").to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
            break;
        }
        if let Some(rest) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = rest.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).unwrap();
    }

    let path = full_path.split('?').next().unwrap_or(&full_path).to_string();
    (method, path, String::from_utf8_lossy(&body).into_owned())
}

fn write_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status} x\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}

fn fixed(status: u16, content_type: &'static str, body: &str) -> Handler {
    let body = body.to_string();
    Box::new(move |_req_body| (status, content_type, body.clone()))
}

/// Stands in for the embedding provider: echoes back one deterministic vector per input text
/// so the number of chunks produced upstream is never hard-coded into the test.
fn embedding_handler() -> Handler {
    Box::new(|req_body| {
        let parsed: serde_json::Value = serde_json::from_str(req_body).unwrap_or(serde_json::Value::Null);
        let n = parsed.get("input").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(1);
        let data: Vec<serde_json::Value> =
            (0..n).map(|i| serde_json::json!({"embedding": [i as f32 + 1.0, 0.0]})).collect();
        (200, "application/json", serde_json::json!({"data": data}).to_string())
    })
}

struct StubPdf(Vec<String>);
impl PdfExtractor for StubPdf {
    fn extract_pages(&self, _bytes: &[u8]) -> kb_sync::error::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

struct StubPresentation;
impl PresentationExtractor for StubPresentation {
    fn extract_slides(&self, _bytes: &[u8]) -> kb_sync::error::Result<Vec<Slide>> {
        Ok(Vec::new())
    }
}

struct StubWord;
impl WordProcessingExtractor for StubWord {
    fn extract_paragraphs(&self, _bytes: &[u8]) -> kb_sync::error::Result<Vec<Paragraph>> {
        Ok(Vec::new())
    }
}

fn test_standardizer() -> Standardizer {
    Standardizer {
        pdf: Arc::new(StubPdf(vec![
            "Lecture content covering the topics examined this week, long enough to form a \
             complete chunk for the ingestion pipeline to embed and store."
                .to_string(),
        ])),
        presentation: Arc::new(StubPresentation),
        word_processing: Arc::new(StubWord),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_start_bootstraps_scrapes_and_ingests_one_course() {
    let mut routes: HashMap<(&'static str, &'static str), Handler> = HashMap::new();

    routes.insert(("POST", "/lms-login"), fixed(200, "text/html", "welcome"));
    routes.insert(("POST", "/exam-login"), fixed(200, "text/html", "welcome"));

    routes.insert(
        ("GET", "/my/"),
        fixed(200, "text/html", r#"<html><body><a href="/course/view.php?id=101">Intro to CS</a></body></html>"#),
    );
    routes.insert(
        ("GET", "/course/view.php"),
        fixed(
            200,
            "text/html",
            r#"<html><body><a href="/pluginfile/1/notes.pdf">Lecture Notes</a></body></html>"#,
        ),
    );
    routes.insert(("GET", "/pluginfile/1/notes.pdf"), fixed(200, "application/pdf", "ok"));

    routes.insert(
        ("GET", "/search"),
        fixed(
            200,
            "text/html",
            r#"<ul><li class="result"><a href="/papers/final.pdf">Final Exam</a> exam date 3-11-2022</li></ul>"#,
        ),
    );
    routes.insert(("GET", "/papers/final.pdf"), fixed(200, "application/pdf", "ok"));

    routes.insert(("POST", "/embed"), embedding_handler());

    let base = start_mock_server(routes);

    let storage_dir = tempfile::tempdir().unwrap();
    let metadata_dir = tempfile::tempdir().unwrap();
    let metadata_url = format!("sqlite://{}/meta.db", metadata_dir.path().display());

    let metadata = MetadataStore::connect(&metadata_url).await.unwrap();

    let options = UpdateOptions::builder()
        .dispatch(DispatchOptions::builder().parallel_workers(1).build())
        .embedding(EmbeddingOptions::builder().api_url(format!("{base}/embed")).build())
        .storage(
            StorageOptions::builder()
                .root(storage_dir.path().to_path_buf())
                .knowledge_base_url("https://static.example.edu".to_string())
                .build(),
        )
        .upstream(
            UpstreamOptions::builder()
                .lms_base_url(base.clone())
                .lms_login_url(format!("{base}/lms-login"))
                .exam_search_url(format!("{base}/search"))
                .exam_login_url(format!("{base}/exam-login"))
                .build(),
        )
        .build();

    let index_dir = options.storage.root.join(&options.storage.index_dir);

    let orchestrator = Orchestrator::new(metadata.clone(), options, test_standardizer()).await.unwrap();
    let stats = orchestrator.update(1, Credentials::new("alice", "hunter2")).await.unwrap();

    assert!(stats.success);
    assert_eq!(stats.moodle.courses, 1);
    assert_eq!(stats.moodle.files_downloaded, 1);
    assert_eq!(stats.exambase.courses, 1);
    assert_eq!(stats.exambase.courses_with_exams, 1);
    assert_eq!(stats.exambase.exams_downloaded, 1);

    let courses = metadata.enrolled_courses(1).await.unwrap();
    assert_eq!(courses.len(), 1);
    assert!(courses[0].lms_fresh_at.is_some());
    assert!(courses[0].exam_fresh_at.is_some());

    let course_dir = storage_dir.path().join("knowledge_base").join(courses[0].folder_name());
    assert!(course_dir.join("notes.pdf").exists());
    assert!(course_dir.join("101_Final_Exam_2022-11-03.pdf").exists());

    let store = VectorStore::open(&index_dir).await.unwrap();
    let count = store.count(courses[0].id).await.unwrap();
    assert!(count >= 2, "expected at least one vector per ingested file, got {count}");
}

#[tokio::test(flavor = "multi_thread")]
async fn warm_run_with_nothing_due_is_a_fast_noop() {
    let mut routes: HashMap<(&'static str, &'static str), Handler> = HashMap::new();
    routes.insert(("POST", "/lms-login"), fixed(200, "text/html", "welcome"));
    routes.insert(("POST", "/exam-login"), fixed(200, "text/html", "welcome"));
    let base = start_mock_server(routes);

    let storage_dir = tempfile::tempdir().unwrap();
    let metadata_dir = tempfile::tempdir().unwrap();
    let metadata_url = format!("sqlite://{}/meta.db", metadata_dir.path().display());
    let metadata = MetadataStore::connect(&metadata_url).await.unwrap();

    let course_id = metadata.upsert_course("101", "Intro to CS").await.unwrap();
    metadata.enroll(1, course_id).await.unwrap();
    metadata.advance_freshness(course_id, kb_sync::model::Source::Lms, chrono::Utc::now()).await.unwrap();
    metadata.advance_freshness(course_id, kb_sync::model::Source::Exam, chrono::Utc::now()).await.unwrap();

    let options = UpdateOptions::builder()
        .embedding(EmbeddingOptions::builder().api_url(format!("{base}/embed")).build())
        .storage(
            StorageOptions::builder()
                .root(storage_dir.path().to_path_buf())
                .knowledge_base_url("https://static.example.edu".to_string())
                .build(),
        )
        .upstream(
            UpstreamOptions::builder()
                .lms_base_url(base.clone())
                .lms_login_url(format!("{base}/lms-login"))
                .exam_search_url(format!("{base}/search"))
                .exam_login_url(format!("{base}/exam-login"))
                .build(),
        )
        .build();

    let orchestrator = Orchestrator::new(metadata, options, test_standardizer()).await.unwrap();
    let stats = orchestrator.update(1, Credentials::new("alice", "hunter2")).await.unwrap();

    assert!(stats.success);
    assert_eq!(stats.moodle.files_downloaded, 0);
    assert_eq!(stats.exambase.exams_downloaded, 0);
}
