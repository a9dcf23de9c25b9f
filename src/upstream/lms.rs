//! LMS Scrape Worker (C3): enumerates a course's resource links, resolves them to concrete
//! file URLs, and downloads new documents into the course's folder.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use scraper::{Html, Selector};

use crate::{
    config::CourseRedirect,
    error::Error,
    model::Course,
    progress::{ProgressChannel, Stage},
    upstream::{self, ScrapeOutcome, Session},
};

/// Substring that marks a link as a direct-download file link on this LMS family (e.g.
/// Moodle's `pluginfile.php` path segment). Configurable, not hard-coded, so the worker can
/// target a differently-skinned LMS without a code change.
const DEFAULT_DIRECT_FILE_MARKER: &str = "pluginfile";

struct Candidate {
    filename: String,
    url: reqwest::Url,
}

/// Scrapes one course. `landing_url` is the course's landing page on the LMS (or, when
/// `redirects` matches the course title, the alternate static root — see §4.3 special-case
/// courses).
pub async fn fetch_course(
    session: &Session,
    course: &Course,
    root: &Path,
    landing_url: &reqwest::Url,
    redirects: &[CourseRedirect],
    progress: &ProgressChannel,
    page_timeout: Duration,
    download_timeout: Duration,
) -> ScrapeOutcome {
    let mut outcome = ScrapeOutcome::default();

    let effective_url = redirect_for(course, redirects).unwrap_or_else(|| landing_url.clone());

    let body = match session.client().get(effective_url.clone()).timeout(page_timeout).send().await {
        Ok(resp) => match resp.error_for_status() {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(err) => {
                    outcome.fatal = Some(Error::from(err));
                    return outcome;
                }
            },
            Err(err) => {
                outcome.fatal = Some(Error::from(err));
                return outcome;
            }
        },
        Err(err) => {
            outcome.fatal = Some(Error::from(err));
            return outcome;
        }
    };

    let mut candidates = Vec::new();
    collect_candidates_from_html(&body, &effective_url, &mut candidates);

    // Resource/folder links: fetch each to classify by Content-Type.
    let resource_links = anchor_links(&body, &effective_url)
        .into_iter()
        .filter(|url| !contains_direct_marker(url.as_str()))
        .collect::<Vec<_>>();

    for link in resource_links {
        match session.client().get(link.clone()).timeout(page_timeout).send().await {
            Ok(resp) => {
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let content_disposition = resp
                    .headers()
                    .get(reqwest::header::CONTENT_DISPOSITION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                if content_type.contains("text/html") {
                    match resp.text().await {
                        Ok(nested) => collect_candidates_from_html(&nested, &link, &mut candidates),
                        Err(err) => outcome.errors.push(Error::from(err)),
                    }
                } else {
                    let filename = filename_from_disposition(content_disposition.as_deref())
                        .unwrap_or_else(|| filename_from_url(&link));
                    if upstream::is_allowed_document(&filename) {
                        candidates.push(Candidate { filename, url: link });
                    }
                }
            }
            Err(err) => outcome.errors.push(Error::from(err)),
        }
    }

    // Filter + dedupe by filename within this enumeration (§4.3 steps 3-4).
    let mut seen = HashSet::new();
    let mut deduped = Vec::new();
    for candidate in candidates {
        if !upstream::is_allowed_document(&candidate.filename) {
            continue;
        }
        let key = candidate.filename.to_ascii_lowercase();
        if seen.insert(key) {
            deduped.push(candidate);
        }
    }

    let course_dir = root.join(course.folder_name());
    let mut downloaded_this_run: HashSet<String> = HashSet::new();

    for candidate in deduped {
        let key = candidate.filename.to_ascii_lowercase();
        let target = course_dir.join(&candidate.filename);

        if downloaded_this_run.contains(&key)
            || upstream::filename_exists_case_insensitive(&course_dir, &candidate.filename).await
        {
            outcome.duplicates += 1;
            continue;
        }

        progress.file_event(Stage::FileDownloading, &candidate.filename);
        match session.client().get(candidate.url.clone()).timeout(download_timeout).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match upstream::stream_to_file(resp, &target).await {
                    Ok(_) => {
                        downloaded_this_run.insert(key);
                        outcome.new_files.push((course.id, target));
                        progress.file_event(Stage::FileOk, &candidate.filename);
                    }
                    Err(err) => {
                        progress.file_event(Stage::FileFailed, &candidate.filename);
                        outcome.errors.push(err);
                    }
                },
                Err(err) => {
                    progress.file_event(Stage::FileFailed, &candidate.filename);
                    outcome.errors.push(Error::from(err));
                }
            },
            Err(err) => {
                progress.file_event(Stage::FileFailed, &candidate.filename);
                outcome.errors.push(Error::from(err));
            }
        }
    }

    outcome.courses_touched.push(course.id);
    outcome
}

fn redirect_for(course: &Course, redirects: &[CourseRedirect]) -> Option<reqwest::Url> {
    redirects
        .iter()
        .find(|r| r.title_pattern.is_match(&course.title))
        .and_then(|r| reqwest::Url::parse(&r.alternate_root_url).ok())
}

fn contains_direct_marker(url: &str) -> bool {
    url.contains(DEFAULT_DIRECT_FILE_MARKER)
}

/// Collects direct file links out of `html`: anchors matching the direct-file marker, plus
/// anything found inside `object`/`embed`/`iframe` elements, per §4.3 step 2.
fn collect_candidates_from_html(html: &str, base: &reqwest::Url, out: &mut Vec<Candidate>) {
    let document = Html::parse_document(html);

    let anchor_sel = Selector::parse("a[href]").unwrap();
    for el in document.select(&anchor_sel) {
        if let Some(href) = el.value().attr("href") {
            if let Ok(url) = base.join(href) {
                if contains_direct_marker(url.as_str()) {
                    out.push(Candidate { filename: filename_from_url(&url), url });
                }
            }
        }
    }

    for tag in ["object", "embed", "iframe"] {
        let sel = Selector::parse(tag).unwrap();
        let attr = if tag == "object" { "data" } else { "src" };
        for el in document.select(&sel) {
            if let Some(href) = el.value().attr(attr) {
                if let Ok(url) = base.join(href) {
                    out.push(Candidate { filename: filename_from_url(&url), url });
                }
            }
        }
    }
}

fn anchor_links(html: &str, base: &reqwest::Url) -> Vec<reqwest::Url> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("a[href]").unwrap();
    document
        .select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .collect()
}

/// URL-path-decoded basename, matching §4.3 step 2's "filename is URL-path-decoded
/// basename" rule.
fn filename_from_url(url: &reqwest::Url) -> String {
    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("download");
    percent_decode_str(last_segment).decode_utf8_lossy().into_owned()
}

fn filename_from_disposition(header: Option<&str>) -> Option<String> {
    let header = header?;
    let params: HashMap<&str, &str> = header
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .map(|(k, v)| (k.trim(), v.trim().trim_matches('"')))
        .collect();
    params.get("filename").map(|s| s.to_string())
}
