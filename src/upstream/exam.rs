//! Exam Scrape Worker (C4): searches the exam repository by course code, derives a
//! canonical filename per result, and downloads papers into every course folder mapped to
//! that code (§4.4 multi-folder fan-out).

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;

use crate::{
    error::Error,
    progress::{ProgressChannel, Stage},
    upstream::{self, ScrapeOutcome, Session},
};

static DATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})-(\d{1,2})-(\d{4})\b").unwrap());
static SUBCLASS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)subclasses?\s*[:\-]?\s*([A-Za-z](?:\s*,\s*[A-Za-z])*)").unwrap());
static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExamResult {
    pub title: String,
    pub url: String,
    pub date: Option<(i32, u32, u32)>,
    pub subclasses: Vec<String>,
}

/// Parses the result listing from a search response body. Each result row is assumed to
/// carry a title, a link, and a surrounding text block the date/subclass patterns are
/// matched against (§4.4 step 2).
pub fn parse_results(html: &str, base: &reqwest::Url) -> Vec<ExamResult> {
    let document = Html::parse_document(html);
    let row_sel = Selector::parse(".result, .search-result, li").unwrap();
    let link_sel = Selector::parse("a[href]").unwrap();

    let mut results = Vec::new();
    for row in document.select(&row_sel) {
        let Some(link_el) = row.select(&link_sel).next() else { continue };
        let Some(href) = link_el.value().attr("href") else { continue };
        if !href.to_ascii_lowercase().ends_with(".pdf") {
            continue;
        }
        let Ok(url) = base.join(href) else { continue };

        let title = link_el.text().collect::<String>().trim().to_string();
        if title.is_empty() {
            continue;
        }
        let text_block: String = row.text().collect::<Vec<_>>().join(" ");

        let date = DATE_PATTERN.captures(&text_block).and_then(|caps| {
            let day: u32 = caps[1].parse().ok()?;
            let month: u32 = caps[2].parse().ok()?;
            let year: i32 = caps[3].parse().ok()?;
            Some((year, month, day))
        });

        let subclasses = SUBCLASS_PATTERN
            .captures(&text_block)
            .map(|caps| {
                caps[1]
                    .split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        results.push(ExamResult { title, url: url.to_string(), date, subclasses });
    }
    results
}

/// Builds the deterministic canonical filename for a result, per §4.4 step 2:
/// `<code>_<title_slug>[_<yyyy-mm-dd>][_subclass_<A>_<B>...].pdf`.
pub fn canonical_filename(course_code: &str, result: &ExamResult) -> String {
    let slug = title_slug(&result.title);
    let mut name = format!("{course_code}_{slug}");
    if let Some((year, month, day)) = result.date {
        name.push_str(&format!("_{year:04}-{month:02}-{day:02}"));
    }
    if !result.subclasses.is_empty() {
        name.push_str("_subclass");
        for sc in &result.subclasses {
            name.push('_');
            name.push_str(sc);
        }
    }
    name.push_str(".pdf");
    name
}

fn title_slug(title: &str) -> String {
    let stripped = NON_WORD.replace_all(title, "");
    WHITESPACE.replace_all(stripped.trim(), "_").into_owned()
}

/// Searches for `course_code` once and writes any new papers into every folder in
/// `course_dirs` (§4.4 multi-folder fan-out: several internal courses may share one
/// external code). Returns a single aggregated [`ScrapeOutcome`] whose `new_files` carries
/// the owning course id alongside each written path, and whose `courses_touched` lists
/// every course the search was attributed to — even ones that received zero new files.
pub async fn fetch_exams(
    session: &Session,
    search_url: &reqwest::Url,
    course_code: &str,
    course_dirs: &[(crate::model::CourseId, &Path)],
    progress: &ProgressChannel,
    page_timeout: Duration,
    download_timeout: Duration,
) -> ScrapeOutcome {
    let mut outcome = ScrapeOutcome::default();

    let response = session
        .client()
        .get(search_url.clone())
        .query(&[("mode", "course_code"), ("q", course_code)])
        .timeout(page_timeout)
        .send()
        .await;

    let body = match response {
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

    let results = parse_results(&body, search_url);

    for result in &results {
        let filename = canonical_filename(course_code, result);
        let Ok(paper_url) = reqwest::Url::parse(&result.url) else { continue };

        for (course_id, dir) in course_dirs {
            if upstream::filename_exists_case_insensitive(dir, &filename).await {
                outcome.duplicates += 1;
                continue;
            }
            let target = dir.join(&filename);
            progress.file_event(Stage::FileDownloading, &filename);
            match session.client().get(paper_url.clone()).timeout(download_timeout).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => match upstream::stream_to_file(resp, &target).await {
                        Ok(_) => {
                            outcome.new_files.push((*course_id, target));
                            progress.file_event(Stage::FileOk, &filename);
                        }
                        Err(err) => {
                            progress.file_event(Stage::FileFailed, &filename);
                            outcome.errors.push(err);
                        }
                    },
                    Err(err) => {
                        progress.file_event(Stage::FileFailed, &filename);
                        outcome.errors.push(Error::from(err));
                    }
                },
                Err(err) => {
                    progress.file_event(Stage::FileFailed, &filename);
                    outcome.errors.push(Error::from(err));
                }
            }
        }
    }

    outcome.courses_touched = course_dirs.iter().map(|(id, _)| *id).collect();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(title: &str, date: Option<(i32, u32, u32)>, subclasses: &[&str]) -> ExamResult {
        ExamResult {
            title: title.to_string(),
            url: "https://exams.example.edu/paper.pdf".to_string(),
            date,
            subclasses: subclasses.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn canonical_filename_is_pure_function_of_inputs() {
        let r = result("Midterm Exam!", Some((2023, 5, 14)), &["A", "B"]);
        let name1 = canonical_filename("CS101", &r);
        let name2 = canonical_filename("CS101", &r);
        assert_eq!(name1, name2);
        assert_eq!(name1, "CS101_Midterm_Exam_2023-05-14_subclass_A_B.pdf");
    }

    #[test]
    fn canonical_filename_without_date_or_subclass() {
        let r = result("Final Exam", None, &[]);
        assert_eq!(canonical_filename("CS101", &r), "CS101_Final_Exam.pdf");
    }

    #[test]
    fn title_slug_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(title_slug("Mid-Term:  Exam (2023)"), "MidTerm_Exam_2023");
    }

    #[test]
    fn date_pattern_extracts_d_m_yyyy() {
        let caps = DATE_PATTERN.captures("Held on 3-11-2022 in hall B").unwrap();
        assert_eq!(&caps[1], "3");
        assert_eq!(&caps[2], "11");
        assert_eq!(&caps[3], "2022");
    }

    #[test]
    fn subclass_pattern_extracts_letters_after_keyword() {
        let caps = SUBCLASS_PATTERN.captures("Exam paper, subclasses: A, C").unwrap();
        assert_eq!(&caps[1], "A, C");
    }
}
