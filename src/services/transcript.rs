use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use serde_json::json;

use crate::core::config::ArchiveSettings;
use crate::models::essay::{UNKNOWN_DATE, UNKNOWN_STUDENT};

/// Folder names that never identify a student.
const GENERIC_FOLDERS: &[&str] =
    &["images", "image", "uploads", "upload", "scans", "scan", "essays", "essay", "ocr", "tmp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMeta {
    pub student: String,
    pub date: String,
    pub filename: String,
}

/// Derive a deterministic, filesystem-safe name for a transcript from its
/// `Name:` / `Date:` header lines, falling back to folder heuristics from
/// the original image path, then to the literal unknown placeholders.
/// Best-effort convenience only; nothing downstream depends on accuracy.
pub fn derive_meta(transcript: &str, source_path: Option<&str>) -> TranscriptMeta {
    let mut student = header_value(transcript, &["name", "student", "姓名", "学生"]);
    let mut date = header_value(transcript, &["date", "日期", "时间"]);

    if let Some(path) = source_path {
        let folders = path_folders(path);
        if date.is_none() {
            date = folders.iter().find(|part| looks_like_date(part)).cloned();
        }
        if student.is_none() {
            student = folders
                .iter()
                .rev()
                .find(|part| {
                    !looks_like_date(part)
                        && !GENERIC_FOLDERS.contains(&part.to_ascii_lowercase().as_str())
                })
                .cloned();
        }
    }

    let student = student
        .map(|value| sanitize_component(&value))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_STUDENT.to_string());
    let date = date
        .map(|value| sanitize_component(&value))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_DATE.to_string());

    let filename = format!("{student}_{date}.md");
    TranscriptMeta { student, date, filename }
}

/// Scan the leading lines for a `Key: value` header, tolerating full-width
/// colons and a few key spellings.
fn header_value(transcript: &str, keys: &[&str]) -> Option<String> {
    for line in transcript.lines().take(10) {
        let line = line.trim().trim_start_matches(['#', '*', '-', ' ']);
        let Some((head, tail)) = line.split_once([':', '：']) else {
            continue;
        };
        let head = head.trim().to_lowercase();
        if keys.iter().any(|key| head == *key) {
            let value = tail.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn path_folders(path: &str) -> Vec<String> {
    let parent = Path::new(path).parent().unwrap_or_else(|| Path::new(""));
    parent
        .components()
        .filter_map(|component| match component {
            std::path::Component::Normal(part) => {
                part.to_str().map(str::to_string).filter(|value| !value.is_empty())
            }
            _ => None,
        })
        .collect()
}

/// Recognizes `2024-05-01`-style values with `-`, `_`, `.` or `/` as
/// separators; the year must come first.
fn looks_like_date(value: &str) -> bool {
    let parts: Vec<&str> =
        value.split(['-', '_', '.', '/']).filter(|part| !part.is_empty()).collect();
    if parts.len() != 3 {
        return false;
    }
    parts[0].len() == 4
        && parts.iter().all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
        && parts[1].len() <= 2
        && parts[2].len() <= 2
}

/// Keep letters, digits and CJK; collapse everything else to underscores.
fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_sep = true;
    for ch in value.trim().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if ch == '-' {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Best-effort transcript archival: a markdown copy on disk (the stand-in
/// for the browser download, with an in-memory cache as last resort) and an
/// async hand-off to the optional local save server. Failures here are
/// logged and never surfaced to the OCR caller.
#[derive(Debug)]
pub struct TranscriptArchive {
    directory: PathBuf,
    save_endpoint: Option<String>,
    client: Client,
    fallback_cache: Mutex<HashMap<String, String>>,
}

impl TranscriptArchive {
    pub fn new(settings: &ArchiveSettings) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            directory: settings.directory.clone(),
            save_endpoint: settings.save_endpoint.clone(),
            client,
            fallback_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn archive(&self, transcript: &str, source_path: Option<&str>) {
        let meta = derive_meta(transcript, source_path);

        if let Err(err) = self.write_markdown(&meta.filename, transcript).await {
            tracing::warn!(error = %err, filename = %meta.filename, "Failed to write transcript copy; caching in memory");
            if let Ok(mut cache) = self.fallback_cache.lock() {
                cache.insert(meta.filename.clone(), transcript.to_string());
            }
        }

        if let Some(endpoint) = &self.save_endpoint {
            let client = self.client.clone();
            let endpoint = endpoint.clone();
            let payload = json!({
                "filename": meta.filename,
                "content": transcript,
                "imageFilename": source_path.map(file_name),
                "imageRelativePath": source_path,
            });
            tokio::spawn(async move {
                match client.post(&endpoint).json(&payload).send().await {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(endpoint = %endpoint, "Transcript handed to save server");
                    }
                    Ok(response) => {
                        tracing::warn!(endpoint = %endpoint, status = %response.status(), "Save server rejected transcript");
                    }
                    Err(err) => {
                        tracing::warn!(endpoint = %endpoint, error = %err, "Save server unreachable");
                    }
                }
            });
        }
    }

    async fn write_markdown(&self, filename: &str, content: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(self.directory.join(filename), content).await
    }

    /// Last-resort copy of a transcript whose disk write failed.
    pub fn cached(&self, filename: &str) -> Option<String> {
        self.fallback_cache.lock().ok().and_then(|cache| cache.get(filename).cloned())
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_from_header_lines() {
        let transcript = "Name: Li Hua\nDate: 2024-05-01\n\nMy summer holiday was great.";
        let meta = derive_meta(transcript, None);
        assert_eq!(meta.student, "Li_Hua");
        assert_eq!(meta.date, "2024-05-01");
        assert_eq!(meta.filename, "Li_Hua_2024-05-01.md");
    }

    #[test]
    fn meta_from_chinese_headers() {
        let transcript = "姓名：王小明\n日期：2024.3.8\n\n正文";
        let meta = derive_meta(transcript, None);
        assert_eq!(meta.student, "王小明");
        assert_eq!(meta.date, "2024_3_8");
    }

    #[test]
    fn meta_from_folder_heuristics() {
        let meta = derive_meta("no headers here", Some("scans/ClassB/2024-05-01/page1.jpg"));
        assert_eq!(meta.student, "ClassB");
        assert_eq!(meta.date, "2024-05-01");
    }

    #[test]
    fn meta_falls_back_to_placeholders() {
        let meta = derive_meta("just text", None);
        assert_eq!(meta.filename, "unknown_student_unknown_date.md");
    }

    #[test]
    fn generic_folders_are_not_students() {
        let meta = derive_meta("text", Some("uploads/images/page.png"));
        assert_eq!(meta.student, UNKNOWN_STUDENT);
    }

    #[test]
    fn date_detection() {
        assert!(looks_like_date("2024-05-01"));
        assert!(looks_like_date("2024_5_1"));
        assert!(looks_like_date("2024.05.01"));
        assert!(!looks_like_date("may-1-2024"));
        assert!(!looks_like_date("2024"));
        assert!(!looks_like_date("ClassB"));
    }

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(sanitize_component("Li Hua (3班)"), "Li_Hua_3班");
        assert_eq!(sanitize_component("  a/b\\c  "), "a_b_c");
        assert_eq!(sanitize_component("!!!"), "");
    }
}
