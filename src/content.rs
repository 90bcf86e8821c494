//! Campaign message content
//!
//! Content lives in `email.html` or `email.txt` inside the content directory.
//! The first line is `SUBJECT: <subject>`, everything after it is the body.

use std::path::{Path, PathBuf};
use thiserror::Error;

const SUBJECT_MARKER: &str = "SUBJECT:";
const HTML_FILE: &str = "email.html";
const TEXT_FILE: &str = "email.txt";

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("No email.html or email.txt found in {0}. Please create one with 'SUBJECT: ...' as the first line.")]
    NotFound(PathBuf),

    #[error("First line of {0} must be 'SUBJECT: ...'")]
    MissingSubject(PathBuf),

    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, String),
}

pub type ContentResult<T> = Result<T, ContentError>;

/// Subject and body of the campaign message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContent {
    pub subject: String,
    pub plain_text: Option<String>,
    pub html: Option<String>,
}

impl MessageContent {
    /// Load content from `dir`, preferring the HTML file
    pub fn load(dir: &Path) -> ContentResult<Self> {
        let html_path = dir.join(HTML_FILE);
        if html_path.exists() {
            let (subject, body) = read_content_file(&html_path)?;
            return Ok(Self {
                subject,
                plain_text: None,
                html: Some(body),
            });
        }

        let text_path = dir.join(TEXT_FILE);
        if text_path.exists() {
            let (subject, body) = read_content_file(&text_path)?;
            return Ok(Self {
                subject,
                plain_text: Some(body),
                html: None,
            });
        }

        Err(ContentError::NotFound(dir.to_path_buf()))
    }
}

fn read_content_file(path: &Path) -> ContentResult<(String, String)> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ContentError::Io(path.to_path_buf(), e.to_string()))?;
    let parsed = parse_content(&raw).ok_or_else(|| ContentError::MissingSubject(path.to_path_buf()))?;
    tracing::debug!("Loaded message content from {}", path.display());
    Ok(parsed)
}

/// Split raw content into subject and body
pub fn parse_content(raw: &str) -> Option<(String, String)> {
    let (first_line, body) = raw.split_once('\n').unwrap_or((raw, ""));
    let subject = first_line.strip_prefix(SUBJECT_MARKER)?.trim().to_string();
    Some((subject, body.trim_start().to_string()))
}
