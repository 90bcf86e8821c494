//! Recipient list loading from delimited files
//!
//! A recipient file is tabular text with a header row. The loader tries a
//! fixed list of text encodings, resolves the column holding addresses and
//! returns the normalized, deduplicated addresses in source order.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Header names accepted as the address column without further guessing
const EXACT_COLUMN_NAMES: &[&str] = &["email", "emails", "email_address", "e-mail"];

static ADDRESS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .expect("Invalid address regex")
});

/// Recipient source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Recipient file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read recipient file: {0}")]
    Io(String),

    #[error("No email column found. Available columns: {0:?}")]
    NoEmailColumn(Vec<String>),

    #[error("Malformed delimited data: {0}")]
    Malformed(String),

    #[error("Recipient file {0} could not be read under any supported encoding")]
    Unreadable(PathBuf),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Text encodings tried, in order, when reading a recipient file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEncoding {
    Utf8,
    Utf8Bom,
    Latin1,
    Windows1252,
}

impl SourceEncoding {
    pub const PREFERENCE: [SourceEncoding; 4] = [
        SourceEncoding::Utf8,
        SourceEncoding::Utf8Bom,
        SourceEncoding::Latin1,
        SourceEncoding::Windows1252,
    ];

    /// Decode raw bytes, `None` if they are not valid in this encoding
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        const BOM: &[u8] = b"\xEF\xBB\xBF";

        match self {
            // A BOM-prefixed file belongs to the next candidate
            SourceEncoding::Utf8 if bytes.starts_with(BOM) => None,
            SourceEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            SourceEncoding::Utf8Bom => {
                let stripped = bytes.strip_prefix(BOM)?;
                std::str::from_utf8(stripped).ok().map(str::to_string)
            }
            SourceEncoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
            SourceEncoding::Windows1252 => encoding_rs::WINDOWS_1252
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| text.into_owned()),
        }
    }
}

impl std::fmt::Display for SourceEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceEncoding::Utf8 => write!(f, "utf-8"),
            SourceEncoding::Utf8Bom => write!(f, "utf-8-sig"),
            SourceEncoding::Latin1 => write!(f, "iso-8859-1"),
            SourceEncoding::Windows1252 => write!(f, "cp1252"),
        }
    }
}

/// A recipient list file on disk
#[derive(Debug, Clone)]
pub struct RecipientSource {
    path: PathBuf,
}

impl RecipientSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable identity of this list, used to name its progress ledger
    pub fn identity(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("recipients")
            .to_string()
    }

    /// Read and parse the recipient file
    pub fn load(&self) -> SourceResult<Vec<String>> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound(self.path.clone())
            } else {
                SourceError::Io(e.to_string())
            }
        })?;

        let mut last_error = None;
        for encoding in SourceEncoding::PREFERENCE {
            let Some(text) = encoding.decode(&bytes) else {
                debug!("{} is not valid {}", self.path.display(), encoding);
                continue;
            };

            match parse_recipients(&text) {
                Ok(addresses) => {
                    info!(
                        "Loaded {} unique recipients from {} ({})",
                        addresses.len(),
                        self.path.display(),
                        encoding
                    );
                    return Ok(addresses);
                }
                Err(e) => {
                    warn!("Error with encoding {}: {}", encoding, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SourceError::Unreadable(self.path.clone())))
    }

    /// Like [`RecipientSource::load`], but an unreadable source is an empty list
    pub fn load_or_empty(&self) -> Vec<String> {
        match self.load() {
            Ok(addresses) => {
                if addresses.is_empty() {
                    error!("Could not read any emails from {}", self.path.display());
                }
                addresses
            }
            Err(e) => {
                error!("Error reading recipient file: {}", e);
                Vec::new()
            }
        }
    }
}

/// Parse decoded delimited text into a recipient list
pub fn parse_recipients(text: &str) -> SourceResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| SourceError::Malformed(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let column = resolve_email_column(&headers)
        .ok_or_else(|| SourceError::NoEmailColumn(headers.clone()))?;
    debug!("Using column '{}' for addresses", headers[column]);

    let mut candidates = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SourceError::Malformed(e.to_string()))?;
        let cell = record.get(column).unwrap_or("").trim();
        if passes_prefilter(cell) {
            candidates.push(cell.to_lowercase());
        }
    }

    Ok(dedupe_preserving_order(candidates))
}

/// Pick the address column: exact name first, then any name containing "email"
pub fn resolve_email_column(headers: &[String]) -> Option<usize> {
    let normalized: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();

    normalized
        .iter()
        .position(|h| EXACT_COLUMN_NAMES.contains(&h.as_str()))
        .or_else(|| normalized.iter().position(|h| h.contains("email")))
}

/// Cheap syntactic filter applied while reading rows
fn passes_prefilter(cell: &str) -> bool {
    !cell.is_empty() && cell.matches('@').count() == 1 && cell.contains('.')
}

/// Remove duplicates, keeping the first occurrence
pub fn dedupe_preserving_order(addresses: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|address| seen.insert(address.to_lowercase()))
        .collect()
}

/// Full syntactic validation applied before handing an address to a gateway
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_PATTERN.is_match(address)
}
