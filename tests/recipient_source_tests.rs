//! Integration tests for recipient list loading
//! These exercise real files on disk in the supported encodings

use mailcampaign::config::CampaignConfig;
use mailcampaign::recipients::{RecipientSource, SourceError};
use tempfile::TempDir;

fn write_source(dir: &TempDir, name: &str, bytes: &[u8]) -> RecipientSource {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    RecipientSource::new(path)
}

#[test]
fn test_utf8_with_bom() {
    let dir = TempDir::new().unwrap();
    let source = write_source(&dir, "bom.csv", b"\xEF\xBB\xBFEmail,Name\nann@x.com,Ann\n");

    assert_eq!(source.load().unwrap(), vec!["ann@x.com"]);
}

#[test]
fn test_latin1_names_do_not_break_loading() {
    let dir = TempDir::new().unwrap();
    // "José" in ISO-8859-1 is not valid UTF-8
    let source = write_source(
        &dir,
        "latin.csv",
        b"Name,Email Address\nJos\xE9,jose@x.es\nZo\xEB,zoe@x.es\n",
    );

    assert_eq!(source.load().unwrap(), vec!["jose@x.es", "zoe@x.es"]);
}

#[test]
fn test_ragged_and_junk_rows() {
    let dir = TempDir::new().unwrap();
    let source = write_source(
        &dir,
        "ragged.csv",
        b"name,email,notes\nA,a@x.com\nB\nC,not-an-address,x\nD,two@@x.com,\nE, e@x.com ,extra,more\n",
    );

    assert_eq!(source.load().unwrap(), vec!["a@x.com", "e@x.com"]);
}

#[test]
fn test_exact_column_name_wins_over_partial_match() {
    let dir = TempDir::new().unwrap();
    let source = write_source(
        &dir,
        "columns.csv",
        b"backup_email,E-Mail\nold@x.com,new@x.com\n",
    );

    assert_eq!(source.load().unwrap(), vec!["new@x.com"]);
}

#[test]
fn test_missing_column_and_missing_file() {
    let dir = TempDir::new().unwrap();
    let source = write_source(&dir, "nocol.csv", b"name,phone\nA,123\n");
    assert!(matches!(source.load(), Err(SourceError::NoEmailColumn(_))));
    assert!(source.load_or_empty().is_empty());

    let missing = RecipientSource::new(dir.path().join("missing.csv"));
    assert!(matches!(missing.load(), Err(SourceError::NotFound(_))));
    assert!(missing.load_or_empty().is_empty());
}

#[test]
fn test_identity_follows_file_stem() {
    let source = RecipientSource::new("/data/lists/spring_customers.csv");
    assert_eq!(source.identity(), "spring_customers");
}

#[test]
fn test_configured_source_loads() {
    let dir = TempDir::new().unwrap();
    let csv = dir.path().join("list.csv");
    std::fs::write(&csv, "email\nsomeone@x.com\n").unwrap();
    let settings = dir.path().join("settings.toml");
    std::fs::write(&settings, format!("csv_file = {:?}\n", csv.display().to_string())).unwrap();

    let config = tokio_test::block_on(CampaignConfig::load_from_file(&settings)).unwrap();
    let source = RecipientSource::new(&config.csv_file);
    assert_eq!(source.load().unwrap(), vec!["someone@x.com"]);
}
