//! Aadhaar card rules

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{strip_special_characters, DocumentType, ExtractedRecord, Field};

/// 12 digits in groups of four, each group optionally followed by a space or hyphen
static AADHAAR_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}\b")
        .expect("Aadhaar number regex pattern is valid and should compile")
});

const ISSUER_WORD: &str = "Government";

/// Extract the Aadhaar number and holder name from newline-delimited text
///
/// Both fields are taken from the last line that qualifies.
pub fn extract_aadhaar_information(data: &str) -> ExtractedRecord {
    let cleaned = strip_special_characters(data);
    debug!("Cleaned Data String: {:?}", cleaned);
    debug!("Words List: {:?}", cleaned.split_whitespace().collect::<Vec<_>>());

    let mut record = ExtractedRecord::empty(DocumentType::Aadhaar);

    for line in data.lines() {
        if let Some(found) = AADHAAR_NUMBER.find(line) {
            let number: String = found
                .as_str()
                .chars()
                .filter(|c| *c != ' ' && *c != '-')
                .collect();
            record.id = Field::Found(number);
        }

        if is_name_line(line) {
            record.name = Field::Found(line.trim().to_string());
        }
    }

    if !record.id.is_found() {
        warn!("Aadhaar number could not be extracted.");
    }
    if !record.name.is_found() {
        warn!("Name could not be extracted.");
    }
    info!("Extracted information: {}", record.to_display_json());

    record
}

/// More than one word, and the first is purely alphabetic and not the issuer
fn is_name_line(line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [first, _, ..] => *first != ISSUER_WORD && first.chars().all(char::is_alphabetic),
        _ => false,
    }
}
