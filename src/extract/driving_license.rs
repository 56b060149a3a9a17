//! Driving license rules

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{strip_special_characters, DocumentType, ExtractedRecord, Field};

/// State code, two-digit RTO code, then 11 digits, e.g. "MH47 20220017016"
static LICENSE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z]{2}[0-9]{2}\s*[0-9]{11}\b")
        .expect("Driving license regex pattern is valid and should compile")
});

const NAME_LABEL: &str = "Name";

/// Extract the license number and holder name from newline-delimited text
///
/// The license number is stored as the record's ID.
pub fn extract_driving_license_information(data: &str) -> ExtractedRecord {
    let cleaned = strip_special_characters(data);
    debug!("Cleaned Data String: {:?}", cleaned);
    debug!("Words List: {:?}", cleaned.split_whitespace().collect::<Vec<_>>());

    let mut record = ExtractedRecord::empty(DocumentType::DrivingLicense);

    for line in data.lines() {
        if let Some(found) = LICENSE_NUMBER.find(line) {
            let number: String = found
                .as_str()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            record.id = Field::Found(number);
        }

        if let Some((_, rest)) = line.split_once(NAME_LABEL) {
            record.name.update(name_after_label(rest));
        }
    }

    if !record.id.is_found() {
        warn!("Driving License number could not be extracted.");
    }
    if !record.name.is_found() {
        warn!("Name could not be extracted.");
    }
    info!("Extracted information: {}", record.to_display_json());

    record
}

fn name_after_label(rest: &str) -> Field {
    let name = rest.trim();
    if name.is_empty() {
        Field::Malformed(format!("nothing follows {:?}", NAME_LABEL))
    } else {
        Field::Found(name.to_string())
    }
}
