//! PAN card rules

use tracing::{debug, info, warn};

use super::{DocumentType, ExtractedRecord, Field};

const CARD_TITLE: &str = "Permanent Account Number Card";
const NUMBER_LABEL: &str = "Permanent Account Number";
const ISSUER_LABEL: &str = "GOVT OF INDIA";

/// Extract ID and name from pipe-delimited PAN card text
///
/// Newer cards print "Permanent Account Number Card" with the number on
/// the next fragment and a "Name" label before the holder's name. Older
/// cards put the name right after "GOVT OF INDIA" and the number after a
/// "Permanent Account Number" fragment.
pub fn extract_pan_information(data: &str) -> ExtractedRecord {
    let updated = data.replace('.', "");
    let words: Vec<&str> = updated
        .split('|')
        .map(str::trim)
        .filter(|word| word.chars().count() > 2)
        .collect();
    debug!("PAN fragments: {:?}", words);

    let mut record = ExtractedRecord::empty(DocumentType::Pan);

    if updated.contains(CARD_TITLE) {
        record.id = value_after(&words, |word| word.contains(CARD_TITLE), CARD_TITLE);
        record.name = value_after(&words, |word| word.to_lowercase().contains("name"), "name");
    } else {
        record.name = value_after(&words, |word| word == ISSUER_LABEL, ISSUER_LABEL);
        record.id = value_after(&words, |word| word == NUMBER_LABEL, NUMBER_LABEL);
    }

    for (label, field) in [("PAN number", &record.id), ("Name", &record.name)] {
        if let Field::Malformed(reason) = field {
            warn!("{} could not be extracted: {}", label, reason);
        }
    }
    info!("Extracted information: {}", record.to_display_json());

    record
}

/// The fragment right after the first one matching `is_anchor`
fn value_after(words: &[&str], is_anchor: impl Fn(&str) -> bool, anchor: &str) -> Field {
    match words.iter().position(|word| is_anchor(*word)) {
        None => Field::NotFound,
        Some(index) => match words.get(index + 1) {
            Some(value) => Field::Found((*value).to_string()),
            None => Field::Malformed(format!("no fragment follows {:?}", anchor)),
        },
    }
}
