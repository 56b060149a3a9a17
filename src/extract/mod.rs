//! Field extraction from recognized document text
//!
//! Rule-based parsers that turn OCR output into an identity record.
//! Each document type has its own rules and its own view of the text:
//! PAN cards are parsed from pipe-delimited fragments, Aadhaar cards and
//! driving licenses line by line.

pub mod aadhaar;
pub mod driving_license;
pub mod pan;

pub use aadhaar::extract_aadhaar_information;
pub use driving_license::extract_driving_license_information;
pub use pan::extract_pan_information;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::vision::face::Embedding;
use crate::vision::ocr::OcrOutput;

static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("Non-word character pattern is valid and should compile"));

/// Supported identity documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Pan,
    Aadhaar,
    DrivingLicense,
}

impl DocumentType {
    pub const ALL: [DocumentType; 3] = [
        DocumentType::Pan,
        DocumentType::Aadhaar,
        DocumentType::DrivingLicense,
    ];

    /// Label stored in the `id_type` column
    pub fn label(&self) -> &'static str {
        match self {
            DocumentType::Pan => "PAN",
            DocumentType::Aadhaar => "Aadhaar",
            DocumentType::DrivingLicense => "Driving License",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "pan" => Ok(DocumentType::Pan),
            "aadhaar" | "aadhar" => Ok(DocumentType::Aadhaar),
            "drivinglicense" | "drivinglicence" | "dl" => Ok(DocumentType::DrivingLicense),
            _ => Err(format!(
                "unknown document type {:?} (expected pan, aadhaar or driving-license)",
                s
            )),
        }
    }
}

/// Outcome of extracting one field
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Field {
    Found(String),
    /// The anchor for this field does not occur in the text
    #[default]
    NotFound,
    /// The anchor occurs but no value could be read after it
    Malformed(String),
}

impl Field {
    /// The value, or an empty string when nothing was extracted
    pub fn as_str(&self) -> &str {
        match self {
            Field::Found(value) => value,
            _ => "",
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Field::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Field::Found(_))
    }

    /// Replace `self` unless that would discard a value already found
    /// with a failure.
    fn update(&mut self, next: Field) {
        if next.is_found() || !self.is_found() {
            *self = next;
        }
    }
}

/// Identity record built from a document's text
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRecord {
    pub id: Field,
    pub name: Field,
    pub id_type: DocumentType,
    /// Selfie embedding, attached only when the user is about to be stored
    pub embedding: Option<Embedding>,
}

impl ExtractedRecord {
    pub fn empty(id_type: DocumentType) -> Self {
        Self {
            id: Field::NotFound,
            name: Field::NotFound,
            id_type,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Whether both the ID and the name were extracted
    pub fn is_complete(&self) -> bool {
        self.id.is_found() && self.name.is_found()
    }

    /// JSON object in the `{"ID", "Name", "ID Type"}` shape shown to users
    pub fn to_display_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ID": self.id.as_str(),
            "Name": self.name.as_str(),
            "ID Type": self.id_type.label(),
        })
    }
}

/// Parse OCR output with the rules for `document_type`
pub fn extract_information(document_type: DocumentType, ocr: &OcrOutput) -> ExtractedRecord {
    match document_type {
        DocumentType::Pan => extract_pan_information(&ocr.pipe_delimited()),
        DocumentType::Aadhaar => extract_aadhaar_information(&ocr.newline_delimited()),
        DocumentType::DrivingLicense => {
            extract_driving_license_information(&ocr.newline_delimited())
        }
    }
}

/// Drop everything except word characters and whitespace
pub(crate) fn strip_special_characters(text: &str) -> String {
    NON_WORD.replace_all(text, "").into_owned()
}
