//! eKYC orchestration
//!
//! Runs one submission (document photo plus selfie) through localisation,
//! face verification, text extraction, field parsing and persistence, and
//! reports how it ended as a [`PipelineOutcome`].

use std::path::PathBuf;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, DispatchMode};
use crate::error::{EkycError, Result};
use crate::extract::{extract_information, DocumentType, ExtractedRecord};
use crate::storage::{Database, InsertOutcome, PersistedUser};
use crate::vision::{
    extract_image_from_id, extract_text, read_image, save_image, FaceVerdict, FaceVerifier,
    ImageSource, TextRecognizer,
};

/// Selfie saved under the faces directory
pub const SELFIE_FILE_NAME: &str = "face_image.jpg";
/// Face cropped from the document, saved under the faces directory
pub const DOCUMENT_FACE_FILE_NAME: &str = "extracted_face.jpg";

/// One registration attempt
#[derive(Debug, Clone)]
pub struct Submission {
    pub document_type: DocumentType,
    pub document: Option<ImageSource>,
    pub selfie: Option<ImageSource>,
}

impl Submission {
    pub fn new(document_type: DocumentType, document: ImageSource, selfie: ImageSource) -> Self {
        Self {
            document_type,
            document: Some(document),
            selfie: Some(selfie),
        }
    }
}

/// Which upload is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingInput {
    Document,
    Selfie,
}

/// How a submission ended
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    MissingInput(MissingInput),
    DecodeFailed { source_name: String, reason: String },
    NoDocumentFound,
    /// `similarity` is absent when no face could be found to compare
    FaceMismatch { similarity: Option<f32> },
    NoTextFound,
    /// The document number could not be read; nothing was stored
    IncompleteRecord(ExtractedRecord),
    Duplicate { id: String, existing_name: Option<String> },
    Registered(ExtractedRecord),
}

impl PipelineOutcome {
    /// Message shown to the user
    pub fn message(&self) -> String {
        match self {
            PipelineOutcome::MissingInput(MissingInput::Document) => {
                "Please upload an ID card image.".to_string()
            }
            PipelineOutcome::MissingInput(MissingInput::Selfie) => {
                "Please upload a face image.".to_string()
            }
            PipelineOutcome::DecodeFailed { source_name, .. } => {
                format!("Could not read the image {}. Please upload it again.", source_name)
            }
            PipelineOutcome::NoDocumentFound => {
                "No ID card could be located in the image. Please try again.".to_string()
            }
            PipelineOutcome::FaceMismatch { .. } => {
                "Face verification failed. Please try again.".to_string()
            }
            PipelineOutcome::NoTextFound => {
                "No text could be read from the ID card. Please try again.".to_string()
            }
            PipelineOutcome::IncompleteRecord(_) => {
                "The ID number could not be read from the card. Please try again.".to_string()
            }
            PipelineOutcome::Duplicate { id, existing_name } => match existing_name {
                Some(name) => format!("{} Verified. User already present with ID {}", name, id),
                None => format!("User already present with ID {}", id),
            },
            PipelineOutcome::Registered(record) => record.to_display_json().to_string(),
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, PipelineOutcome::Registered(_))
    }
}

/// Sequences the eKYC stages against one database handle
pub struct Pipeline<'db> {
    config: AppConfig,
    db: &'db Database,
    recognizer: Box<dyn TextRecognizer>,
    faces: FaceVerifier,
}

impl<'db> Pipeline<'db> {
    pub fn new(
        config: AppConfig,
        db: &'db Database,
        recognizer: Box<dyn TextRecognizer>,
        faces: FaceVerifier,
    ) -> Self {
        Self {
            config,
            db,
            recognizer,
            faces,
        }
    }

    /// Process one submission
    ///
    /// Storage, save and model failures are errors; everything a user can
    /// fix by resubmitting is an outcome.
    pub fn run(&mut self, submission: &Submission) -> Result<PipelineOutcome> {
        let submission_id = Uuid::new_v4();
        let span = info_span!(
            "submission",
            id = %submission_id,
            id_type = %submission.document_type
        );
        let _guard = span.enter();
        info!("ID card type selected: {}", submission.document_type);

        let outcome = self.process(submission)?;
        info!("Submission finished: {}", outcome.message());
        Ok(outcome)
    }

    fn process(&mut self, submission: &Submission) -> Result<PipelineOutcome> {
        let Some(document_source) = &submission.document else {
            warn!("No ID card image uploaded.");
            return Ok(PipelineOutcome::MissingInput(MissingInput::Document));
        };
        let Some(selfie_source) = &submission.selfie else {
            warn!("No face image uploaded.");
            return Ok(PipelineOutcome::MissingInput(MissingInput::Selfie));
        };

        let selfie = match decode(selfie_source)? {
            Ok(image) => image,
            Err(outcome) => return Ok(outcome),
        };
        info!("Face image loaded.");
        let document = match decode(document_source)? {
            Ok(image) => image,
            Err(outcome) => return Ok(outcome),
        };
        info!("ID card image loaded.");

        let artifacts = &self.config.artifacts;
        let Some(located) = extract_image_from_id(
            &document,
            &artifacts.contour_image_file_name,
            &artifacts.intermediate_dir,
        )?
        else {
            return Ok(PipelineOutcome::NoDocumentFound);
        };
        info!("ID card ROI extracted to {:?}", located.saved_to);

        let Some(document_face) = self.faces.extract_face(&located.image)? else {
            warn!("No face found on the ID card.");
            return Ok(PipelineOutcome::FaceMismatch { similarity: None });
        };
        let faces_dir = &artifacts.faces_dir;
        let document_face_path = save_image(&document_face, DOCUMENT_FACE_FILE_NAME, faces_dir)?;
        let selfie_path = save_image(&selfie, SELFIE_FILE_NAME, faces_dir)?;
        info!("Faces extracted and saved.");

        let verdict = self.faces.compare_files(&selfie_path, &document_face_path)?;
        info!(
            "Face verification status: {}.",
            if verdict.is_match() { "successful" } else { "failed" }
        );
        match verdict {
            FaceVerdict::Match { .. } => {}
            FaceVerdict::Mismatch { similarity } => {
                return Ok(PipelineOutcome::FaceMismatch {
                    similarity: Some(similarity),
                })
            }
            FaceVerdict::NoFaceInSelfie => {
                return Ok(PipelineOutcome::FaceMismatch { similarity: None })
            }
        }

        let ocr = extract_text(self.recognizer.as_mut(), &located.image, &self.config.ocr);
        if ocr.is_empty() {
            warn!("No text passed the OCR confidence threshold.");
            return Ok(PipelineOutcome::NoTextFound);
        }

        let record = self.dispatch(submission.document_type, &ocr);
        info!("Text extracted and information parsed from ID card.");

        let Some(id) = record.id.value().map(str::to_string) else {
            warn!("Halting: the ID could not be extracted.");
            return Ok(PipelineOutcome::IncompleteRecord(record));
        };

        if let Some(existing) = self.db.fetch_records(&id)?.into_iter().next() {
            info!("{} Verified", existing.name);
            info!("User already present with ID {}", id);
            return Ok(PipelineOutcome::Duplicate {
                id,
                existing_name: Some(existing.name),
            });
        }

        self.register(record, id, selfie_path)
    }

    fn dispatch(&self, selected: DocumentType, ocr: &crate::vision::OcrOutput) -> ExtractedRecord {
        match self.config.pipeline.dispatch {
            DispatchMode::ByDocumentType => extract_information(selected, ocr),
            DispatchMode::PanOnly => {
                if selected != DocumentType::Pan {
                    warn!("{} selected, but parsing with the PAN rules.", selected);
                }
                extract_information(DocumentType::Pan, ocr)
            }
        }
    }

    fn register(
        &mut self,
        record: ExtractedRecord,
        id: String,
        selfie_path: PathBuf,
    ) -> Result<PipelineOutcome> {
        let embedding = self.faces.embedding_for_file(&selfie_path)?;
        let record = record.with_embedding(embedding);

        let mut user =
            PersistedUser::new(id.clone(), record.name.as_str(), record.id_type.label());
        user.embedding = record.embedding.clone();

        match self.db.insert_if_absent(&user)? {
            InsertOutcome::Inserted => {
                info!("New user record inserted: {}", id);
                Ok(PipelineOutcome::Registered(record))
            }
            InsertOutcome::AlreadyExists => {
                info!("User with ID {} was registered concurrently", id);
                let existing_name = self
                    .db
                    .fetch_records(&id)?
                    .into_iter()
                    .next()
                    .map(|existing| existing.name);
                Ok(PipelineOutcome::Duplicate { id, existing_name })
            }
        }
    }
}

/// Decode an upload; unreadable input becomes an outcome rather than an error
fn decode(source: &ImageSource) -> Result<std::result::Result<image::DynamicImage, PipelineOutcome>> {
    match read_image(source) {
        Ok(image) => Ok(Ok(image)),
        Err(e @ (EkycError::Decode { .. } | EkycError::ImageIo { .. })) => {
            error!("Could not decode {}: {}", source.describe(), e);
            Ok(Err(PipelineOutcome::DecodeFailed {
                source_name: source.describe(),
                reason: e.to_string(),
            }))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaceSettings;
    use crate::extract::Field;
    use crate::vision::face::tests::ColorFaceAnalyzer;
    use crate::vision::RecognizedText;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;
    use tempfile::TempDir;

    const SKIN: [u8; 3] = [220, 40, 40];

    struct ScriptedRecognizer {
        fragments: Vec<RecognizedText>,
        calls: Rc<Cell<usize>>,
    }

    impl TextRecognizer for ScriptedRecognizer {
        fn recognize(&mut self, _image: &DynamicImage) -> Result<Vec<RecognizedText>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.fragments.clone())
        }
    }

    fn pan_fragments() -> Vec<RecognizedText> {
        ["INCOME TAX DEPARTMENT", "GOVT OF INDIA", "John Doe", "Permanent Account Number", "ABCDE1234F"]
            .into_iter()
            .map(|text| RecognizedText::new(text, 0.9))
            .collect()
    }

    fn aadhaar_fragments() -> Vec<RecognizedText> {
        ["Government of India", "Rahul Kumar", "1234 5678 9012"]
            .into_iter()
            .map(|text| RecognizedText::new(text, 0.9))
            .collect()
    }

    fn driving_license_fragments() -> Vec<RecognizedText> {
        ["INDIAN UNION DRIVING LICENCE", "MH47 20220017016", "Name RAHUL SHARMA"]
            .into_iter()
            .map(|text| RecognizedText::new(text, 0.9))
            .collect()
    }

    fn png(image: &DynamicImage, name: &str) -> ImageSource {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        ImageSource::from_bytes(name, bytes)
    }

    /// Card with a coloured face area on a black background
    fn document_image(card: [u8; 3]) -> ImageSource {
        let mut img = RgbImage::new(120, 90);
        for y in 20..70 {
            for x in 30..100 {
                img.put_pixel(x, y, Rgb(card));
            }
        }
        png(&DynamicImage::ImageRgb8(img), "id_card.png")
    }

    fn selfie_image(color: [u8; 3]) -> ImageSource {
        png(
            &DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb(color))),
            "selfie.png",
        )
    }

    struct Harness {
        dir: TempDir,
        db: Database,
        config: AppConfig,
        calls: Rc<Cell<usize>>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = AppConfig::default();
            config.resolve_paths(dir.path());
            Self {
                dir,
                db: Database::open_in_memory().unwrap(),
                config,
                calls: Rc::new(Cell::new(0)),
            }
        }

        fn pipeline(&self, fragments: Vec<RecognizedText>) -> Pipeline<'_> {
            let recognizer = ScriptedRecognizer {
                fragments,
                calls: Rc::clone(&self.calls),
            };
            let faces = FaceVerifier::new(Box::new(ColorFaceAnalyzer), FaceSettings::default());
            Pipeline::new(self.config.clone(), &self.db, Box::new(recognizer), faces)
        }
    }

    fn pan_submission() -> Submission {
        Submission::new(DocumentType::Pan, document_image(SKIN), selfie_image(SKIN))
    }

    #[test]
    fn test_pan_submission_registers_user() {
        let harness = Harness::new();
        let outcome = harness.pipeline(pan_fragments()).run(&pan_submission()).unwrap();

        let PipelineOutcome::Registered(record) = &outcome else {
            panic!("expected registration, got {:?}", outcome);
        };
        assert_eq!(record.id, Field::Found("ABCDE1234F".to_string()));
        assert_eq!(record.name, Field::Found("John Doe".to_string()));
        assert!(record.embedding.is_some());

        let stored = harness.db.fetch_records("ABCDE1234F").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "John Doe");
        assert_eq!(stored[0].id_type, "PAN");
        assert_eq!(stored[0].embedding.as_ref().map(Vec::len), Some(3));

        let artifacts = &harness.config.artifacts;
        assert!(artifacts.intermediate_dir.join("contour_id.jpg").exists());
        assert!(artifacts.faces_dir.join(SELFIE_FILE_NAME).exists());
        assert!(artifacts.faces_dir.join(DOCUMENT_FACE_FILE_NAME).exists());
        assert!(artifacts.faces_dir.starts_with(harness.dir.path()));
    }

    #[test]
    fn test_second_submission_is_duplicate() {
        let harness = Harness::new();
        let mut pipeline = harness.pipeline(pan_fragments());

        assert!(pipeline.run(&pan_submission()).unwrap().is_registered());
        let second = pipeline.run(&pan_submission()).unwrap();

        assert_eq!(
            second,
            PipelineOutcome::Duplicate {
                id: "ABCDE1234F".to_string(),
                existing_name: Some("John Doe".to_string()),
            }
        );
        assert!(second.message().contains("User already present with ID ABCDE1234F"));
        assert_eq!(harness.db.count_records().unwrap(), 1);
    }

    #[test]
    fn test_face_mismatch_skips_ocr_and_storage() {
        let harness = Harness::new();
        let submission =
            Submission::new(DocumentType::Pan, document_image(SKIN), selfie_image([0, 0, 255]));

        let outcome = harness.pipeline(pan_fragments()).run(&submission).unwrap();

        assert!(matches!(
            outcome,
            PipelineOutcome::FaceMismatch { similarity: Some(_) }
        ));
        assert_eq!(outcome.message(), "Face verification failed. Please try again.");
        assert_eq!(harness.calls.get(), 0);
        assert_eq!(harness.db.count_records().unwrap(), 0);
    }

    #[test]
    fn test_document_without_face_is_mismatch() {
        let harness = Harness::new();
        let blank = png(&DynamicImage::new_rgb8(60, 40), "blank.png");
        let submission = Submission::new(DocumentType::Pan, blank, selfie_image(SKIN));

        let outcome = harness.pipeline(pan_fragments()).run(&submission).unwrap();
        assert_eq!(outcome, PipelineOutcome::FaceMismatch { similarity: None });
    }

    #[test]
    fn test_low_confidence_text_is_no_text_found() {
        let harness = Harness::new();
        let noise = vec![RecognizedText::new("ABCDE1234F", 0.05)];

        let outcome = harness.pipeline(noise).run(&pan_submission()).unwrap();

        assert_eq!(outcome, PipelineOutcome::NoTextFound);
        assert_eq!(harness.calls.get(), 1);
        assert_eq!(harness.db.count_records().unwrap(), 0);
    }

    #[test]
    fn test_missing_inputs() {
        let harness = Harness::new();
        let mut pipeline = harness.pipeline(pan_fragments());

        let no_selfie = Submission {
            document_type: DocumentType::Pan,
            document: Some(document_image(SKIN)),
            selfie: None,
        };
        assert_eq!(
            pipeline.run(&no_selfie).unwrap(),
            PipelineOutcome::MissingInput(MissingInput::Selfie)
        );

        let nothing = Submission {
            document_type: DocumentType::Pan,
            document: None,
            selfie: None,
        };
        let outcome = pipeline.run(&nothing).unwrap();
        assert_eq!(outcome, PipelineOutcome::MissingInput(MissingInput::Document));
        assert_eq!(outcome.message(), "Please upload an ID card image.");
    }

    #[test]
    fn test_undecodable_selfie() {
        let harness = Harness::new();
        let submission = Submission::new(
            DocumentType::Pan,
            document_image(SKIN),
            ImageSource::from_bytes("selfie.jpg", b"not an image".to_vec()),
        );

        let outcome = harness.pipeline(pan_fragments()).run(&submission).unwrap();
        assert!(matches!(outcome, PipelineOutcome::DecodeFailed { .. }));
    }

    #[test]
    fn test_single_pixel_document_is_not_found() {
        let harness = Harness::new();
        let tiny = png(&DynamicImage::new_rgb8(1, 1), "tiny.png");
        let submission = Submission::new(DocumentType::Pan, tiny, selfie_image(SKIN));

        let outcome = harness.pipeline(pan_fragments()).run(&submission).unwrap();
        assert_eq!(outcome, PipelineOutcome::NoDocumentFound);
    }

    #[test]
    fn test_default_dispatch_uses_aadhaar_rules() {
        let harness = Harness::new();
        let submission =
            Submission::new(DocumentType::Aadhaar, document_image(SKIN), selfie_image(SKIN));

        let outcome = harness.pipeline(aadhaar_fragments()).run(&submission).unwrap();

        let PipelineOutcome::Registered(record) = outcome else {
            panic!("expected registration");
        };
        assert_eq!(record.id.as_str(), "123456789012");
        assert_eq!(record.name.as_str(), "Rahul Kumar");
        assert_eq!(record.id_type, DocumentType::Aadhaar);
    }

    #[test]
    fn test_default_dispatch_uses_driving_license_rules() {
        let harness = Harness::new();
        let submission = Submission::new(
            DocumentType::DrivingLicense,
            document_image(SKIN),
            selfie_image(SKIN),
        );

        let outcome = harness
            .pipeline(driving_license_fragments())
            .run(&submission)
            .unwrap();

        let PipelineOutcome::Registered(record) = outcome else {
            panic!("expected registration");
        };
        assert_eq!(record.id, Field::Found("MH4720220017016".to_string()));
        assert_eq!(record.name, Field::Found("RAHUL SHARMA".to_string()));
        assert_eq!(record.id_type, DocumentType::DrivingLicense);

        let stored = harness.db.fetch_records("MH4720220017016").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "RAHUL SHARMA");
        assert_eq!(stored[0].id_type, "Driving License");
    }

    #[test]
    fn test_pan_only_dispatch_parses_aadhaar_as_pan() {
        let mut harness = Harness::new();
        harness.config.pipeline.dispatch = DispatchMode::PanOnly;

        let aadhaar_card =
            Submission::new(DocumentType::Aadhaar, document_image(SKIN), selfie_image(SKIN));
        let outcome = harness.pipeline(aadhaar_fragments()).run(&aadhaar_card).unwrap();
        assert!(matches!(outcome, PipelineOutcome::IncompleteRecord(_)));

        let pan_text_on_aadhaar =
            Submission::new(DocumentType::Aadhaar, document_image(SKIN), selfie_image(SKIN));
        let outcome = harness.pipeline(pan_fragments()).run(&pan_text_on_aadhaar).unwrap();
        let PipelineOutcome::Registered(record) = outcome else {
            panic!("expected registration");
        };
        assert_eq!(record.id.as_str(), "ABCDE1234F");
        assert_eq!(record.id_type, DocumentType::Pan);
    }

    #[test]
    fn test_missing_id_halts_without_storing() {
        let harness = Harness::new();
        let outcome = harness
            .pipeline(aadhaar_fragments())
            .run(&pan_submission())
            .unwrap();

        let PipelineOutcome::IncompleteRecord(record) = outcome else {
            panic!("expected an incomplete record");
        };
        assert_eq!(record.id, Field::NotFound);
        assert_eq!(harness.db.count_records().unwrap(), 0);
    }
}
