use serde::{Deserialize, Serialize};

use crate::assets::{fresh_id, ImageAsset};
use crate::styles::FitStyle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Single,
    Batch,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Single => "single",
            SessionMode::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Success,
    Error,
}

/// Per-garment outcome for one generation run. One row is created per
/// queued garment when the run starts and is mutated in place, by
/// index, as its call resolves. Rows are never reused across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingResult {
    pub id: String,
    pub garment_name: String,
    pub image_path: String,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl FittingResult {
    fn queued(garment_name: &str, preset: Option<&str>) -> Self {
        Self {
            id: fresh_id(),
            garment_name: garment_name.to_string(),
            image_path: String::new(),
            status: ResultStatus::Pending,
            error_message: None,
            original_image: None,
            preset: preset.map(str::to_string),
        }
    }
}

/// In-memory session for one fitting workflow. All mutation happens on
/// the caller's single thread; the run loop in the engine drives the
/// idle -> running -> idle transitions through `begin_run`/`finish_run`.
///
/// Invariant while a run is live: `results.len() == garments.len()`
/// with positional correspondence.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub mode: SessionMode,
    pub subject: Option<ImageAsset>,
    pub garments: Vec<ImageAsset>,
    pub fit_style: FitStyle,
    pub preset: Option<String>,
    pub results: Vec<FittingResult>,
    pub is_processing: bool,
    pub retry_countdown: Option<u64>,
    pub error_message: Option<String>,
}

pub const MISSING_INPUT_MESSAGE: &str =
    "Please upload both a photo of yourself and at least one garment.";

impl SessionState {
    pub fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Toggling the mode discards all inputs and results; re-setting the
    /// current mode leaves everything alone.
    pub fn set_mode(&mut self, mode: SessionMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        self.clear_inputs();
    }

    pub fn set_subject(&mut self, asset: ImageAsset) {
        self.subject = Some(asset);
        self.error_message = None;
    }

    /// Single mode keeps exactly one garment (replace); batch mode appends.
    pub fn add_garment(&mut self, asset: ImageAsset) {
        match self.mode {
            SessionMode::Single => self.garments = vec![asset],
            SessionMode::Batch => self.garments.push(asset),
        }
        self.error_message = None;
    }

    pub fn remove_garment(&mut self, index: usize) {
        if index < self.garments.len() {
            self.garments.remove(index);
        }
    }

    pub fn clear_inputs(&mut self) {
        self.subject = None;
        self.garments.clear();
        self.results.clear();
        self.error_message = None;
    }

    /// Entry guard for a generation run. On failure the user-visible
    /// message is stored and nothing else changes. On success the run is
    /// live: prior error cleared, one pending result materialized per
    /// garment so every queued slot is visible before the first call.
    pub fn begin_run(&mut self) -> Result<(), String> {
        if self.subject.is_none() || self.garments.is_empty() {
            self.error_message = Some(MISSING_INPUT_MESSAGE.to_string());
            return Err(MISSING_INPUT_MESSAGE.to_string());
        }
        self.is_processing = true;
        self.error_message = None;
        self.results = self
            .garments
            .iter()
            .map(|garment| FittingResult::queued(&garment.name, self.preset.as_deref()))
            .collect();
        Ok(())
    }

    pub fn finish_run(&mut self) {
        self.is_processing = false;
    }

    pub fn mark_success(&mut self, index: usize, image_path: String, original_image: Option<String>) {
        if let Some(result) = self.results.get_mut(index) {
            result.status = ResultStatus::Success;
            result.image_path = image_path;
            result.error_message = None;
            result.original_image = original_image;
        }
    }

    pub fn mark_error(&mut self, index: usize, message: String) {
        if let Some(result) = self.results.get_mut(index) {
            result.status = ResultStatus::Error;
            result.error_message = Some(message);
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub fn status_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for result in &self.results {
            match result.status {
                ResultStatus::Pending => counts.0 += 1,
                ResultStatus::Success => counts.1 += 1,
                ResultStatus::Error => counts.2 += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use crate::assets::ImageAsset;
    use crate::styles::FitStyle;

    use super::{ResultStatus, SessionMode, SessionState, MISSING_INPUT_MESSAGE};

    fn asset(name: &str) -> ImageAsset {
        ImageAsset {
            id: crate::assets::fresh_id(),
            base64: "aGVsbG8=".to_string(),
            mime_type: "image/png".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn begin_run_requires_subject_and_garments() {
        let mut session = SessionState::new(SessionMode::Single);
        let err = session.begin_run().err().unwrap_or_default();
        assert_eq!(err, MISSING_INPUT_MESSAGE);
        assert_eq!(session.error_message.as_deref(), Some(MISSING_INPUT_MESSAGE));
        assert!(!session.is_processing);
        assert!(session.results.is_empty());

        session.add_garment(asset("shirt.png"));
        assert!(session.begin_run().is_err());
        assert!(session.results.is_empty());
    }

    #[test]
    fn begin_run_materializes_one_pending_result_per_garment() {
        let mut session = SessionState::new(SessionMode::Batch);
        session.set_subject(asset("me.jpg"));
        session.add_garment(asset("shirt.png"));
        session.add_garment(asset("coat.png"));
        session.preset = Some("studio".to_string());

        session.begin_run().expect("inputs present");
        assert!(session.is_processing);
        assert_eq!(session.results.len(), session.garments.len());
        for (index, result) in session.results.iter().enumerate() {
            assert_eq!(result.status, ResultStatus::Pending);
            assert_eq!(result.garment_name, session.garments[index].name);
            assert!(result.image_path.is_empty());
            assert_eq!(result.preset.as_deref(), Some("studio"));
        }
    }

    #[test]
    fn single_mode_replaces_garment_batch_mode_appends() {
        let mut session = SessionState::new(SessionMode::Single);
        session.add_garment(asset("a.png"));
        session.add_garment(asset("b.png"));
        assert_eq!(session.garments.len(), 1);
        assert_eq!(session.garments[0].name, "b.png");

        let mut batch = SessionState::new(SessionMode::Batch);
        batch.add_garment(asset("a.png"));
        batch.add_garment(asset("b.png"));
        assert_eq!(batch.garments.len(), 2);

        batch.remove_garment(0);
        assert_eq!(batch.garments[0].name, "b.png");
        batch.remove_garment(9);
        assert_eq!(batch.garments.len(), 1);
    }

    #[test]
    fn toggling_mode_clears_all_inputs_and_results() {
        let mut session = SessionState::new(SessionMode::Batch);
        session.set_subject(asset("me.jpg"));
        for name in ["a.png", "b.png", "c.png"] {
            session.add_garment(asset(name));
        }
        session.begin_run().expect("inputs present");
        session.mark_success(0, "out/a.png".to_string(), None);
        session.finish_run();

        session.set_mode(SessionMode::Single);
        assert!(session.subject.is_none());
        assert!(session.garments.is_empty());
        assert!(session.results.is_empty());
        assert!(session.error_message.is_none());
    }

    #[test]
    fn setting_same_mode_keeps_inputs() {
        let mut session = SessionState::new(SessionMode::Batch);
        session.set_subject(asset("me.jpg"));
        session.add_garment(asset("a.png"));
        session.set_mode(SessionMode::Batch);
        assert!(session.subject.is_some());
        assert_eq!(session.garments.len(), 1);
    }

    #[test]
    fn marks_update_rows_in_place_by_index() {
        let mut session = SessionState::new(SessionMode::Batch);
        session.set_subject(asset("me.jpg"));
        session.add_garment(asset("a.png"));
        session.add_garment(asset("b.png"));
        session.begin_run().expect("inputs present");

        session.mark_success(0, "out/a.png".to_string(), Some("out/subject.jpg".to_string()));
        session.mark_error(1, "quota exceeded".to_string());

        assert_eq!(session.results[0].status, ResultStatus::Success);
        assert_eq!(session.results[0].image_path, "out/a.png");
        assert_eq!(
            session.results[0].original_image.as_deref(),
            Some("out/subject.jpg")
        );
        assert_eq!(session.results[1].status, ResultStatus::Error);
        assert_eq!(session.results[1].error_message.as_deref(), Some("quota exceeded"));
        assert_eq!(session.status_counts(), (0, 1, 1));

        // Out-of-range marks are ignored.
        session.mark_error(5, "nope".to_string());
        assert_eq!(session.results.len(), 2);
    }

    #[test]
    fn fit_style_defaults_to_standard() {
        let session = SessionState::default();
        assert_eq!(session.fit_style, FitStyle::Standard);
    }
}
