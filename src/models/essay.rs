use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::grading::GradingResult;

pub const UNKNOWN_STUDENT: &str = "unknown_student";
pub const UNKNOWN_DATE: &str = "unknown_date";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    Image,
    TypedText,
    ImportedMarkdown,
}

/// Overall essay status as shown to the user. Derived from [`EssayPhase`],
/// never stored independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EssayStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

/// Per-phase sub-status (one for OCR, one for grading). Derived from
/// [`EssayPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Idle,
    Processing,
    Done,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    Queued,
    Ocr,
    OcrComplete,
    Grading,
    Done,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Ocr,
    Grading,
}

/// The one essay state machine. The historical four string fields
/// (`status`, `ocrStatus`, `gradingStatus`, `progressStep`) are derived
/// views over this enum, so contradictory combinations such as a graded
/// essay in an error state cannot be represented.
///
/// `via_ocr` records whether the graded text came from the OCR phase;
/// it drives the Done-vs-Skipped OCR sub-status after OCR is behind us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EssayPhase {
    Queued,
    OcrRunning,
    OcrComplete,
    GradingRunning { via_ocr: bool },
    Done { via_ocr: bool, graded: bool },
    Failed { step: PipelineStep, via_ocr: bool },
    Cancelled { step: PipelineStep, via_ocr: bool },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal essay transition: {event} is not allowed from {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}

impl EssayPhase {
    fn name(&self) -> &'static str {
        match self {
            EssayPhase::Queued => "queued",
            EssayPhase::OcrRunning => "ocr_running",
            EssayPhase::OcrComplete => "ocr_complete",
            EssayPhase::GradingRunning { .. } => "grading_running",
            EssayPhase::Done { .. } => "done",
            EssayPhase::Failed { .. } => "failed",
            EssayPhase::Cancelled { .. } => "cancelled",
        }
    }

    fn illegal(&self, event: &'static str) -> TransitionError {
        TransitionError { from: self.name(), event }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, EssayPhase::OcrRunning | EssayPhase::GradingRunning { .. })
    }

    pub fn begin_ocr(&self) -> Result<Self, TransitionError> {
        match self {
            EssayPhase::Queued
            | EssayPhase::Failed { .. }
            | EssayPhase::Cancelled { .. } => Ok(EssayPhase::OcrRunning),
            _ => Err(self.illegal("begin_ocr")),
        }
    }

    pub fn finish_ocr(&self) -> Result<Self, TransitionError> {
        match self {
            EssayPhase::OcrRunning => Ok(EssayPhase::OcrComplete),
            _ => Err(self.illegal("finish_ocr")),
        }
    }

    /// Enter the grading step. From `OcrComplete` the text necessarily came
    /// from OCR; elsewhere the caller states where the text came from.
    pub fn begin_grading(&self, via_ocr: bool) -> Result<Self, TransitionError> {
        match self {
            EssayPhase::OcrComplete => Ok(EssayPhase::GradingRunning { via_ocr: true }),
            EssayPhase::Queued
            | EssayPhase::Failed { .. }
            | EssayPhase::Cancelled { .. }
            | EssayPhase::Done { graded: false, .. } => {
                Ok(EssayPhase::GradingRunning { via_ocr })
            }
            _ => Err(self.illegal("begin_grading")),
        }
    }

    pub fn finish_grading(&self) -> Result<Self, TransitionError> {
        match self {
            EssayPhase::GradingRunning { via_ocr } => {
                Ok(EssayPhase::Done { via_ocr: *via_ocr, graded: true })
            }
            _ => Err(self.illegal("finish_grading")),
        }
    }

    /// Terminal completion for OCR-only runs: the transcript is captured and
    /// grading is deliberately left for a later pass.
    pub fn complete_without_grading(&self) -> Result<Self, TransitionError> {
        match self {
            EssayPhase::OcrComplete => Ok(EssayPhase::Done { via_ocr: true, graded: false }),
            _ => Err(self.illegal("complete_without_grading")),
        }
    }

    pub fn fail(&self) -> Result<Self, TransitionError> {
        match self {
            EssayPhase::OcrRunning => {
                Ok(EssayPhase::Failed { step: PipelineStep::Ocr, via_ocr: false })
            }
            EssayPhase::GradingRunning { via_ocr } => {
                Ok(EssayPhase::Failed { step: PipelineStep::Grading, via_ocr: *via_ocr })
            }
            _ => Err(self.illegal("fail")),
        }
    }

    pub fn cancel(&self) -> Result<Self, TransitionError> {
        match self {
            EssayPhase::OcrRunning => {
                Ok(EssayPhase::Cancelled { step: PipelineStep::Ocr, via_ocr: false })
            }
            EssayPhase::GradingRunning { via_ocr } => {
                Ok(EssayPhase::Cancelled { step: PipelineStep::Grading, via_ocr: *via_ocr })
            }
            _ => Err(self.illegal("cancel")),
        }
    }

    pub fn status(&self) -> EssayStatus {
        match self {
            EssayPhase::Queued | EssayPhase::OcrComplete => EssayStatus::Pending,
            EssayPhase::OcrRunning | EssayPhase::GradingRunning { .. } => EssayStatus::Processing,
            EssayPhase::Done { .. } => EssayStatus::Completed,
            EssayPhase::Failed { .. } => EssayStatus::Error,
            EssayPhase::Cancelled { .. } => EssayStatus::Cancelled,
        }
    }

    pub fn ocr_status(&self) -> PhaseStatus {
        match self {
            EssayPhase::Queued => PhaseStatus::Idle,
            EssayPhase::OcrRunning => PhaseStatus::Processing,
            EssayPhase::OcrComplete => PhaseStatus::Done,
            EssayPhase::Failed { step: PipelineStep::Ocr, .. } => PhaseStatus::Error,
            // Cancellation mid-OCR is the one allowed regression: the phase
            // goes back to idle so a retry re-enters OCR.
            EssayPhase::Cancelled { step: PipelineStep::Ocr, .. } => PhaseStatus::Idle,
            EssayPhase::GradingRunning { via_ocr }
            | EssayPhase::Done { via_ocr, .. }
            | EssayPhase::Failed { step: PipelineStep::Grading, via_ocr }
            | EssayPhase::Cancelled { step: PipelineStep::Grading, via_ocr } => {
                if *via_ocr {
                    PhaseStatus::Done
                } else {
                    PhaseStatus::Skipped
                }
            }
        }
    }

    pub fn grading_status(&self) -> PhaseStatus {
        match self {
            EssayPhase::GradingRunning { .. } => PhaseStatus::Processing,
            EssayPhase::Done { graded: true, .. } => PhaseStatus::Done,
            EssayPhase::Done { graded: false, .. } => PhaseStatus::Skipped,
            EssayPhase::Failed { step: PipelineStep::Grading, .. } => PhaseStatus::Error,
            _ => PhaseStatus::Idle,
        }
    }

    pub fn progress_step(&self) -> ProgressStep {
        match self {
            EssayPhase::Queued => ProgressStep::Queued,
            EssayPhase::OcrRunning => ProgressStep::Ocr,
            EssayPhase::OcrComplete => ProgressStep::OcrComplete,
            EssayPhase::GradingRunning { .. } => ProgressStep::Grading,
            EssayPhase::Done { .. } => ProgressStep::Done,
            EssayPhase::Failed { .. } => ProgressStep::Error,
            EssayPhase::Cancelled { .. } => ProgressStep::Cancelled,
        }
    }
}

/// Image bytes never survive serialization; after a reload an image-backed
/// essay either has its transcript or needs a re-upload.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub filename: String,
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EssayRecord {
    pub id: String,
    pub kind: SubmissionKind,
    pub raw_text: Option<String>,
    pub ocr_text: Option<String>,
    #[serde(skip)]
    pub image: Option<ImagePayload>,
    pub student_name: Option<String>,
    pub topic: Option<String>,
    pub date: Option<String>,
    pub source_filename: Option<String>,
    pub batch_tag: Option<String>,
    pub created_at: String,
    pub phase: EssayPhase,
    pub progress_message: String,
    pub result: Option<GradingResult>,
    pub last_error: Option<String>,
}

impl EssayRecord {
    fn blank(kind: SubmissionKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            raw_text: None,
            ocr_text: None,
            image: None,
            student_name: None,
            topic: None,
            date: None,
            source_filename: None,
            batch_tag: None,
            created_at: now_rfc3339(),
            phase: EssayPhase::Queued,
            progress_message: "等待处理".to_string(),
            result: None,
            last_error: None,
        }
    }

    pub fn new_image(image: ImagePayload) -> Self {
        let mut essay = Self::blank(SubmissionKind::Image);
        essay.source_filename = Some(image.filename.clone());
        essay.image = Some(image);
        essay
    }

    pub fn new_typed(text: impl Into<String>) -> Self {
        let mut essay = Self::blank(SubmissionKind::TypedText);
        essay.raw_text = Some(text.into());
        essay
    }

    pub fn new_imported_markdown(text: impl Into<String>, filename: impl Into<String>) -> Self {
        let mut essay = Self::blank(SubmissionKind::ImportedMarkdown);
        essay.raw_text = Some(text.into());
        essay.source_filename = Some(filename.into());
        essay
    }

    /// Text the grading step can use: typed or imported text first, then a
    /// captured transcript.
    pub fn resolved_text(&self) -> Option<&str> {
        self.raw_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .or_else(|| self.ocr_text.as_deref().filter(|text| !text.trim().is_empty()))
    }

    /// OCR is wanted only for image essays whose transcript was never
    /// captured. Once any usable text exists the vendor is not called again.
    pub fn needs_ocr(&self) -> bool {
        self.kind == SubmissionKind::Image
            && self.phase.ocr_status() != PhaseStatus::Done
            && self.resolved_text().is_none()
    }

    pub fn needs_grading(&self) -> bool {
        self.phase.grading_status() != PhaseStatus::Done
    }

    pub fn status(&self) -> EssayStatus {
        self.phase.status()
    }

    pub fn ocr_status(&self) -> PhaseStatus {
        self.phase.ocr_status()
    }

    pub fn grading_status(&self) -> PhaseStatus {
        self.phase.grading_status()
    }

    pub fn progress_step(&self) -> ProgressStep {
        self.phase.progress_step()
    }

    pub fn set_phase(&mut self, phase: EssayPhase, message: impl Into<String>) {
        self.phase = phase;
        self.progress_message = message.into();
    }

    /// Fill student name and date from the grading result, falling back to
    /// the literal unknown placeholders when nothing was inferred.
    pub fn normalize_identity(&mut self) {
        let inferred_name =
            self.result.as_ref().and_then(|result| result.student_name.clone()).filter(non_blank);
        let inferred_date =
            self.result.as_ref().and_then(|result| result.date.clone()).filter(non_blank);
        let inferred_topic =
            self.result.as_ref().and_then(|result| result.topic.clone()).filter(non_blank);

        if self.student_name.as_ref().filter(|value| non_blank(value)).is_none() {
            self.student_name = Some(inferred_name.unwrap_or_else(|| UNKNOWN_STUDENT.to_string()));
        }
        if self.date.as_ref().filter(|value| non_blank(value)).is_none() {
            self.date = Some(inferred_date.unwrap_or_else(|| UNKNOWN_DATE.to_string()));
        }
        if self.topic.is_none() {
            self.topic = inferred_topic;
        }
    }
}

fn non_blank(value: &String) -> bool {
    !value.trim().is_empty()
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
