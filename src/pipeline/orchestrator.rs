use anyhow::anyhow;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::core::config::Settings;
use crate::models::essay::{EssayPhase, EssayRecord};
use crate::models::grading::{GradingConfig, GradingResult, WorkflowMode};
use crate::pipeline::cancel::CancelRegistry;
use crate::services::error::ProcessingError;
use crate::services::ocr::OcrClient;
use crate::services::prompt;
use crate::services::providers::ModelRouter;
use crate::services::transcript::TranscriptArchive;

/// Per-essay state machine driver. Decides which steps an essay still needs,
/// runs them against the OCR client and the model router, and converts every
/// failure into essay state; nothing escapes a single essay's run.
///
/// Essay records are taken by value and handed back updated; intermediate
/// states flow through `on_update`, the caller's replace-by-id hook.
pub struct Orchestrator {
    ocr: OcrClient,
    router: ModelRouter,
    cancels: CancelRegistry,
}

impl Orchestrator {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let archive = TranscriptArchive::new(settings.archive());
        let ocr = OcrClient::new(settings.ocr().clone(), Some(archive))?;
        let router = ModelRouter::new(settings.providers().clone())?;
        Ok(Self::new(ocr, router))
    }

    pub fn new(ocr: OcrClient, router: ModelRouter) -> Self {
        Self { ocr, router, cancels: CancelRegistry::new() }
    }

    /// Abort the in-flight operation registered for the essay, if any.
    pub fn cancel(&self, essay_id: &str) -> bool {
        self.cancels.cancel(essay_id)
    }

    pub fn has_active(&self, essay_id: &str) -> bool {
        self.cancels.is_registered(essay_id)
    }

    /// Run one essay through whatever steps it still needs under the given
    /// workflow mode. Always returns the record; errors and cancellations
    /// are recorded on it rather than raised.
    pub async fn process_essay<F>(
        &self,
        mut essay: EssayRecord,
        config: &GradingConfig,
        mode: WorkflowMode,
        on_update: &F,
    ) -> EssayRecord
    where
        F: Fn(&EssayRecord),
    {
        let needs_ocr = mode != WorkflowMode::GradeOnly && essay.needs_ocr();
        let needs_grading = mode != WorkflowMode::OcrOnly && essay.needs_grading();

        if mode == WorkflowMode::GradeOnly && essay.resolved_text().is_none() {
            tracing::info!(essay_id = %essay.id, "Skipping grade-only essay without text");
            return essay;
        }
        if !needs_ocr && !needs_grading {
            tracing::debug!(essay_id = %essay.id, "Essay needs no work in this mode");
            return essay;
        }

        // Registered before the first transition so status=processing always
        // has a live controller behind it; the guard removes the entry on
        // every exit path.
        let (token, _guard) = self.cancels.register(&essay.id);

        match self
            .run_steps(&mut essay, config, mode, needs_ocr, needs_grading, &token, on_update)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                // Captured OCR text stays on the record for a later retry.
                let phase = essay.phase.cancel().unwrap_or(essay.phase);
                essay.set_phase(phase, "已取消");
                tracing::info!(essay_id = %essay.id, "Essay processing cancelled");
            }
            Err(err) => {
                essay.last_error = Some(err.to_string());
                let phase = essay.phase.fail().unwrap_or(essay.phase);
                essay.set_phase(phase, "处理失败");
                tracing::error!(essay_id = %essay.id, error = %err, "Essay processing failed");
            }
        }

        on_update(&essay);
        essay
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps<F>(
        &self,
        essay: &mut EssayRecord,
        config: &GradingConfig,
        mode: WorkflowMode,
        needs_ocr: bool,
        needs_grading: bool,
        token: &CancellationToken,
        on_update: &F,
    ) -> Result<(), ProcessingError>
    where
        F: Fn(&EssayRecord),
    {
        if needs_ocr {
            essay.set_phase(essay.phase.begin_ocr()?, "正在识别手写内容");
            essay.last_error = None;
            on_update(essay);

            let image = essay.image.clone().ok_or_else(|| {
                ProcessingError::Other(anyhow!("原始图片已丢失，请重新上传后再试"))
            })?;

            let transcript = self.ocr.transcribe(&image, token).await?;
            essay.ocr_text = Some(transcript);
            essay.set_phase(essay.phase.finish_ocr()?, "手写识别完成");
            on_update(essay);
        }

        if mode == WorkflowMode::OcrOnly {
            if essay.phase == EssayPhase::OcrComplete {
                essay.set_phase(essay.phase.complete_without_grading()?, "识别完成，未评分");
                on_update(essay);
            }
            return Ok(());
        }

        if needs_grading {
            let via_ocr = essay.raw_text.as_deref().filter(|text| !text.trim().is_empty()).is_none()
                && essay.ocr_text.is_some();
            essay.set_phase(essay.phase.begin_grading(via_ocr)?, "正在评分");
            essay.last_error = None;
            on_update(essay);

            let bundle = prompt::build(essay, config)?;
            let raw = self.router.grade(&bundle, config, token).await?;
            let result: GradingResult = serde_json::from_str(raw.trim())
                .map_err(|err| ProcessingError::MalformedResponse(err.to_string()))?;

            essay.result = Some(result);
            essay.normalize_identity();
            essay.set_phase(essay.phase.finish_grading()?, "评分完成");
            on_update(essay);
        }

        Ok(())
    }

    /// Process eligible essays one at a time in array order, bounding the
    /// vendor load to a single in-flight essay.
    pub async fn start_queue<F>(
        &self,
        essays: Vec<EssayRecord>,
        config: &GradingConfig,
        mode: WorkflowMode,
        on_update: &F,
    ) -> Vec<EssayRecord>
    where
        F: Fn(&EssayRecord),
    {
        let mut processed = Vec::with_capacity(essays.len());
        for essay in essays {
            processed.push(self.process_essay(essay, config, mode, on_update).await);
        }
        processed
    }

    /// Grade every eligible essay concurrently. No ordering guarantee on
    /// completion; per-essay failures stay on their records.
    pub async fn batch_grade<F>(
        &self,
        essays: Vec<EssayRecord>,
        config: &GradingConfig,
        on_update: &F,
    ) -> Vec<EssayRecord>
    where
        F: Fn(&EssayRecord),
    {
        join_all(
            essays.into_iter().map(|essay| {
                self.process_essay(essay, config, WorkflowMode::GradeOnly, on_update)
            }),
        )
        .await
    }

    /// User-initiated retry of a single essay. Re-enters at grading whenever
    /// usable text was already captured; OCR is never repeated once a
    /// transcript exists.
    pub async fn retry_essay<F>(
        &self,
        essay: EssayRecord,
        config: &GradingConfig,
        on_update: &F,
    ) -> EssayRecord
    where
        F: Fn(&EssayRecord),
    {
        self.process_essay(essay, config, WorkflowMode::Auto, on_update).await
    }
}
