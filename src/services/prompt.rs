use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::models::essay::EssayRecord;
use crate::models::grading::{GradingConfig, ProficiencyLevel};
use crate::services::error::ProcessingError;

/// Provider-agnostic prompt material. Binary-to-text image encoding happens
/// only here; the adapters never see raw bytes.
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub system_prompt: String,
    pub user_prompt: String,
    pub image: Option<EncodedImage>,
}

#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: String,
    pub mime: String,
}

impl EncodedImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

const DEFAULT_SUMMARY_PROMPT: &str =
    "用两三句话总结这篇作文的整体水平，点明最突出的优点和最主要的问题。";
const DEFAULT_STRENGTHS_PROMPT: &str = "列出这篇作文值得肯定的地方，具体到用词或句子。";
const DEFAULT_IMPROVEMENTS_PROMPT: &str =
    "给出具体可执行的改进建议，按重要性排序，每条针对一个问题。";

fn tier_guidance(level: ProficiencyLevel) -> &'static str {
    match level {
        ProficiencyLevel::Beginner => {
            "Beginner tier: expect very simple sentences and a basic vocabulary of everyday \
             words. Grade leniently on structure; reward any complete, understandable sentence. \
             Flag only errors that block comprehension."
        }
        ProficiencyLevel::Elementary => {
            "Elementary tier: expect short connected sentences with common linking words and \
             mostly present-tense constructions. Penalize repeated basic grammar mistakes but \
             tolerate limited vocabulary range."
        }
        ProficiencyLevel::Intermediate => {
            "Intermediate tier: expect paragraph-level organization, a mix of simple and \
             compound sentences, and some topical vocabulary. Penalize weak cohesion, tense \
             inconsistency and imprecise word choice."
        }
        ProficiencyLevel::Advanced => {
            "Advanced tier: expect clear essay structure, varied sentence patterns, idiomatic \
             usage and a wide vocabulary. Hold errors in register, collocation and nuance \
             against the score."
        }
    }
}

/// Assemble the grading prompt from the essay and the user's configuration.
/// Fails when the essay has neither usable text nor an attached image.
pub fn build(essay: &EssayRecord, config: &GradingConfig) -> Result<PromptBundle, ProcessingError> {
    let summary_prompt =
        config.section_prompts.summary.as_deref().unwrap_or(DEFAULT_SUMMARY_PROMPT);
    let strengths_prompt =
        config.section_prompts.strengths.as_deref().unwrap_or(DEFAULT_STRENGTHS_PROMPT);
    let improvements_prompt =
        config.section_prompts.improvements.as_deref().unwrap_or(DEFAULT_IMPROVEMENTS_PROMPT);

    let focus_areas = if config.focus_areas.is_empty() {
        "overall quality".to_string()
    } else {
        config.focus_areas.join(", ")
    };

    let system_prompt = format!(
        r#"You are an experienced English essay teacher grading a student essay.

Student proficiency: {level}.
{tier}

Scoring: award a numeric score between 0 and {max_score}. Judge content, organization, language accuracy and vocabulary range against the stated proficiency tier.
Focus areas selected by the teacher: {focus_areas}.

Report section instructions:
- summary: {summary_prompt}
- strengths: {strengths_prompt}
- improvements: {improvements_prompt}

Respond with a single JSON object and nothing else - no prose, no markdown fences. The object must have exactly these fields:
{{
  "score": <number>,
  "letter_grade": <string or null>,
  "summary": <string>,
  "corrections": [{{"category": "grammar|vocabulary|spelling|structure|punctuation", "original": <string>, "corrected": <string>, "explanation": <string>}}],
  "strengths": [<string>],
  "improvements": [<string>],
  "student_name": <string or null>,
  "date": <string or null>,
  "topic": <string or null>
}}

All explanatory text (summary, explanation, strengths, improvements) must be written in Chinese, regardless of the language of the essay."#,
        level = config.level.as_str(),
        tier = tier_guidance(config.level),
        max_score = config.max_score,
        focus_areas = focus_areas,
        summary_prompt = summary_prompt,
        strengths_prompt = strengths_prompt,
        improvements_prompt = improvements_prompt,
    );

    if let Some(text) = essay.resolved_text() {
        let user_prompt = format!(
            "The essay text below was already transcribed - use it as-is and do not attempt any \
             re-transcription. If the first lines carry a name/date/topic header, infer \
             student_name, date and topic from them.\n\n{text}"
        );
        return Ok(PromptBundle { system_prompt, user_prompt, image: None });
    }

    let Some(image) = &essay.image else {
        return Err(ProcessingError::Other(anyhow!(
            "essay {} has neither text nor an attached image",
            essay.id
        )));
    };

    let user_prompt = "Transcribe and grade the handwritten essay in the attached image. Infer \
                       student_name, date and topic from any header lines you can read."
        .to_string();

    Ok(PromptBundle {
        system_prompt,
        user_prompt,
        image: Some(EncodedImage {
            data: STANDARD.encode(&image.bytes),
            mime: image.mime.clone(),
        }),
    })
}
