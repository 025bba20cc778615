use serde::{Deserialize, Serialize};

/// One correction extracted by the model. The category is kept as the free
/// string the model returned (grammar, vocabulary, spelling, structure,
/// punctuation); nothing rejects values outside that set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionItem {
    pub category: String,
    pub original: String,
    pub corrected: String,
    pub explanation: String,
}

/// Structured feedback returned by a grading call. The score is trusted as
/// returned; no clamping against the configured ceiling happens anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingResult {
    pub score: f64,
    #[serde(default)]
    pub letter_grade: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub corrections: Vec<CorrectionItem>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub student_name: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProficiencyLevel {
    Beginner,
    Elementary,
    Intermediate,
    Advanced,
}

impl ProficiencyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ProficiencyLevel::Beginner => "beginner",
            ProficiencyLevel::Elementary => "elementary",
            ProficiencyLevel::Intermediate => "intermediate",
            ProficiencyLevel::Advanced => "advanced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    Gemini,
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "deepseek" => Some(ProviderKind::DeepSeek),
            "gemini" => Some(ProviderKind::Gemini),
            "openrouter" => Some(ProviderKind::OpenRouter),
            _ => None,
        }
    }
}

/// User-selected batch policy for a processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    OcrOnly,
    GradeOnly,
    Auto,
}

/// Optional overrides for the three report sections; `None` falls back to
/// the built-in instructions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionPrompts {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub strengths: Option<String>,
    #[serde(default)]
    pub improvements: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    pub level: ProficiencyLevel,
    pub max_score: f64,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub section_prompts: SectionPrompts,
}

impl GradingConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            level: ProficiencyLevel::Intermediate,
            max_score: 100.0,
            focus_areas: Vec::new(),
            provider,
            model: model.into(),
            section_prompts: SectionPrompts::default(),
        }
    }
}
