//! Session context supplied by the caller and the system instruction built
//! from it.

use serde::{Deserialize, Serialize};

/// Marker prepended to scripted-step control messages so the model treats
/// them as instructions rather than learner speech.
pub const STEP_INSTRUCTION_TAG: &str = "[SYSTEM INSTRUCTION]";

/// Caller-provided context for one tutoring session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Persona / roleplay description for the tutor.
    pub persona_text: String,
    /// Prebuilt voice name; `None` uses the configured default.
    pub voice_id: Option<String>,
    /// Request transcript echo for both directions.
    pub transcripts_enabled: bool,
    /// Scripted steps folded into the persona by reconnect fallbacks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

impl SessionContext {
    pub fn new(persona_text: impl Into<String>) -> Self {
        Self {
            persona_text: persona_text.into(),
            voice_id: None,
            transcripts_enabled: true,
            steps: Vec::new(),
        }
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    pub fn with_transcripts(mut self, enabled: bool) -> Self {
        self.transcripts_enabled = enabled;
        self
    }

    /// Copy of this context with `step` folded in as the current step.
    pub fn with_step(&self, step: &str) -> Self {
        let mut next = self.clone();
        next.steps.push(step.trim().to_string());
        next
    }

    /// The step the session is currently on, if any.
    pub fn current_step(&self) -> Option<&str> {
        self.steps.last().map(String::as_str)
    }

    /// Build the system instruction sent in the setup message.
    pub fn build_system_instruction(&self) -> String {
        let persona = self.persona_text.trim();
        let mut prompt = format!(
            "You are a friendly spoken English tutor. {persona} \
             Speak only English. Keep replies short and natural so the learner \
             gets plenty of speaking time. Gently correct mistakes by modelling \
             the correct phrase instead of lecturing."
        );

        if let Some(step) = self.current_step() {
            prompt.push_str("\n\nCurrent step of the lesson script: ");
            prompt.push_str(step);
            prompt.push_str("\nStart this step now.");
        }

        prompt
    }
}

/// Wrap a scripted step so the model reads it as a system instruction.
pub fn tag_step_instruction(step: &str) -> String {
    format!(
        "{STEP_INSTRUCTION_TAG} Move to the next step of the lesson. Do not read this \
         message aloud. Next step: {}",
        step.trim()
    )
}
