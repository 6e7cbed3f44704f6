//! Transcript aggregation and the English-only language gate.
//!
//! Both directions accumulate partial transcript fragments into bounded
//! rolling buffers. Learner fragments first pass [`classify_fragment`]; a
//! rejected fragment is dropped and raises a short-lived warning instead.

use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use crate::config::TranscriptConfig;

/// Warning text shown when learner speech is ignored.
pub const NON_ENGLISH_WARNING: &str =
    "Non-English speech was ignored. Please answer in English.";

/// Common English function words, matched as whole words.
static FUNCTION_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(the|a|an|is|are|am|was|were|be|been|i|you|he|she|it|we|they|me|my|your|this|that|these|those|and|or|but|to|of|in|on|at|for|with|from|do|does|did|have|has|had|not|can|will|would|what|where|when|why|how|yes|no|please|thank|thanks|hello|hi)\b",
    )
    .expect("function word pattern is valid")
});

/// Frequent words of other Latin-script languages that are not English.
static FOREIGN_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(hola|amigo|amiga|gracias|por|favor|que|qué|el|la|los|las|es|está|estoy|muy|pero|yo|usted|bueno|buenos|buenas|señor|sí|bonjour|merci|oui|je|suis|vous|très|bien|ciao|grazie|prego|buongiorno|danke|bitte|ja|nein|ich|und|obrigado|obrigada)\b",
    )
    .expect("foreign marker pattern is valid")
});

// ── Classification ───────────────────────────────────────────────

/// Outcome of the language heuristic for one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentVerdict {
    Accepted,
    Rejected,
}

/// Fraction of non-whitespace characters in the ASCII range.
pub fn ascii_ratio(text: &str) -> f32 {
    let mut total = 0u32;
    let mut ascii = 0u32;
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if c.is_ascii() {
            ascii += 1;
        }
    }
    if total == 0 {
        return 1.0;
    }
    ascii as f32 / total as f32
}

/// Whether the fragment contains an English function word.
pub fn has_function_word(text: &str) -> bool {
    FUNCTION_WORDS.is_match(text)
}

/// Whether the fragment contains a common non-English marker word.
pub fn has_foreign_marker(text: &str) -> bool {
    FOREIGN_MARKERS.is_match(text)
}

/// Decide whether a learner fragment is likely English.
///
/// Empty fragments are always accepted. A function-word match accepts, and
/// so does a mostly ASCII fragment, unless it carries a marker word of
/// another Latin-script language ("hola amigo").
pub fn classify_fragment(text: &str, config: &TranscriptConfig) -> FragmentVerdict {
    let trimmed = text.trim();
    if trimmed.is_empty() || has_function_word(trimmed) {
        return FragmentVerdict::Accepted;
    }
    if has_foreign_marker(trimmed) {
        return FragmentVerdict::Rejected;
    }
    if ascii_ratio(trimmed) > config.ascii_threshold {
        return FragmentVerdict::Accepted;
    }
    FragmentVerdict::Rejected
}

// ── Rolling buffer ───────────────────────────────────────────────

/// Append-only string that keeps only its trailing `max_chars` characters.
#[derive(Debug, Clone)]
pub struct TranscriptBuffer {
    text: String,
    max_chars: usize,
}

impl TranscriptBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            max_chars,
        }
    }

    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        let len = self.text.chars().count();
        if len > self.max_chars {
            let drop = len - self.max_chars;
            let cut = self
                .text
                .char_indices()
                .nth(drop)
                .map_or(self.text.len(), |(i, _)| i);
            self.text.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

// ── Warnings ─────────────────────────────────────────────────────

/// A transient advisory that expires on its own.
#[derive(Debug, Clone, Serialize)]
pub struct LanguageWarning {
    pub message: String,
    /// Wall-clock time the warning was raised, for display.
    pub raised_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip)]
    pub expires_at: Instant,
}

impl LanguageWarning {
    pub fn is_active(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type WarningListener = Arc<dyn Fn(&LanguageWarning) + Send + Sync>;

// ── Aggregator ───────────────────────────────────────────────────

/// Accumulates transcripts for both directions and gates learner input.
pub struct TranscriptAggregator {
    config: TranscriptConfig,
    input: TranscriptBuffer,
    output: TranscriptBuffer,
    warning: Option<LanguageWarning>,
    listeners: Vec<WarningListener>,
    rejected_count: u64,
}

impl TranscriptAggregator {
    pub fn new(config: TranscriptConfig) -> Self {
        Self {
            input: TranscriptBuffer::new(config.max_chars),
            output: TranscriptBuffer::new(config.max_chars),
            config,
            warning: None,
            listeners: Vec::new(),
            rejected_count: 0,
        }
    }

    /// Register a callback invoked once per raised warning.
    pub fn on_warning(&mut self, callback: impl Fn(&LanguageWarning) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(callback));
    }

    /// Append an AI-speech fragment unconditionally.
    pub fn append_output(&mut self, fragment: &str) {
        self.output.push(fragment);
    }

    /// Gate and append a learner-speech fragment.
    pub fn append_input(&mut self, fragment: &str, now: Instant) -> FragmentVerdict {
        let verdict = classify_fragment(fragment, &self.config);
        match verdict {
            FragmentVerdict::Accepted => self.input.push(fragment),
            FragmentVerdict::Rejected => {
                self.rejected_count += 1;
                tracing::debug!(fragment = %fragment, "Ignoring non-English input fragment");
                self.raise_warning(now);
            }
        }
        verdict
    }

    fn raise_warning(&mut self, now: Instant) {
        let warning = LanguageWarning {
            message: NON_ENGLISH_WARNING.to_string(),
            raised_at: chrono::Utc::now(),
            expires_at: now + Duration::from_millis(self.config.warning_ttl_ms),
        };
        for listener in &self.listeners {
            listener(&warning);
        }
        self.warning = Some(warning);
    }

    pub fn input_transcript(&self) -> &str {
        self.input.as_str()
    }

    pub fn output_transcript(&self) -> &str {
        self.output.as_str()
    }

    /// The warning still visible at `now`, if any.
    pub fn active_warning(&self, now: Instant) -> Option<&LanguageWarning> {
        self.warning.as_ref().filter(|w| w.is_active(now))
    }

    /// When the current warning expires, if one is pending.
    pub fn warning_deadline(&self) -> Option<Instant> {
        self.warning.as_ref().map(|w| w.expires_at)
    }

    /// Drop the warning if it has expired. Returns true when it was cleared.
    pub fn expire_warning(&mut self, now: Instant) -> bool {
        if self.warning.as_ref().is_some_and(|w| !w.is_active(now)) {
            self.warning = None;
            return true;
        }
        false
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count
    }

    /// Clear both buffers and any warning for a new session context.
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.warning = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn aggregator() -> TranscriptAggregator {
        TranscriptAggregator::new(TranscriptConfig::default())
    }

    #[test]
    fn spanish_fragment_rejected_with_one_warning() {
        let mut agg = aggregator();
        let raised = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&raised);
        agg.on_warning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let now = Instant::now();
        assert_eq!(agg.append_input("hola amigo", now), FragmentVerdict::Rejected);
        assert_eq!(agg.input_transcript(), "");
        assert_eq!(raised.load(Ordering::SeqCst), 1);
        assert_eq!(
            agg.active_warning(now).map(|w| w.message.as_str()),
            Some(NON_ENGLISH_WARNING)
        );
    }

    #[test]
    fn english_sentence_appended_verbatim() {
        let mut agg = aggregator();
        let now = Instant::now();
        assert_eq!(
            agg.append_input("I am going to the store", now),
            FragmentVerdict::Accepted
        );
        assert_eq!(agg.input_transcript(), "I am going to the store");
        assert!(agg.active_warning(now).is_none());
    }

    #[test]
    fn empty_fragment_accepted_silently() {
        let mut agg = aggregator();
        let raised = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&raised);
        agg.on_warning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let now = Instant::now();
        assert_eq!(agg.append_input("", now), FragmentVerdict::Accepted);
        assert_eq!(agg.append_input("   ", now), FragmentVerdict::Accepted);
        assert_eq!(raised.load(Ordering::SeqCst), 0);
        assert!(agg.active_warning(now).is_none());
    }

    #[test]
    fn non_latin_script_rejected() {
        let config = TranscriptConfig::default();
        assert_eq!(classify_fragment("안녕하세요", &config), FragmentVerdict::Rejected);
        assert_eq!(classify_fragment("Привет мир", &config), FragmentVerdict::Rejected);
    }

    #[test]
    fn single_streaming_word_accepted() {
        let config = TranscriptConfig::default();
        assert_eq!(classify_fragment(" Hel", &config), FragmentVerdict::Accepted);
        assert_eq!(classify_fragment("coffee", &config), FragmentVerdict::Accepted);
    }

    #[test]
    fn short_english_phrases_without_function_words_accepted() {
        let config = TranscriptConfig::default();
        for phrase in ["Good morning", "Large latte", "Nice weather today", "Two cappuccinos"] {
            assert_eq!(classify_fragment(phrase, &config), FragmentVerdict::Accepted, "{phrase}");
        }
    }

    #[test]
    fn foreign_markers_reject_latin_script_text() {
        let config = TranscriptConfig::default();
        for phrase in ["hola amigo", "Bonjour, merci", "muchas gracias", "danke schön"] {
            assert_eq!(classify_fragment(phrase, &config), FragmentVerdict::Rejected, "{phrase}");
        }
        // An English function word wins over a marker.
        assert_eq!(
            classify_fragment("I said hola", &config),
            FragmentVerdict::Accepted
        );
    }

    #[test]
    fn function_word_must_be_whole_word() {
        // "theatre" and "island" contain "the" / "is" but not as words.
        assert!(!has_function_word("theatre island"));
        assert!(has_function_word("The island"));
    }

    #[test]
    fn ascii_ratio_ignores_whitespace() {
        assert!((ascii_ratio("ab cd") - 1.0).abs() < f32::EPSILON);
        assert!((ascii_ratio("a한") - 0.5).abs() < f32::EPSILON);
        assert!((ascii_ratio("   ") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn output_is_never_gated() {
        let mut agg = aggregator();
        agg.append_output("hola ");
        agg.append_output("amigo");
        assert_eq!(agg.output_transcript(), "hola amigo");
        assert!(agg.active_warning(Instant::now()).is_none());
    }

    #[test]
    fn buffer_keeps_trailing_window() {
        let mut buf = TranscriptBuffer::new(5);
        buf.push("abc");
        buf.push("defg");
        assert_eq!(buf.as_str(), "cdefg");
        buf.push("한글");
        assert_eq!(buf.as_str(), "efg한글");
        assert_eq!(buf.as_str().chars().count(), 5);
    }

    #[test]
    fn warning_expires_after_ttl() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.append_input("hola amigo", now);
        let deadline = agg.warning_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_millis(4000));

        assert!(!agg.expire_warning(now + Duration::from_millis(3999)));
        assert!(agg.active_warning(now + Duration::from_millis(3999)).is_some());
        assert!(agg.active_warning(deadline).is_none());
        assert!(agg.expire_warning(deadline));
        assert!(agg.warning_deadline().is_none());
    }

    #[test]
    fn reset_clears_everything() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.append_input("I like tea", now);
        agg.append_output("Great choice");
        agg.append_input("hola amigo", now);
        agg.reset();
        assert_eq!(agg.input_transcript(), "");
        assert_eq!(agg.output_transcript(), "");
        assert!(agg.active_warning(now).is_none());
        assert_eq!(agg.rejected_count(), 1);
    }
}
