//! Intent Classifier
//!
//! Classifies user messages into an intent label plus confidence using
//! trigger-phrase patterns compiled once at construction, then a
//! context-aware re-rank. The re-rank is only permitted to bias toward
//! "continue the current workflow" when the session state is ACTIVE;
//! for IDLE states classification runs exactly as if no session
//! existed, so an identical message yields an identical result.

use regex::Regex;

use super::{ClassifiedIntent, IntentKind, Priority};
use crate::session::StateClass;

/// Session context the classifier is allowed to see. Deliberately
/// narrow: the state *classification*, not the state itself, plus
/// whether a subject is already resolved.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationContext {
    pub state_class: StateClass,
    pub has_active_subject: bool,
}

impl Default for ClassificationContext {
    fn default() -> Self {
        Self {
            state_class: StateClass::Idle,
            has_active_subject: false,
        }
    }
}

struct CompiledPattern {
    kind: IntentKind,
    regex: Regex,
    /// Words in the source phrase, for the specificity boost.
    phrase_words: usize,
    /// Index of the capture group holding the free-text argument.
    argument_group: Option<usize>,
}

/// The classifier. Patterns are compiled once in the constructor.
pub struct IntentClassifier {
    patterns: Vec<CompiledPattern>,
}

/// (intent, pattern, has-argument-capture). Patterns are anchored
/// case-insensitively against the whole trimmed message.
const TRIGGER_PATTERNS: &[(IntentKind, &str, bool)] = &[
    // P0
    (IntentKind::Cancel, r"(cancel|stop|abort|quit)( .*)?", false),
    (IntentKind::Cancel, r"(never mind|nevermind|forget it)", false),
    (IntentKind::Help, r"help( me)?( .*)?", false),
    (IntentKind::Help, r"what can (you|i) do( here)?\??", false),
    // P1: listing
    (
        IntentKind::ListSubjects,
        r"(show|list)( me)?( my| the| all)? ?(tasks|items|work items|list)",
        false,
    ),
    (
        IntentKind::ListSubjects,
        r"what('s| is) on my (list|plate)\??",
        false,
    ),
    // P1: selection
    (IntentKind::SelectSubject, r"item (\d+)", true),
    (
        IntentKind::SelectSubject,
        r"the (first|second|third|last) one",
        true,
    ),
    (
        IntentKind::SelectSubject,
        r"(work on|open|pick|select|switch to) (.+)",
        true,
    ),
    // P1: updating
    (IntentKind::UpdateSubject, r"update (.+)", true),
    (IntentKind::UpdateSubject, r"(change|edit|rename) (.+)", true),
    (IntentKind::UpdateSubject, r"set (.+) to (.+)", true),
    (
        IntentKind::UpdateSubject,
        r"(fix|correct) (the )?(.+)",
        true,
    ),
    // P1: completing
    (
        IntentKind::CompleteSubject,
        r"mark (it|this|that|.+?) (as )?(done|complete|completed|finished)",
        false,
    ),
    (
        IntentKind::CompleteSubject,
        r"(complete|finish|close) (.+)",
        true,
    ),
    (IntentKind::CompleteSubject, r"(it's|its) done", false),
    // P1: reporting
    (
        IntentKind::ReportIssue,
        r"report (a |an )?(issue|problem|bug)( .*)?",
        false,
    ),
    (
        IntentKind::ReportIssue,
        r"something('s| is) (wrong|broken|off)( .*)?",
        false,
    ),
    // Overlaps with the update verbs on purpose: "fix the bug" can mean
    // either edit-the-item or report-a-defect, and should clarify.
    (
        IntentKind::ReportIssue,
        r"(fix|flag) (the )?(issue|problem|bug)( .*)?",
        false,
    ),
    // P2: confirmations
    (
        IntentKind::Affirm,
        r"(yes|yeah|yep|sure|confirm|go ahead|do it|ok|okay)\.?!?",
        false,
    ),
    (
        IntentKind::Deny,
        r"(no|nope|don't|do not|wait|go back|not that)\.?!?",
        false,
    ),
    (
        IntentKind::ContinueWorkflow,
        r"(continue|keep going|carry on|resume)( .*)?",
        false,
    ),
    // P3
    (
        IntentKind::General,
        r"(hi|hello|hey|thanks|thank you)( .*)?",
        false,
    ),
];

impl IntentClassifier {
    pub fn new() -> Self {
        let patterns = TRIGGER_PATTERNS
            .iter()
            .filter_map(|(kind, pattern, has_argument)| {
                let anchored = format!(r"(?i)^\s*(?:please\s+)?(?:{pattern})\s*$");
                let regex = Regex::new(&anchored).ok()?;
                let argument_group = if *has_argument {
                    // The argument is the last non-empty capture group.
                    Some(regex.captures_len() - 1)
                } else {
                    None
                };
                Some(CompiledPattern {
                    kind: *kind,
                    regex,
                    phrase_words: pattern.split_whitespace().count(),
                    argument_group,
                })
            })
            .collect();
        Self { patterns }
    }

    /// Single best intent for the message.
    pub fn classify(&self, text: &str, ctx: &ClassificationContext) -> ClassifiedIntent {
        self.candidates(text, ctx)
            .into_iter()
            .next()
            .unwrap_or_else(|| ClassifiedIntent::new(IntentKind::Unknown, 0.2))
    }

    /// All candidate intents, best first. A P0 match short-circuits to a
    /// single candidate so nothing can outrank it.
    pub fn candidates(&self, text: &str, ctx: &ClassificationContext) -> Vec<ClassifiedIntent> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return vec![ClassifiedIntent::new(IntentKind::Unknown, 0.2)];
        }

        let mut matches: Vec<ClassifiedIntent> = Vec::new();
        for pattern in &self.patterns {
            if let Some(captures) = pattern.regex.captures(trimmed) {
                if pattern.kind.priority() == Priority::P0 {
                    return vec![ClassifiedIntent::new(pattern.kind, 0.98)];
                }
                let argument = pattern.argument_group.and_then(|group| {
                    captures
                        .iter()
                        .take(group + 1)
                        .skip(1)
                        .flatten()
                        .last()
                        .map(|m| m.as_str().trim().to_string())
                });
                let confidence = self.match_quality(trimmed, pattern.phrase_words);
                matches.push(ClassifiedIntent {
                    kind: pattern.kind,
                    confidence,
                    argument,
                });
            }
        }

        // Deduplicate by kind, keeping the strongest match.
        let mut best_by_kind: std::collections::HashMap<IntentKind, ClassifiedIntent> =
            std::collections::HashMap::new();
        for m in matches {
            let entry = best_by_kind.entry(m.kind).or_insert_with(|| m.clone());
            if m.confidence > entry.confidence {
                *entry = m;
            }
        }
        let mut matches: Vec<ClassifiedIntent> = best_by_kind.into_values().collect();

        self.rerank(&mut matches, ctx);

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.kind.priority().cmp(&b.kind.priority()))
        });

        if matches.is_empty() {
            matches.push(self.fallback(ctx));
        }
        matches
    }

    /// Base confidence from match quality, following the phrase-length
    /// heuristics of pattern classifiers: longer trigger phrases are
    /// more specific, and a message close in length to the phrase is a
    /// tighter match.
    fn match_quality(&self, text: &str, phrase_words: usize) -> f32 {
        let mut confidence = 0.7f32;
        if phrase_words > 3 {
            confidence += 0.1;
        }
        if phrase_words > 5 {
            confidence += 0.05;
        }
        let text_words = text.split_whitespace().count();
        let ratio = phrase_words as f32 / (text_words as f32).max(1.0);
        if (0.5..1.5).contains(&ratio) {
            confidence += 0.1;
        }
        confidence.min(0.95)
    }

    /// Context re-rank. ACTIVE sessions boost continuation intents;
    /// IDLE contexts change nothing, by construction.
    fn rerank(&self, candidates: &mut [ClassifiedIntent], ctx: &ClassificationContext) {
        if ctx.state_class != StateClass::Active {
            return;
        }
        for candidate in candidates.iter_mut() {
            if matches!(
                candidate.kind,
                IntentKind::Affirm | IntentKind::Deny | IntentKind::ContinueWorkflow
            ) {
                candidate.confidence = (candidate.confidence * 1.2).min(0.99);
            }
        }
    }

    /// No pattern matched. In an ACTIVE state free text is most likely
    /// data for the in-flight workflow; in IDLE it stays unknown.
    fn fallback(&self, ctx: &ClassificationContext) -> ClassifiedIntent {
        match ctx.state_class {
            StateClass::Active => ClassifiedIntent::new(IntentKind::ContinueWorkflow, 0.55),
            StateClass::Idle => ClassifiedIntent::new(IntentKind::Unknown, 0.2),
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle() -> ClassificationContext {
        ClassificationContext::default()
    }

    fn active() -> ClassificationContext {
        ClassificationContext {
            state_class: StateClass::Active,
            has_active_subject: true,
        }
    }

    #[test]
    fn test_cancel_always_wins() {
        let classifier = IntentClassifier::new();
        let result = classifier.candidates("cancel the update", &active());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].kind, IntentKind::Cancel);
        assert!(result[0].confidence > 0.95);
    }

    #[test]
    fn test_explicit_domain_actions() {
        let classifier = IntentClassifier::new();

        let result = classifier.classify("show me my tasks", &idle());
        assert_eq!(result.kind, IntentKind::ListSubjects);

        let result = classifier.classify("mark it done", &idle());
        assert_eq!(result.kind, IntentKind::CompleteSubject);

        let result = classifier.classify("work on the deployment task", &idle());
        assert_eq!(result.kind, IntentKind::SelectSubject);
        assert_eq!(result.argument.as_deref(), Some("the deployment task"));
    }

    #[test]
    fn test_positional_selection_captures_number() {
        let classifier = IntentClassifier::new();
        let result = classifier.classify("item 2", &idle());
        assert_eq!(result.kind, IntentKind::SelectSubject);
        assert_eq!(result.argument.as_deref(), Some("2"));
    }

    #[test]
    fn test_idle_context_is_not_biased() {
        let classifier = IntentClassifier::new();
        let message = "show me something else entirely";

        let with_session = ClassificationContext {
            state_class: StateClass::Idle,
            has_active_subject: true,
        };
        let without_session = ClassificationContext::default();

        let a = classifier.candidates(message, &with_session);
        let b = classifier.candidates(message, &without_session);
        assert_eq!(a, b);
    }

    #[test]
    fn test_active_context_boosts_continuation() {
        let classifier = IntentClassifier::new();

        let idle_result = classifier.classify("yes", &idle());
        let active_result = classifier.classify("yes", &active());
        assert_eq!(idle_result.kind, IntentKind::Affirm);
        assert_eq!(active_result.kind, IntentKind::Affirm);
        assert!(active_result.confidence > idle_result.confidence);
    }

    #[test]
    fn test_free_text_fallback_depends_on_state_class() {
        let classifier = IntentClassifier::new();
        let message = "the new deadline is next friday";

        let idle_result = classifier.classify(message, &idle());
        assert_eq!(idle_result.kind, IntentKind::Unknown);

        let active_result = classifier.classify(message, &active());
        assert_eq!(active_result.kind, IntentKind::ContinueWorkflow);
    }

    #[test]
    fn test_overlapping_verbs_yield_close_candidates() {
        let classifier = IntentClassifier::new();
        let candidates = classifier.candidates("fix the bug in checkout", &idle());

        let kinds: Vec<IntentKind> = candidates.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&IntentKind::ReportIssue));
        assert!(kinds.contains(&IntentKind::UpdateSubject));
        // Close enough that the conflict resolver should ask.
        assert!((candidates[0].confidence - candidates[1].confidence).abs() < 0.15);
    }

    #[test]
    fn test_confidence_in_unit_interval() {
        let classifier = IntentClassifier::new();
        for message in [
            "cancel",
            "update the report with the latest numbers please",
            "item 3",
            "yes",
            "xyzzy",
        ] {
            for ctx in [idle(), active()] {
                for candidate in classifier.candidates(message, &ctx) {
                    assert!((0.0..=1.0).contains(&candidate.confidence), "{message}");
                }
            }
        }
    }
}
