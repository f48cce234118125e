use crate::types::{BidiGenerateContentClientContent, Content, Part, Role};

/// What the learner asked and the material it was asked about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    pub question: String,
    pub video_title: Option<String>,
    pub transcript: Option<String>,
    pub analysis: Option<String>,
}

impl ConversationContext {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn video_title(mut self, title: impl Into<String>) -> Self {
        self.video_title = Some(title.into());
        self
    }

    pub fn transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }

    pub fn analysis(mut self, analysis: impl Into<String>) -> Self {
        self.analysis = Some(analysis.into());
        self
    }

    /// Text of the opening turn. Each context section is cut to
    /// `max_context_chars` characters; empty sections are left out.
    pub fn opening_text(&self, max_context_chars: usize) -> String {
        let mut text = String::new();
        if let Some(title) = non_empty(&self.video_title) {
            text.push_str(&format!("We are discussing the video \"{}\".\n", title));
        }
        if let Some(transcript) = non_empty(&self.transcript) {
            text.push_str("Transcript:\n");
            text.push_str(&truncate_chars(transcript, max_context_chars));
            text.push_str("\n\n");
        }
        if let Some(analysis) = non_empty(&self.analysis) {
            text.push_str("Analysis:\n");
            text.push_str(&truncate_chars(analysis, max_context_chars));
            text.push_str("\n\n");
        }
        text.push_str("My question: ");
        text.push_str(self.question.trim());
        text
    }

    /// `clientContent` message carrying the opening user turn.
    pub fn opening_turn(&self, max_context_chars: usize) -> BidiGenerateContentClientContent {
        BidiGenerateContentClientContent {
            turns: Some(vec![Content {
                parts: vec![Part {
                    text: Some(self.opening_text(max_context_chars)),
                    inline_data: None,
                }],
                role: Some(Role::User),
            }]),
            turn_complete: Some(true),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
