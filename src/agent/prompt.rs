use crate::config::PipelineConfig;
use crate::datasource::TableSnapshot;
use crate::transcript::TranscriptEntry;

/// Builds the prompts sent to the completion service.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_records: usize,
    not_found_reply: String,
}

impl PromptBuilder {
    pub fn new(max_records: usize, not_found_reply: impl Into<String>) -> Self {
        Self {
            max_records,
            not_found_reply: not_found_reply.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_records, config.not_found_reply.clone())
    }

    /// Prompt answering `question` from the snapshot only.
    ///
    /// `history` is newest first, as returned by the transcript store; it is
    /// rendered oldest first.
    pub fn answer_prompt(&self, snapshot: &TableSnapshot, question: &str, history: &[TranscriptEntry]) -> String {
        let mut prompt = String::from(
            "You are an assistant answering questions about a Lark Base table.\n\
             Use only the data below.\n\n",
        );

        self.push_table(&mut prompt, snapshot);

        if !history.is_empty() {
            prompt.push_str("Earlier in this conversation:\n");
            for entry in history.iter().rev() {
                prompt.push_str(&format!("User: {}\nAssistant: {}\n", entry.question, entry.answer));
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!("Question: {}\n\n", question));
        prompt.push_str(&format!(
            "Answer concisely from the data above. If the data does not contain the answer, reply exactly: \"{}\"",
            self.not_found_reply
        ));
        prompt
    }

    /// Prompt asking for a JSON filter list narrowing the snapshot to the
    /// records relevant to `question`.
    pub fn filter_prompt(&self, snapshot: &TableSnapshot, question: &str) -> String {
        let mut prompt = String::from(
            "You select rows from a Lark Base table. Reply with JSON only: an array of conditions \
             {\"field\": <column>, \"op\": <one of eq, ne, contains, gt, gte, lt, lte>, \"value\": <value>}.\n\
             All conditions must hold for a row to be kept. Reply [] to keep every row.\n\n",
        );

        self.push_table(&mut prompt, snapshot);
        prompt.push_str(&format!("Question: {}\n", question));
        prompt
    }

    fn push_table(&self, prompt: &mut String, snapshot: &TableSnapshot) {
        prompt.push_str(&format!("Columns: {}\n\n", snapshot.columns().join(", ")));

        let shown = snapshot.len().min(self.max_records);
        let records = &snapshot.records()[..shown];
        let rendered = serde_json::to_string_pretty(records).unwrap_or_default();
        if shown < snapshot.len() {
            prompt.push_str(&format!("Records (first {} of {}):\n", shown, snapshot.len()));
        } else {
            prompt.push_str("Records:\n");
        }
        prompt.push_str(&rendered);
        prompt.push_str("\n\n");
    }
}
