use chrono::{DateTime, Utc};

/// One unit of untrusted source code waiting to be executed.
///
/// Built once by the ingestion layer and never mutated afterwards; the
/// builder methods consume the value before it is handed to the scheduler.
#[derive(Debug, Clone)]
pub struct Submission {
    id: u64,
    source_text: String,
    language: String,
    entry_name: Option<String>,
    stdin: Option<String>,
    received_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(id: u64, source_text: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id,
            source_text: source_text.into(),
            language: language.into(),
            entry_name: None,
            stdin: None,
            received_at: Utc::now(),
        }
    }

    /// Input fed to the program before launch
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Overrides the entry symbol the language strategy would derive
    pub fn with_entry_name(mut self, entry_name: impl Into<String>) -> Self {
        self.entry_name = Some(entry_name.into());
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn entry_name(&self) -> Option<&str> {
        self.entry_name.as_deref()
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
