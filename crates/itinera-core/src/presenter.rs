use crate::error::AgentError;

/// Receives a reply as it is generated.
///
/// `on_token` is called zero or more times in generation order, followed by
/// exactly one of `on_complete` or `on_error`.
pub trait Presenter: Send {
    fn on_token(&mut self, fragment: &str);

    /// The model asked for a tool. Text streamed so far in this step is not
    /// part of the reply.
    fn on_tool_call(&mut self, _name: &str, _query: &str) {}

    fn on_complete(&mut self, full_text: &str);

    fn on_error(&mut self, error: &AgentError);
}

/// Accumulated render state for a streamed reply.
///
/// Surfaces re-display `text()` after every change instead of appending
/// fragments, so re-rendering never duplicates output.
#[derive(Debug, Default, Clone)]
pub struct TranscriptBuffer {
    text: String,
    finished: bool,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the text to display.
    pub fn push(&mut self, fragment: &str) -> &str {
        if !self.finished {
            self.text.push_str(fragment);
        }
        &self.text
    }

    /// Replace the streamed text with the final reply.
    pub fn finish(&mut self, full_text: &str) -> &str {
        if !self.finished {
            self.text.clear();
            self.text.push_str(full_text);
            self.finished = true;
        }
        &self.text
    }

    /// Start a new segment (after a tool call, or for the next turn).
    pub fn reset(&mut self) {
        self.text.clear();
        self.finished = false;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Presenter that records everything it is told. Used for non-interactive
/// callers and in tests.
#[derive(Debug, Default)]
pub struct CollectingPresenter {
    pub buffer: TranscriptBuffer,
    /// Every state the surface would have rendered, in order.
    pub frames: Vec<String>,
    pub tool_calls: Vec<(String, String)>,
    pub completed: Option<String>,
    pub error: Option<String>,
}

impl CollectingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendered(&self) -> &str {
        self.buffer.text()
    }
}

impl Presenter for CollectingPresenter {
    fn on_token(&mut self, fragment: &str) {
        let text = self.buffer.push(fragment).to_string();
        self.frames.push(text);
    }

    fn on_tool_call(&mut self, name: &str, query: &str) {
        self.buffer.reset();
        self.tool_calls.push((name.to_string(), query.to_string()));
    }

    fn on_complete(&mut self, full_text: &str) {
        let text = self.buffer.finish(full_text).to_string();
        self.frames.push(text);
        self.completed = Some(full_text.to_string());
    }

    fn on_error(&mut self, error: &AgentError) {
        self.error = Some(error.to_string());
    }
}
