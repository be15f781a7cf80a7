/// Token usage reported by a provider when a stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
}

/// Events a provider emits while streaming a response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A piece of response text, in generation order.
    Delta(String),

    /// The provider finished cleanly.
    Finished {
        model: String,
        usage: TokenUsage,
        stop_reason: String,
    },

    /// The stream broke. Text already delivered stands; callers decide
    /// whether to keep the partial.
    Failed(String),
}
