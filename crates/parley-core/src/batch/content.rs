//! Aggregated content rendering.
//!
//! The aggregated content of a batch is a pure function of its ordered
//! members: a single message passes through verbatim; several messages are
//! each prefixed with an ordinal label and separated by a blank line.

/// Label template placed above each section of a multi-message batch.
///
/// `{n}` is replaced by the 1-based position of the message in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdinalLabel {
    template: String,
}

impl OrdinalLabel {
    pub const DEFAULT_TEMPLATE: &'static str = "消息{n}：";

    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, position: usize) -> String {
        self.template.replace("{n}", &position.to_string())
    }
}

impl Default for OrdinalLabel {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TEMPLATE)
    }
}

/// Render the aggregated content for `contents`, in order.
pub fn aggregate_content<S: AsRef<str>>(contents: &[S], label: &OrdinalLabel) -> String {
    match contents {
        [] => String::new(),
        [only] => only.as_ref().to_string(),
        many => many
            .iter()
            .enumerate()
            .map(|(i, content)| format!("{}\n{}", label.render(i + 1), content.as_ref()))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}
