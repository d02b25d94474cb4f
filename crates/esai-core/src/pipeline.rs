use esai_blocks::{BlockKind, CodeBlock};
use log::debug;

pub const NO_OUTPUT: &str = "(no output)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Execute { label: String, source: String },
    Preview { label: String, content: String },
}

/// Linear plan for a whole reply, in extraction order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectPlan {
    steps: Vec<Step>,
}

impl ProjectPlan {
    pub fn from_message(message: &str) -> Self {
        Self::from_blocks(&esai_blocks::extract(message))
    }

    pub fn from_blocks(blocks: &[CodeBlock]) -> Self {
        let steps = blocks
            .iter()
            .filter_map(|block| match block.kind() {
                BlockKind::Script => Some(Step::Execute {
                    label: block.label(),
                    source: block.source().to_string(),
                }),
                BlockKind::Markup => Some(Step::Preview {
                    label: block.label(),
                    content: block.source().to_string(),
                }),
                BlockKind::Other => {
                    debug!("plan skips {} ({})", block.label(), block.language());
                    None
                }
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn script_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, Step::Execute { .. }))
            .count()
    }

    pub fn needs_session(&self) -> bool {
        self.script_count() > 0
    }
}

/// Accumulates project output. Headers are only emitted when `with_headers`.
#[derive(Debug, Default)]
pub(crate) struct Transcript {
    text: String,
    with_headers: bool,
    produced: bool,
}

impl Transcript {
    pub(crate) fn new(with_headers: bool) -> Self {
        Self {
            with_headers,
            ..Self::default()
        }
    }

    fn break_line(&mut self) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
    }

    pub(crate) fn header(&mut self, label: &str) {
        if self.with_headers {
            self.break_line();
            self.text.push_str(&format!("=== {label} ===\n"));
        }
    }

    pub(crate) fn output(&mut self, text: &str) {
        if !text.is_empty() {
            self.produced = true;
            self.text.push_str(text);
        }
    }

    pub(crate) fn preview_marker(&mut self, label: &str) {
        self.produced = true;
        self.break_line();
        self.text.push_str(&format!("[preview opened: {label}]\n"));
    }

    pub(crate) fn finish(self) -> String {
        if self.produced {
            self.text
        } else {
            NO_OUTPUT.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NO_OUTPUT, ProjectPlan, Step, Transcript};

    #[test]
    fn plan_keeps_extraction_order_and_skips_other_blocks() {
        let message = "```html:index.html\n<p>hi</p>\n```\n```rust\nfn main() {}\n```\n```python:main.py\nprint(1)\n```";
        let plan = ProjectPlan::from_message(message);
        assert_eq!(
            plan.steps(),
            &[
                Step::Preview {
                    label: "index.html".to_string(),
                    content: "<p>hi</p>".to_string(),
                },
                Step::Execute {
                    label: "main.py".to_string(),
                    source: "print(1)".to_string(),
                },
            ]
        );
        assert_eq!(plan.script_count(), 1);
        assert!(plan.needs_session());
    }

    #[test]
    fn markup_only_plan_needs_no_session() {
        let plan = ProjectPlan::from_message("```html\n<p/>\n```");
        assert!(!plan.needs_session());
        assert!(ProjectPlan::from_message("no code here").is_empty());
    }

    #[test]
    fn transcript_separates_sections() {
        let mut transcript = Transcript::new(true);
        transcript.header("a.py");
        transcript.output("no newline");
        transcript.header("b.py");
        transcript.output("Y\n");
        transcript.preview_marker("index.html");
        assert_eq!(
            transcript.finish(),
            "=== a.py ===\nno newline\n=== b.py ===\nY\n[preview opened: index.html]\n"
        );
    }

    #[test]
    fn silent_runs_yield_sentinel() {
        let mut transcript = Transcript::new(true);
        transcript.header("a.py");
        transcript.output("");
        transcript.header("b.py");
        assert_eq!(transcript.finish(), NO_OUTPUT);
    }
}
