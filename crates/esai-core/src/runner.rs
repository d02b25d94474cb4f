use crate::pipeline::{NO_OUTPUT, ProjectPlan, Step, Transcript};
use crate::session::{BusyPolicy, ExecutionSession, RunPermit, SessionError, SessionHandle};
use crate::{RunError, RunResult};
use esai_blocks::{BlockKind, CodeBlock};
use esai_preview::PreviewSink;
use log::{debug, info};
use std::sync::Arc;

/// Runs blocks against a shared session and publishes markup to a preview
/// sink. Cheap to clone; clones share the session and the sink.
#[derive(Clone)]
pub struct Runner<P> {
    session: Arc<ExecutionSession>,
    preview: P,
    policy: BusyPolicy,
}

impl<P: PreviewSink> Runner<P> {
    pub fn new(session: Arc<ExecutionSession>, preview: P) -> Self {
        Self {
            session,
            preview,
            policy: BusyPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: BusyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> BusyPolicy {
        self.policy
    }

    pub fn session(&self) -> &Arc<ExecutionSession> {
        &self.session
    }

    pub fn preview_sink(&self) -> &P {
        &self.preview
    }

    async fn acquire(&self) -> Result<RunPermit, RunError> {
        self.session.acquire(self.policy).await.map_err(RunError::from)
    }

    async fn ready(&self) -> Result<SessionHandle, RunError> {
        self.session.ensure_ready().await.map_err(RunError::from)
    }

    pub async fn run_one(&self, block: &CodeBlock) -> Result<RunResult, RunError> {
        match block.kind() {
            BlockKind::Script => {
                let permit = self.acquire().await?;
                let handle = self.ready().await?;
                let label = block.label();
                debug!("running {label}");
                match handle.run_captured(&permit, block.source(), &label).await {
                    Ok(captured) => Ok(match captured.error {
                        None => RunResult::ok(captured.output),
                        Some(err) => RunResult::failure(captured.output, err.message),
                    }),
                    Err(err) => Ok(RunResult::failure(String::new(), err.to_string())),
                }
            }
            BlockKind::Markup => {
                self.show_preview(block)?;
                Ok(RunResult {
                    previewed: Some(block.label()),
                    ..RunResult::default()
                })
            }
            BlockKind::Other => Err(RunError::Unsupported {
                order: block.order(),
            }),
        }
    }

    pub async fn run_project(&self, message: &str) -> Result<RunResult, RunError> {
        let plan = ProjectPlan::from_message(message);
        self.run_plan(&plan).await
    }

    pub async fn run_plan(&self, plan: &ProjectPlan) -> Result<RunResult, RunError> {
        if plan.is_empty() {
            debug!("project has no runnable blocks");
            return Ok(RunResult::ok(NO_OUTPUT));
        }
        let permit = self.acquire().await?;
        let handle = if plan.needs_session() {
            Some(self.ready().await?)
        } else {
            None
        };
        info!(
            "running project: {} step(s), {} script(s)",
            plan.steps().len(),
            plan.script_count()
        );

        let mut transcript = Transcript::new(plan.script_count() > 1);
        let mut previewed = None;
        for step in plan.steps() {
            match step {
                Step::Execute { label, source } => {
                    transcript.header(label);
                    let Some(handle) = handle.as_ref() else {
                        continue;
                    };
                    let captured = match handle.run_captured(&permit, source, label).await {
                        Ok(captured) => captured,
                        Err(err) => {
                            return Ok(stopped(transcript, previewed, label, &err));
                        }
                    };
                    transcript.output(&captured.output);
                    if let Some(err) = captured.error {
                        debug!("project stopped at {label}: {err}");
                        return Ok(RunResult {
                            transcript: transcript.finish(),
                            failed: true,
                            error_text: Some(err.message),
                            previewed,
                        });
                    }
                }
                Step::Preview { label, content } => {
                    self.preview.show(content, label);
                    transcript.preview_marker(label);
                    previewed = Some(label.clone());
                }
            }
        }

        Ok(RunResult {
            transcript: transcript.finish(),
            failed: false,
            error_text: None,
            previewed,
        })
    }

    /// Publishes a markup block without touching the session.
    pub fn show_preview(&self, block: &CodeBlock) -> Result<(), RunError> {
        if block.kind() != BlockKind::Markup {
            return Err(RunError::Unsupported {
                order: block.order(),
            });
        }
        self.preview.show(block.source(), &block.label());
        Ok(())
    }

    pub fn close_preview(&self) {
        self.preview.hide();
    }
}

fn stopped(
    transcript: Transcript,
    previewed: Option<String>,
    label: &str,
    err: &SessionError,
) -> RunResult {
    debug!("project stopped at {label}: {err}");
    RunResult {
        transcript: transcript.finish(),
        failed: true,
        error_text: Some(err.to_string()),
        previewed,
    }
}
