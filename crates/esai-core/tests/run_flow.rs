use esai_blocks::extract;
use esai_core::{
    BusyPolicy, EngineFactory, ExecutionSession, NO_OUTPUT, RunError, RunResult, Runner,
};
use esai_engine::{EngineError, EngineOptions, ScriptEngine};
use esai_preview::PreviewSlot;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn python_runner() -> Runner<PreviewSlot> {
    let session = Arc::new(ExecutionSession::python(EngineOptions::default()));
    Runner::new(session, PreviewSlot::new())
}

/// Records every executed source; `sleep` blocks the worker for a while.
struct SlowEngine {
    log: Arc<Mutex<Vec<String>>>,
    buffer: String,
}

impl ScriptEngine for SlowEngine {
    fn rebind_output(&mut self) -> Result<(), EngineError> {
        self.buffer.clear();
        Ok(())
    }

    fn execute(&mut self, source: &str, _source_name: &str) -> Result<(), EngineError> {
        if source.contains("sleep") {
            thread::sleep(Duration::from_millis(150));
        }
        self.log
            .lock()
            .expect("log lock should work")
            .push(source.to_string());
        self.buffer.push_str(source);
        Ok(())
    }

    fn drain_output(&mut self) -> Result<String, EngineError> {
        Ok(std::mem::take(&mut self.buffer))
    }
}

fn slow_runner(log: Arc<Mutex<Vec<String>>>, policy: BusyPolicy) -> Runner<PreviewSlot> {
    let factory: EngineFactory = Arc::new(move || {
        Ok(Box::new(SlowEngine {
            log: Arc::clone(&log),
            buffer: String::new(),
        }) as Box<dyn ScriptEngine>)
    });
    Runner::new(Arc::new(ExecutionSession::new(factory)), PreviewSlot::new()).with_policy(policy)
}

#[tokio::test]
async fn single_block_prints_hello() {
    let runner = python_runner();
    let blocks = extract("```python:main.py\nprint(\"hello\")\n```");
    let result = runner
        .run_one(&blocks[0])
        .await
        .expect("run should work");
    assert_eq!(result, RunResult::ok("hello\n"));
}

#[tokio::test]
async fn project_with_two_scripts_adds_headers() {
    let runner = python_runner();
    let message = "Here you go:\n```python:a.py\nprint(\"X\")\n```\nand\n```python:b.py\nprint(\"Y\")\n```\n";
    let result = runner
        .run_project(message)
        .await
        .expect("project should run");
    assert!(!result.failed);
    insta::assert_snapshot!(result.transcript, @r"
    === a.py ===
    X
    === b.py ===
    Y
    ");
}

#[tokio::test]
async fn project_stops_at_first_failure_and_keeps_output() {
    let runner = python_runner();
    let message = "```python:ok.py\nprint(\"ok\")\n```\n```python:bad.py\nraise ValueError(\"bad input\")\n```\n```python:never.py\nprint(\"never\")\n```";
    let result = runner
        .run_project(message)
        .await
        .expect("project should run");
    assert!(result.failed);
    assert_eq!(result.error_text.as_deref(), Some("ValueError: bad input"));
    assert!(result.transcript.contains("ok\n"));
    assert!(!result.transcript.contains("never"));

    let after = runner
        .run_project("```python\nprint('still alive')\n```")
        .await
        .expect("session should stay usable");
    assert_eq!(after.transcript, "still alive\n");
}

#[tokio::test]
async fn globals_carry_over_between_blocks() {
    let runner = python_runner();
    runner
        .run_project("```python\ncounter = 41\n```")
        .await
        .expect("first run should work");
    let result = runner
        .run_project("```python\nprint(counter + 1)\n```")
        .await
        .expect("second run should work");
    assert_eq!(result.transcript, "42\n");
}

#[tokio::test]
async fn markup_is_published_without_touching_the_session() {
    let runner = python_runner();
    let message = "```html:index.html\n<h1>Hi</h1>\n```";
    let result = runner
        .run_project(message)
        .await
        .expect("project should run");

    assert_eq!(result.transcript, "[preview opened: index.html]\n");
    assert_eq!(result.previewed.as_deref(), Some("index.html"));
    let target = runner
        .preview_sink()
        .current()
        .expect("preview should be open");
    assert_eq!(target.content, "<h1>Hi</h1>");
    assert_eq!(
        runner.session().state(),
        esai_core::SessionState::Uninitialized
    );

    runner.close_preview();
    assert!(!runner.preview_sink().is_active());
}

#[tokio::test]
async fn single_markup_block_opens_preview_with_empty_transcript() {
    let runner = python_runner();
    let blocks = extract("```html\n<h1>hi</h1>\n```");
    let result = runner
        .run_one(&blocks[0])
        .await
        .expect("markup should run");

    assert_eq!(result.transcript, "");
    assert!(!result.failed);
    assert_eq!(result.previewed.as_deref(), Some("markup block #0"));
    let target = runner
        .preview_sink()
        .current()
        .expect("preview should be open");
    assert_eq!(target.content, "<h1>hi</h1>");
    assert_eq!(
        runner.session().state(),
        esai_core::SessionState::Uninitialized
    );
}

#[tokio::test]
async fn last_markup_block_wins() {
    let runner = python_runner();
    let message = "```html:one.html\n<p>1</p>\n```\n```html:two.html\n<p>2</p>\n```";
    let result = runner
        .run_project(message)
        .await
        .expect("project should run");
    assert_eq!(result.previewed.as_deref(), Some("two.html"));
    assert_eq!(
        runner.preview_sink().current().map(|t| t.label),
        Some("two.html".to_string())
    );
}

#[tokio::test]
async fn reply_without_runnable_blocks_reports_sentinel() {
    let runner = python_runner();
    let result = runner
        .run_project("```rust\nfn main() {}\n```\nplain text")
        .await
        .expect("project should run");
    assert_eq!(result.transcript, NO_OUTPUT);
    assert_eq!(
        runner.session().state(),
        esai_core::SessionState::Uninitialized
    );
}

#[tokio::test]
async fn reply_without_runnable_blocks_does_not_wait_for_the_gate() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let runner = slow_runner(Arc::clone(&log), BusyPolicy::Reject);
    let _permit = runner
        .session()
        .acquire(BusyPolicy::Reject)
        .await
        .expect("gate is free");

    let result = runner
        .run_project("just prose, no fences")
        .await
        .expect("nothing to run is never busy");
    assert_eq!(result, RunResult::ok(NO_OUTPUT));
    assert!(log.lock().expect("log lock should work").is_empty());
}

#[tokio::test]
async fn other_blocks_are_unsupported_for_run_one() {
    let runner = python_runner();
    let blocks = extract("text\n```sql\nselect 1;\n```");
    let err = runner
        .run_one(&blocks[0])
        .await
        .expect_err("sql is not runnable");
    assert_eq!(err, RunError::Unsupported { order: 0 });
}

#[tokio::test]
async fn concurrent_run_is_rejected_while_busy() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let runner = slow_runner(Arc::clone(&log), BusyPolicy::Reject);
    let blocks = extract("```python\nsleep\n```\n```python\nquick\n```");

    let first = {
        let runner = runner.clone();
        let block = blocks[0].clone();
        tokio::spawn(async move { runner.run_one(&block).await })
    };
    while !runner.session().is_busy() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = runner
        .run_one(&blocks[1])
        .await
        .expect_err("second run should be rejected");
    assert_eq!(err, RunError::Busy);

    first
        .await
        .expect("task should join")
        .expect("first run should finish");
    assert_eq!(*log.lock().expect("log lock should work"), vec!["sleep"]);
}

#[tokio::test]
async fn queued_runs_never_interleave() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let runner = slow_runner(Arc::clone(&log), BusyPolicy::Queue);

    let first = {
        let runner = runner.clone();
        tokio::spawn(async move {
            runner
                .run_project("```python\nsleep-a\n```\n```python\nsleep-b\n```")
                .await
        })
    };
    while !runner.session().is_busy() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let second = runner
        .run_project("```python\nafter\n```")
        .await
        .expect("queued run should be admitted");
    assert_eq!(second.transcript, "after");

    first
        .await
        .expect("task should join")
        .expect("first project should finish");
    assert_eq!(
        *log.lock().expect("log lock should work"),
        vec!["sleep-a", "sleep-b", "after"]
    );
}
