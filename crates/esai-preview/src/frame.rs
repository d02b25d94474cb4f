use crate::PreviewTarget;
use serde_json::json;

/// Sandbox tokens granted to the preview iframe. Without `allow-same-origin`
/// the frame runs in an opaque origin: no cookies, no storage, no access to
/// the host page. Without `allow-top-navigation` it cannot navigate away.
pub const FRAME_SANDBOX: &str = "allow-scripts";

/// Applied to the frame document itself, so the sandbox holds even when the
/// document is opened outside the host page.
pub const FRAME_CSP: &str = "sandbox allow-scripts";

pub const PLACEHOLDER_DOCUMENT: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>No preview</title></head>\n<body style=\"font-family: sans-serif; color: #888\"><p>No preview is open.</p></body></html>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolatedFrame {
    pub poll_interval_ms: u64,
}

impl Default for IsolatedFrame {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl IsolatedFrame {
    pub fn frame_headers() -> [(&'static str, &'static str); 4] {
        [
            ("Content-Security-Policy", FRAME_CSP),
            ("Referrer-Policy", "no-referrer"),
            ("Cache-Control", "no-store"),
            ("X-Content-Type-Options", "nosniff"),
        ]
    }

    pub fn frame_document(target: Option<&PreviewTarget>) -> String {
        match target {
            Some(target) => target.content.clone(),
            None => PLACEHOLDER_DOCUMENT.to_string(),
        }
    }

    pub fn status_json(target: Option<&PreviewTarget>, revision: u64) -> String {
        json!({
            "active": target.is_some(),
            "label": target.map(|t| t.label.as_str()),
            "revision": revision,
        })
        .to_string()
    }

    /// Trusted host page. The label is written with `textContent` so
    /// untrusted filenames never reach the host markup.
    pub fn host_page(&self) -> String {
        format!(
            r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>esai preview</title>
<style>
  html, body {{ margin: 0; height: 100%; background: #111; color: #ddd; font-family: sans-serif; }}
  header {{ padding: 0.5rem 1rem; font-size: 0.85rem; border-bottom: 1px solid #333; }}
  iframe {{ border: 0; width: 100%; height: calc(100% - 2.5rem); background: #fff; }}
</style>
</head>
<body>
<header>preview: <span id="label">none</span></header>
<iframe id="frame" sandbox="{sandbox}" referrerpolicy="no-referrer" src="/frame"></iframe>
<script>
  let revision = -1;
  async function poll() {{
    try {{
      const res = await fetch("/status", {{ cache: "no-store" }});
      const status = await res.json();
      if (status.revision !== revision) {{
        revision = status.revision;
        document.getElementById("label").textContent = status.active ? status.label : "none";
        document.getElementById("frame").src = "/frame?rev=" + revision;
      }}
    }} catch (e) {{}}
  }}
  poll();
  setInterval(poll, {poll});
</script>
</body>
</html>
"#,
            sandbox = FRAME_SANDBOX,
            poll = self.poll_interval_ms,
        )
    }
}
