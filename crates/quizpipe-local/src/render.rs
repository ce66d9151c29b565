use quizpipe_core::{
    Error, FetchBackend, FetchRequest, PageRenderer, PageSnapshot, Result, SettleWait,
};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Node.js program driving one headless Chromium session.
///
/// Reads its arguments as JSON on stdin and writes exactly one JSON object to stdout.
/// The browser is closed in `finally`, whatever happened before.
const PLAYWRIGHT_JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message) { ok({ ok: false, error: { code, message } }); }

async function main() {
  let arg = '';
  try { arg = fs.readFileSync(0, 'utf8'); } catch (_) {}
  let req;
  try { req = JSON.parse(arg); } catch (e) { return bad('invalid_params', 'bad JSON args'); }

  let pw;
  try { pw = require('playwright'); } catch (e) {
    return bad('not_configured',
      'Playwright is not installed for Node.js (require("playwright") failed). Install it with `npm i -g playwright` and `npx playwright install chromium`.');
  }

  const url = String(req.url || '').trim();
  if (!url) return bad('invalid_params', 'url must be non-empty');

  const timeoutMs = Number(req.timeout_ms || 30000);
  const settleMs = Number(req.settle_ms || 0);
  const executablePath = String(req.executable_path || '').trim();
  const cdpEndpoint = String(req.cdp_endpoint || '').trim();

  const t0 = Date.now();
  let browser;
  let context;
  try {
    if (cdpEndpoint) {
      browser = await pw.chromium.connectOverCDP(cdpEndpoint);
    } else {
      const launchOpts = {
        headless: true,
        args: ['--no-sandbox', '--disable-dev-shm-usage', '--disable-gpu'],
      };
      if (executablePath) launchOpts.executablePath = executablePath;
      browser = await pw.chromium.launch(launchOpts);
    }
    context = await browser.newContext();
    const page = await context.newPage();
    const resp = await page.goto(url, { waitUntil: 'load', timeout: timeoutMs });
    if (settleMs > 0) await page.waitForTimeout(settleMs);

    const text = await page.evaluate(() => (document.body ? document.body.innerText : ''));
    const html = await page.content();
    ok({
      ok: true,
      final_url: page.url(),
      status: resp ? resp.status() : null,
      text,
      html,
      elapsed_ms: Date.now() - t0,
    });
  } catch (e) {
    bad('render_failed', String(e && e.message ? e.message : e));
  } finally {
    try { if (context) await context.close(); } catch (_) {}
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('render_failed', String(e && e.message ? e.message : e)));
"#;

fn node_path_candidates() -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        out.push(
            home.join(".npm-global")
                .join("lib")
                .join("node_modules")
                .to_string_lossy()
                .to_string(),
        );
    }
    out.push("/opt/homebrew/lib/node_modules".to_string());
    out.push("/usr/local/lib/node_modules".to_string());
    out.push("/usr/lib/node_modules".to_string());
    out
}

/// NODE_PATH value that lets `require('playwright')` find a global install, if one is needed.
fn node_path_for_playwright() -> Option<String> {
    fn has_playwright(node_path: &str) -> bool {
        node_path
            .split(':')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .any(|p| std::path::Path::new(p).join("playwright").is_dir())
    }

    if let Ok(v) = std::env::var("QUIZPIPE_NODE_PATH") {
        let v = v.trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }

    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if has_playwright(&existing) {
        return None;
    }
    let found = node_path_candidates()
        .into_iter()
        .find(|root| has_playwright(root))?;
    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

/// Headless Chromium through Node.js + Playwright, one browser process per call.
#[derive(Clone)]
pub struct PlaywrightRenderer {
    settle: Arc<dyn SettleWait>,
    node_bin: String,
    timeout_ms: u64,
    hard_timeout_ms: Option<u64>,
    executable_path: Option<String>,
    cdp_endpoint: Option<String>,
}

impl std::fmt::Debug for PlaywrightRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaywrightRenderer")
            .field("settle_ms", &self.settle.settle_delay().as_millis())
            .field("node_bin", &self.node_bin)
            .field("timeout_ms", &self.timeout_ms)
            .field("executable_path", &self.executable_path)
            .field("cdp_endpoint", &self.cdp_endpoint.is_some())
            .finish()
    }
}

impl PlaywrightRenderer {
    pub fn new(settle: Arc<dyn SettleWait>) -> Self {
        Self {
            settle,
            node_bin: "node".to_string(),
            timeout_ms: 30_000,
            hard_timeout_ms: None,
            executable_path: None,
            cdp_endpoint: None,
        }
    }

    pub fn with_node_bin(mut self, node_bin: impl Into<String>) -> Self {
        self.node_bin = node_bin.into();
        self
    }

    /// Navigation timeout handed to Playwright.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Wall-clock cap on the whole child process. Defaults to navigation + settle + 10s.
    pub fn with_hard_timeout_ms(mut self, hard_timeout_ms: u64) -> Self {
        self.hard_timeout_ms = Some(hard_timeout_ms);
        self
    }

    /// Chromium binary to launch instead of Playwright's bundled one.
    pub fn with_executable_path(mut self, path: Option<String>) -> Self {
        self.executable_path = path.filter(|s| !s.trim().is_empty());
        self
    }

    /// Attach to an already running browser over CDP instead of launching one.
    pub fn with_cdp_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.cdp_endpoint = endpoint.filter(|s| !s.trim().is_empty());
        self
    }

    fn effective_hard_timeout_ms(&self) -> u64 {
        self.hard_timeout_ms.unwrap_or_else(|| {
            self.timeout_ms
                .saturating_add(self.settle.settle_delay().as_millis() as u64)
                .saturating_add(10_000)
        })
    }

    async fn run_child(&self, args_json: String) -> Result<std::process::Output> {
        let mut cmd = tokio::process::Command::new(&self.node_bin);
        if let Some(node_path) = node_path_for_playwright() {
            cmd.env("NODE_PATH", node_path);
        }
        // kill_on_drop: a cancelled render must not leave a browser process behind.
        let mut child = cmd
            .arg("-e")
            .arg(PLAYWRIGHT_JS)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "rendering requires Node.js (`{}`) and the Playwright npm package: {e}",
                    self.node_bin
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // If this fails the child reports bad args on stdout.
            let _ = stdin.write_all(args_json.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Render("missing stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Render("missing stderr pipe".to_string()))?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
            buf
        });

        let hard_timeout_ms = self.effective_hard_timeout_ms();
        let status =
            match tokio::time::timeout(Duration::from_millis(hard_timeout_ms), child.wait()).await {
                Ok(r) => r.map_err(|e| Error::Render(format!("waiting for renderer: {e}")))?,
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(Error::Render(format!(
                        "renderer hard timeout after {hard_timeout_ms}ms"
                    )));
                }
            };

        Ok(std::process::Output {
            status,
            stdout: stdout_task.await.unwrap_or_default(),
            stderr: stderr_task.await.unwrap_or_default(),
        })
    }
}

/// Turn the renderer program's stdout into a snapshot.
fn parse_render_output(url: &str, stdout: &[u8], stderr: &[u8]) -> Result<PageSnapshot> {
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    let v: serde_json::Value = serde_json::from_str(&stdout).map_err(|e| {
        let stderr = String::from_utf8_lossy(stderr).trim().to_string();
        if stderr.is_empty() {
            Error::Render(format!("renderer returned invalid JSON: {e}"))
        } else {
            Error::Render(format!("renderer returned invalid JSON: {e}. stderr: {stderr}"))
        }
    })?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("render_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("render failed")
            .to_string();
        return Err(match code {
            "not_configured" => Error::NotConfigured(message),
            "invalid_params" => Error::InvalidUrl(message),
            _ => Error::Render(message),
        });
    }

    let text = v.get("text").and_then(|x| x.as_str()).unwrap_or("");
    let html = v.get("html").and_then(|x| x.as_str()).unwrap_or("");
    Ok(PageSnapshot {
        url: url.to_string(),
        visible_text: text.to_string(),
        raw_markup: html.to_string(),
    })
}

#[async_trait::async_trait]
impl PageRenderer for PlaywrightRenderer {
    fn name(&self) -> &'static str {
        "playwright"
    }

    async fn render(&self, url: &str) -> Result<PageSnapshot> {
        let t0 = std::time::Instant::now();
        tracing::info!(url, "rendering page");
        let args_json = serde_json::json!({
            "url": url,
            "timeout_ms": self.timeout_ms,
            "settle_ms": self.settle.settle_delay().as_millis() as u64,
            "executable_path": self.executable_path.clone().unwrap_or_default(),
            "cdp_endpoint": self.cdp_endpoint.clone().unwrap_or_default(),
        })
        .to_string();

        let out = self.run_child(args_json).await?;
        let snapshot = parse_render_output(url, &out.stdout, &out.stderr)?;
        tracing::debug!(
            url,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            text_chars = snapshot.visible_text.chars().count(),
            preview = quizpipe_core::truncate_chars(&snapshot.visible_text, 180),
            "rendered page"
        );
        Ok(snapshot)
    }
}

/// Convert HTML to readable plain text.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

/// Browserless renderer: one GET, text via `html2text`. Scripts never run.
#[derive(Clone)]
pub struct StaticRenderer {
    fetcher: Arc<dyn FetchBackend>,
    timeout_ms: u64,
    width: usize,
}

impl StaticRenderer {
    pub fn new(fetcher: Arc<dyn FetchBackend>) -> Self {
        Self {
            fetcher,
            timeout_ms: 30_000,
            width: 100,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[async_trait::async_trait]
impl PageRenderer for StaticRenderer {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn render(&self, url: &str) -> Result<PageSnapshot> {
        let mut req = FetchRequest::new(url);
        req.timeout_ms = Some(self.timeout_ms);
        let resp = self.fetcher.fetch(&req).await?;
        if !resp.is_success() {
            return Err(Error::Render(format!("HTTP {}", resp.status)));
        }
        let html = resp.text_lossy();
        let text = html_to_text(&html, self.width);
        Ok(PageSnapshot {
            url: url.to_string(),
            visible_text: text,
            raw_markup: html,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use crate::LocalFetcher;
    use axum::{http::header, routing::get, Router};
    use quizpipe_core::{FixedSettle, NoSettle};

    #[test]
    fn parses_successful_render_output() {
        let out = br#"{"ok":true,"final_url":"https://a.test/","status":200,"text":"Cutoff: 7","html":"<html></html>","elapsed_ms":12}"#;
        let snap = parse_render_output("https://a.test/", out, b"").unwrap();
        assert_eq!(snap.url, "https://a.test/");
        assert_eq!(snap.visible_text, "Cutoff: 7");
        assert_eq!(snap.raw_markup, "<html></html>");
    }

    #[test]
    fn maps_render_error_codes() {
        let nc = br#"{"ok":false,"error":{"code":"not_configured","message":"no playwright"}}"#;
        assert!(matches!(
            parse_render_output("u", nc, b""),
            Err(Error::NotConfigured(_))
        ));
        let rf = br#"{"ok":false,"error":{"code":"render_failed","message":"net::ERR"}}"#;
        assert!(matches!(
            parse_render_output("u", rf, b""),
            Err(Error::Render(m)) if m == "net::ERR"
        ));
        let garbage = b"Segmentation fault";
        let err = parse_render_output("u", garbage, b"boom").unwrap_err();
        assert!(err.to_string().contains("stderr: boom"));
    }

    #[test]
    fn hard_timeout_defaults_cover_navigation_and_settle() {
        let r = PlaywrightRenderer::new(Arc::new(FixedSettle::default())).with_timeout_ms(1_000);
        assert_eq!(r.effective_hard_timeout_ms(), 1_000 + 3_000 + 10_000);
        let r = r.with_hard_timeout_ms(50);
        assert_eq!(r.effective_hard_timeout_ms(), 50);
    }

    #[tokio::test]
    async fn missing_node_binary_is_not_configured() {
        let r = PlaywrightRenderer::new(Arc::new(NoSettle))
            .with_node_bin("quizpipe-definitely-not-a-node-binary");
        let err = r.render("https://example.com/").await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_process_plumbing_and_hard_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let write_script = |name: &str, body: &str| {
            let p = tmp.path().join(name);
            std::fs::write(&p, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
            p.to_string_lossy().to_string()
        };

        // Stand-in for node: swallow stdin, print a fixed render result.
        let ok_bin = write_script(
            "fake-node-ok",
            r#"cat >/dev/null
printf '%s' '{"ok":true,"final_url":"x","status":200,"text":"hello","html":"<p>hello</p>"}'"#,
        );
        let r = PlaywrightRenderer::new(Arc::new(NoSettle)).with_node_bin(ok_bin);
        let snap = r.render("https://example.com/").await.unwrap();
        assert_eq!(snap.visible_text, "hello");
        assert_eq!(snap.raw_markup, "<p>hello</p>");

        // A wedged browser is killed at the hard timeout.
        let slow_bin = write_script("fake-node-slow", "exec sleep 30");
        let r = PlaywrightRenderer::new(Arc::new(NoSettle))
            .with_node_bin(slow_bin)
            .with_hard_timeout_ms(200);
        let t0 = std::time::Instant::now();
        let err = r.render("https://example.com/").await.unwrap_err();
        assert!(err.to_string().contains("hard timeout"), "{err}");
        assert!(t0.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn static_renderer_returns_text_and_markup() {
        let app = Router::new()
            .route(
                "/",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "text/html")],
                        "<html><body><p>Cutoff: 12</p></body></html>",
                    )
                }),
            )
            .route(
                "/gone",
                get(|| async { (axum::http::StatusCode::GONE, "gone") }),
            );
        let addr = serve(app).await;
        let r = StaticRenderer::new(Arc::new(LocalFetcher::new().unwrap()));

        let snap = r.render(&format!("http://{addr}/")).await.unwrap();
        assert!(snap.visible_text.contains("Cutoff: 12"));
        assert!(snap.raw_markup.contains("<p>Cutoff: 12</p>"));

        let err = r.render(&format!("http://{addr}/gone")).await.unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }
}
