//! Headless-browser session layer.
//!
//! Pages here render client-side, so every visit goes through a real Chrome
//! tab. The session hides the CDP plumbing behind [`PageSession`] so the
//! orchestrator stays testable with rendered-HTML fixtures.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Upper bound on any single CDP wait (navigation, element lookup). The
/// worker pool adds its own whole-task timeout above this.
const CDP_TIMEOUT: Duration = Duration::from_secs(30);

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/123.0.0.0 Safari/537.36",
    ]
});

/// Phrases that identify an interstitial or challenge page. Checked
/// lowercased against the rendered HTML.
const BLOCK_PHRASES: &[&str] = &[
    "prove you're not a robot",
    "unusual traffic",
    "automated requests",
    "access denied",
    "hcaptcha",
    "recaptcha",
    "security check",
    "please verify",
    "request blocked",
];

const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 4 });
    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {
        if (parameter === 37445) return 'Intel Inc.';
        if (parameter === 37446) return 'Intel Iris OpenGL Engine';
        return getParameter.apply(this, [parameter]);
    };
    window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
    ['RTCPeerConnection', 'webkitRTCPeerConnection', 'mozRTCPeerConnection', 'msRTCPeerConnection'].forEach(className => {
        if (window[className]) window[className] = undefined;
    });
"#;

/// Scrolls lazily-rendered sections into existence and expands the
/// truncated description before a detail page is read.
const PREPARE_DETAIL_SCRIPT: &str = r#"
    (async () => {
        const step = Math.max(300, Math.floor(document.body.scrollHeight / 8));
        for (let y = 0; y < document.body.scrollHeight; y += step) {
            window.scrollTo(0, y);
            await new Promise(r => setTimeout(r, 150 + Math.random() * 150));
        }
        window.scrollTo(0, 0);
        const expanders = document.querySelectorAll('button[aria-label*="Show more"], button[data-testid*="show-more"]');
        for (const btn of expanders) {
            try { btn.click(); } catch (e) {}
        }
        return 'prepared';
    })();
"#;

/// True when the rendered HTML is a challenge or block interstitial rather
/// than real content.
pub fn looks_blocked(html: &str) -> bool {
    let lowered = html.to_lowercase();
    BLOCK_PHRASES.iter().any(|p| lowered.contains(p))
}

/// One rendered-page session. Everything the orchestrator needs from the
/// browser goes through this seam.
pub trait PageSession: Send + Sync {
    fn navigate(&self, url: &str) -> Result<()>;
    fn content(&self) -> Result<String>;
    fn current_url(&self) -> String;
    /// Run a script in the page, optionally awaiting a returned promise.
    fn evaluate(&self, script: &str, await_promise: bool) -> Result<Option<serde_json::Value>>;
    /// Click the first element matching the selector and wait for the
    /// resulting navigation. `Ok(false)` means no such element exists.
    fn click_and_wait(&self, selector: &str) -> Result<bool>;
    /// Tear down the current tab and start fresh with a new fingerprint.
    fn rotate(&self) -> Result<()>;
    fn save_debug_snapshot(&self, tag: &str);

    /// Scroll out and expand a detail page so deferred sections render.
    fn prepare_detail_page(&self) {
        let _ = self.evaluate(PREPARE_DETAIL_SCRIPT, true);
    }
}

pub struct ChromeSession {
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSession {
    pub fn launch() -> Result<Self> {
        let inner = SessionInner::launch()?;
        Ok(ChromeSession { inner: Mutex::new(inner) })
    }
}

impl SessionInner {
    fn launch() -> Result<Self> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        tracing::debug!(user_agent, "launching browser session");

        let ua_arg = format!("--user-agent={user_agent}");
        let args = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--window-position=0,0"),
            OsStr::new("--ignore-certificate-errors"),
            OsStr::new(&ua_arg),
        ];

        let browser = Browser::new(LaunchOptions {
            headless: true,
            window_size: Some((1920, 1080)),
            args,
            ..Default::default()
        })
        .context("launching chrome")?;

        let tab = browser.new_tab()?;
        tab.set_default_timeout(CDP_TIMEOUT);
        tab.enable_debugger()?;
        tab.call_method(headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument {
            source: STEALTH_SCRIPT.to_string(),
            world_name: None,
            include_command_line_api: None,
            run_immediately: None,
        })?;

        Ok(SessionInner { _browser: browser, tab })
    }
}

impl PageSession for ChromeSession {
    fn navigate(&self, url: &str) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.tab.navigate_to(url)?;
        inner.tab.wait_until_navigated()?;
        // Soft settle for client-side hydration.
        std::thread::sleep(Duration::from_millis(1500));
        Ok(())
    }

    fn content(&self) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        inner.tab.get_content().context("reading page content")
    }

    fn current_url(&self) -> String {
        self.inner.lock().unwrap().tab.get_url()
    }

    fn evaluate(&self, script: &str, await_promise: bool) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.lock().unwrap();
        let result = inner.tab.evaluate(script, await_promise)?;
        Ok(result.value)
    }

    fn click_and_wait(&self, selector: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        let element = match inner.tab.find_element(selector) {
            Ok(el) => el,
            Err(_) => return Ok(false),
        };
        element.click()?;
        inner.tab.wait_until_navigated()?;
        std::thread::sleep(Duration::from_millis(1000));
        Ok(true)
    }

    fn rotate(&self) -> Result<()> {
        let fresh = SessionInner::launch()?;
        *self.inner.lock().unwrap() = fresh;
        Ok(())
    }

    fn save_debug_snapshot(&self, tag: &str) {
        let inner = self.inner.lock().unwrap();
        let dir = Path::new("debug");
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        if let Ok(html) = inner.tab.get_content() {
            let _ = std::fs::write(dir.join(format!("{tag}.html")), &html);
        }
        if let Ok(screenshot) = inner.tab.capture_screenshot(
            headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption::Png,
            None,
            None,
            true,
        ) {
            let _ = std::fs::write(dir.join(format!("{tag}.png")), &screenshot);
        }
    }
}
