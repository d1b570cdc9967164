//! Headless Chromium behind the browser seam, driven over CDP

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::time::Instant;

use crate::{
    error::{AppError, AppResult},
    server_config::CancellationConfig,
};

use super::browser::{BrowserHost, BrowserSession};

const SELECTOR_POLL: Duration = Duration::from_millis(100);

const LAUNCH_ARGS: [&str; 5] = [
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-extensions",
    "--disable-infobars",
    "--no-first-run",
];

const CHROME_PATHS: [&str; 6] = [
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Configured binary, then `CHROME_BIN`, then the usual install paths.
/// `None` leaves the lookup to chromiumoxide.
pub fn find_chrome_binary(configured: Option<&str>) -> Option<PathBuf> {
    configured
        .map(str::to_string)
        .into_iter()
        .chain(std::env::var("CHROME_BIN").ok())
        .chain(CHROME_PATHS.iter().map(|p| p.to_string()))
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// Split a `tag:has-text("...")` selector into its CSS part and the text the
/// element must contain
pub fn split_has_text(selector: &str) -> (&str, Option<&str>) {
    match selector.split_once(":has-text(\"") {
        Some((css, rest)) => match rest.strip_suffix("\")") {
            Some(text) => (css, Some(text)),
            None => (selector, None),
        },
        None => (selector, None),
    }
}

/// Script that clicks the first element matching `selector` and returns
/// whether it found one. Text matching is case-insensitive.
pub fn click_script(selector: &str) -> AppResult<String> {
    let (css, text) = split_has_text(selector);
    let css_json = serde_json::to_string(css)?;
    let text_json = serde_json::to_string(&text)?;
    Ok(format!(
        r#"(() => {{
            const css = {css_json};
            const text = {text_json};
            const el = Array.from(document.querySelectorAll(css)).find((e) =>
                text === null ||
                (e.innerText || e.value || "").toLowerCase().includes(text.toLowerCase()));
            if (!el) return false;
            try {{
                el.scrollIntoView({{ block: "center", inline: "center", behavior: "instant" }});
            }} catch (_e) {{}}
            el.click();
            return true;
        }})()"#
    ))
}

fn automation(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::Automation(format!("{context}: {e}"))
}

pub struct ChromiumBrowserHost {
    browser: Browser,
    handler_alive: Arc<AtomicBool>,
}

impl ChromiumBrowserHost {
    pub async fn launch(cfg: &CancellationConfig) -> AppResult<Self> {
        let mut args: Vec<String> = LAUNCH_ARGS.iter().map(|a| a.to_string()).collect();
        if std::env::var("CI").is_ok() || std::env::var("NO_SANDBOX").is_ok() {
            args.push("--no-sandbox".to_string());
        }

        let mut builder = BrowserConfig::builder().args(args);
        match find_chrome_binary(cfg.browser_executable.as_deref()) {
            Some(bin) => {
                tracing::info!("Using Chromium binary {:?}", bin);
                builder = builder.chrome_executable(bin);
            }
            None => tracing::warn!("No Chromium binary found on the usual paths"),
        }
        let config = builder
            .build()
            .map_err(|e| automation("Invalid browser config", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| automation("Failed to launch Chromium", e))?;

        let handler_alive = Arc::new(AtomicBool::new(true));
        let alive = handler_alive.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            alive.store(false, Ordering::SeqCst);
            tracing::warn!("Chromium event loop exited");
        });

        Ok(Self {
            browser,
            handler_alive,
        })
    }
}

#[async_trait]
impl BrowserHost for ChromiumBrowserHost {
    async fn open(&self, url: &str) -> AppResult<Box<dyn BrowserSession>> {
        if !self.handler_alive.load(Ordering::SeqCst) {
            return Err(AppError::Automation(
                "Chromium connection is gone".to_string(),
            ));
        }

        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| automation("Failed to open page", e))?;
        let navigated = page.wait_for_navigation().await.map(|_| ());
        if let Err(e) = navigated {
            if let Err(close_err) = page.close().await {
                tracing::warn!("Failed to close page: {}", close_err);
            }
            return Err(automation(&format!("Failed to load {url}"), e));
        }
        Ok(Box::new(ChromiumSession { page }))
    }
}

struct ChromiumSession {
    page: Page,
}

impl ChromiumSession {
    async fn evaluate<T: serde::de::DeserializeOwned>(&self, script: &str) -> AppResult<T> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| automation("Script evaluation failed", e))?
            .into_value::<T>()
            .map_err(|e| automation("Script result did not decode", e))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn click(&mut self, selector: &str, wait: Duration) -> AppResult<bool> {
        let script = click_script(selector)?;
        let deadline = Instant::now() + wait;
        loop {
            if self.evaluate::<bool>(&script).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(SELECTOR_POLL.min(deadline - now)).await;
        }
    }

    async fn page_text(&mut self) -> AppResult<String> {
        self.evaluate("document.body ? document.body.innerText : \"\"")
            .await
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        self.page
            .close()
            .await
            .map_err(|e| automation("Failed to close page", e))
    }
}
