//! Scripted browser seam for form-based cancellations

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    detection::patterns,
    error::{AppError, AppResult},
    server_config::CancellationConfig,
    util::with_timeout,
};

/// Controls tried in priority order; the first one present is clicked
pub const CANCEL_CONTROL_SELECTORS: [&str; 5] = [
    r#"button:has-text("Cancel")"#,
    r#"button:has-text("Unsubscribe")"#,
    r#"button:has-text("Confirm")"#,
    r#"input[type="submit"][value*="cancel"]"#,
    r#"a:has-text("Cancel Subscription")"#,
];

#[async_trait]
pub trait BrowserHost: Send + Sync {
    async fn open(&self, url: &str) -> AppResult<Box<dyn BrowserSession>>;
}

#[async_trait]
pub trait BrowserSession: Send {
    /// Click `selector` if it shows up within `wait`; `false` when it never did
    async fn click(&mut self, selector: &str, wait: Duration) -> AppResult<bool>;
    async fn page_text(&mut self) -> AppResult<String>;
    async fn close(self: Box<Self>) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormOutcome {
    Cancelled { clicked: &'static str },
    NoControl,
    NoSuccessPhrase { clicked: &'static str },
}

#[derive(Debug, Clone)]
pub struct FormTimings {
    pub overall: Duration,
    pub per_selector: Duration,
    pub settle: Duration,
}

impl From<&CancellationConfig> for FormTimings {
    fn from(cfg: &CancellationConfig) -> Self {
        FormTimings {
            overall: cfg.browser_timeout(),
            per_selector: cfg.browser_selector_timeout(),
            settle: cfg.browser_settle(),
        }
    }
}

/// Open `url`, click the first cancel control and look for a success phrase.
/// Any browser error is an `AppError::Automation`.
pub async fn run_form_flow(
    host: &dyn BrowserHost,
    url: &str,
    timings: &FormTimings,
) -> AppResult<FormOutcome> {
    with_timeout("browser session", timings.overall, async {
        let mut session = host.open(url).await.map_err(as_automation)?;
        let outcome = drive(session.as_mut(), timings).await;
        if let Err(e) = session.close().await {
            tracing::warn!("Failed to close browser session: {}", e);
        }
        outcome
    })
    .await
}

async fn drive(session: &mut dyn BrowserSession, timings: &FormTimings) -> AppResult<FormOutcome> {
    for selector in CANCEL_CONTROL_SELECTORS {
        if session
            .click(selector, timings.per_selector)
            .await
            .map_err(as_automation)?
        {
            tokio::time::sleep(timings.settle).await;
            let text = session.page_text().await.map_err(as_automation)?;
            return Ok(if patterns::matches_success_phrase(&text) {
                FormOutcome::Cancelled { clicked: selector }
            } else {
                FormOutcome::NoSuccessPhrase { clicked: selector }
            });
        }
    }
    Ok(FormOutcome::NoControl)
}

fn as_automation(e: AppError) -> AppError {
    match e {
        AppError::Automation(_) => e,
        other => AppError::Automation(other.to_string()),
    }
}
