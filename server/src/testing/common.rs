use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use google_gmail1::api::{Message, MessagePart, MessagePartBody, MessagePartHeader};
use uuid::Uuid;

use crate::{
    auth::credentials::CredentialProvider,
    email::source::{MessagePage, MessageSource, MessageSourceFactory},
    error::{AppError, AppResult},
    model::{
        cancellation_action::CancellationAction,
        repository::{InMemoryRepository, Repository},
        scan_session::ScanSession,
        subscription::Subscription,
        user::UserAccount,
    },
    prompt::GenerativeProvider,
    server_config::{CancellationConfig, ScanConfig},
    state::cancellation::browser::{BrowserHost, BrowserSession},
};

/// Serve `router` on an ephemeral local port, returns the base url
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn body_part(mime_type: &str, body: &str) -> MessagePart {
    MessagePart {
        mime_type: Some(mime_type.to_string()),
        body: Some(MessagePartBody {
            data: Some(body.as_bytes().to_vec()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn multipart(mime_type: &str, parts: Vec<MessagePart>) -> MessagePart {
    MessagePart {
        mime_type: Some(mime_type.to_string()),
        parts: Some(parts),
        ..Default::default()
    }
}

/// FULL-format message with From and Subject headers on `payload`
pub fn gmail_message(id: &str, from: &str, subject: &str, mut payload: MessagePart) -> Message {
    let mut headers = payload.headers.take().unwrap_or_default();
    headers.push(MessagePartHeader {
        name: Some("From".to_string()),
        value: Some(from.to_string()),
    });
    headers.push(MessagePartHeader {
        name: Some("Subject".to_string()),
        value: Some(subject.to_string()),
    });
    payload.headers = Some(headers);

    Message {
        id: Some(id.to_string()),
        thread_id: Some(format!("t-{id}")),
        internal_date: Some(Utc::now().timestamp_millis()),
        snippet: Some(subject.to_string()),
        payload: Some(payload),
        ..Default::default()
    }
}

pub fn test_scan_config() -> ScanConfig {
    ScanConfig {
        search_query: "subscription OR receipt".to_string(),
        page_size: 100,
        batch_size: 10,
        batch_pause_ms: 1,
        fetch_timeout_secs: 5,
        checkpoint_every: 100,
        default_lookback_years: 3,
    }
}

pub fn test_cancellation_config() -> CancellationConfig {
    CancellationConfig {
        request_timeout_secs: 5,
        max_retries: 3,
        retry_backoff_ms: 1,
        monitoring_window_days: 7,
        monitor_interval_secs: 3600,
        monitor_max_results: 20,
        browser_timeout_secs: 5,
        browser_selector_timeout_ms: 10,
        browser_settle_ms: 1,
        browser_enabled: false,
        browser_executable: None,
    }
}

fn copy_error(e: &AppError) -> AppError {
    match e {
        AppError::Auth(s) => AppError::Auth(s.clone()),
        AppError::RateLimit(s) => AppError::RateLimit(s.clone()),
        AppError::Provider(s) => AppError::Provider(s.clone()),
        AppError::Schema(s) => AppError::Schema(s.clone()),
        AppError::Timeout(s) => AppError::Timeout(s.clone()),
        AppError::UpstreamFetch(s) => AppError::UpstreamFetch(s.clone()),
        other => AppError::Internal(anyhow::anyhow!("{}", other)),
    }
}

/// In-memory mailbox. Ignores the query; pages are offsets into insertion order.
#[derive(Default)]
pub struct FakeMessageSource {
    messages: Mutex<Vec<(String, Option<Message>)>>,
    queries: Mutex<Vec<String>>,
    listing_budget: Mutex<Option<usize>>,
}

impl FakeMessageSource {
    pub fn add(&self, msg: Message) {
        let id = msg.id.clone().unwrap_or_default();
        self.messages.lock().unwrap().push((id, Some(msg)));
    }

    /// Listed but fails to fetch
    pub fn add_missing(&self, id: &str) {
        self.messages.lock().unwrap().push((id.to_string(), None));
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Listing succeeds `n` more times, then fails with `UpstreamFetch`
    pub fn fail_listing_after(&self, n: usize) {
        *self.listing_budget.lock().unwrap() = Some(n);
    }
}

#[async_trait]
impl MessageSource for FakeMessageSource {
    async fn list_message_ids(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> AppResult<MessagePage> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(budget) = self.listing_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(AppError::UpstreamFetch("listing unavailable".to_string()));
            }
            *budget -= 1;
        }

        let messages = self.messages.lock().unwrap();
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + page_size.max(1) as usize).min(messages.len());
        let ids = messages
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        Ok(MessagePage {
            ids,
            next_page_token: (end < messages.len()).then(|| end.to_string()),
            result_size_estimate: messages.len() as u64,
        })
    }

    async fn fetch_message(&self, id: &str) -> AppResult<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|(mid, _)| mid == id)
            .and_then(|(_, msg)| msg.clone())
            .ok_or_else(|| AppError::UpstreamFetch(format!("message {id} not found")))
    }
}

pub struct FakeSourceFactory {
    source: Arc<FakeMessageSource>,
}

impl FakeSourceFactory {
    pub fn new(source: Arc<FakeMessageSource>) -> Self {
        Self { source }
    }
}

impl MessageSourceFactory for FakeSourceFactory {
    fn for_access_token(&self, _access_token: &str) -> Arc<dyn MessageSource> {
        self.source.clone()
    }
}

pub struct FakeProvider {
    reply: Result<String, AppError>,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn replying(reply: String) -> Self {
        Self {
            reply: Ok(reply),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: AppError) -> Self {
        Self {
            reply: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeProvider for FakeProvider {
    async fn complete(&self, _prompt: &str, _max_tokens: u32, _temperature: f64) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Ok(reply) => Ok(reply.clone()),
            Err(e) => Err(copy_error(e)),
        }
    }
}

#[derive(Default)]
pub struct FakeCredentials {
    revoked: bool,
    calls: AtomicUsize,
}

impl FakeCredentials {
    pub fn revoked() -> Self {
        Self {
            revoked: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn refresh(&self, refresh_token: &str) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.revoked {
            return Err(AppError::Auth("Token has been expired or revoked.".to_string()));
        }
        Ok(format!("access-for-{refresh_token}"))
    }
}

/// Scripted browser: a fixed set of selectors are present and every page
/// shows the same text
pub struct FakeBrowser {
    present: HashSet<String>,
    page_text: String,
    crash: bool,
    clicked: Arc<Mutex<Vec<String>>>,
}

impl FakeBrowser {
    pub fn new(present: &[&str], page_text: &str) -> Self {
        Self {
            present: present.iter().map(|s| s.to_string()).collect(),
            page_text: page_text.to_string(),
            crash: false,
            clicked: Arc::default(),
        }
    }

    pub fn crashing() -> Self {
        Self {
            crash: true,
            ..Self::new(&[], "")
        }
    }

    pub fn clicked(&self) -> Vec<String> {
        self.clicked.lock().unwrap().clone()
    }
}

struct FakeBrowserSession {
    present: HashSet<String>,
    page_text: String,
    clicked: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BrowserHost for FakeBrowser {
    async fn open(&self, _url: &str) -> AppResult<Box<dyn BrowserSession>> {
        if self.crash {
            return Err(AppError::Automation("browser process exited".to_string()));
        }
        Ok(Box::new(FakeBrowserSession {
            present: self.present.clone(),
            page_text: self.page_text.clone(),
            clicked: self.clicked.clone(),
        }))
    }
}

#[async_trait]
impl BrowserSession for FakeBrowserSession {
    async fn click(&mut self, selector: &str, _wait: Duration) -> AppResult<bool> {
        if !self.present.contains(selector) {
            return Ok(false);
        }
        self.clicked.lock().unwrap().push(selector.to_string());
        Ok(true)
    }

    async fn page_text(&mut self) -> AppResult<String> {
        Ok(self.page_text.clone())
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}

/// In-memory repository that stalls before every subscription and action
/// read, so writers that overlap actually interleave
pub struct SlowRepository {
    inner: InMemoryRepository,
    read_delay: Duration,
}

impl SlowRepository {
    pub fn new(read_delay: Duration) -> Self {
        Self {
            inner: InMemoryRepository::new(),
            read_delay,
        }
    }

    async fn stall(&self) {
        tokio::time::sleep(self.read_delay).await;
    }
}

#[async_trait]
impl Repository for SlowRepository {
    async fn upsert_user(&self, user: &UserAccount) -> AppResult<()> {
        self.inner.upsert_user(user).await
    }

    async fn get_user(&self, user_id: Uuid) -> AppResult<UserAccount> {
        self.inner.get_user(user_id).await
    }

    async fn record_scan_summary(&self, user_id: Uuid, scanned_at: DateTime<Utc>) -> AppResult<()> {
        self.inner.record_scan_summary(user_id, scanned_at).await
    }

    async fn insert_scan_session(&self, session: &ScanSession) -> AppResult<()> {
        self.inner.insert_scan_session(session).await
    }

    async fn get_scan_session(&self, session_id: Uuid) -> AppResult<ScanSession> {
        self.inner.get_scan_session(session_id).await
    }

    async fn update_scan_session(&self, session: &ScanSession) -> AppResult<()> {
        self.inner.update_scan_session(session).await
    }

    async fn find_open_subscription(
        &self,
        user_id: Uuid,
        normalized_name: &str,
    ) -> AppResult<Option<Subscription>> {
        self.stall().await;
        self.inner.find_open_subscription(user_id, normalized_name).await
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> AppResult<()> {
        self.inner.insert_subscription(subscription).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> AppResult<()> {
        self.inner.update_subscription(subscription).await
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> AppResult<Subscription> {
        self.stall().await;
        self.inner.get_subscription(subscription_id).await
    }

    async fn list_subscriptions(&self, user_id: Uuid) -> AppResult<Vec<Subscription>> {
        self.inner.list_subscriptions(user_id).await
    }

    async fn insert_cancellation_action(&self, action: &CancellationAction) -> AppResult<()> {
        self.inner.insert_cancellation_action(action).await
    }

    async fn update_cancellation_action(&self, action: &CancellationAction) -> AppResult<()> {
        self.inner.update_cancellation_action(action).await
    }

    async fn get_cancellation_action(&self, action_id: Uuid) -> AppResult<CancellationAction> {
        self.stall().await;
        self.inner.get_cancellation_action(action_id).await
    }

    async fn find_active_action(
        &self,
        subscription_id: Uuid,
    ) -> AppResult<Option<CancellationAction>> {
        self.stall().await;
        self.inner.find_active_action(subscription_id).await
    }

    async fn list_awaiting_confirmation(&self) -> AppResult<Vec<CancellationAction>> {
        self.inner.list_awaiting_confirmation().await
    }
}
