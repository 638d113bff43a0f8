use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Operator-facing message channel. The transport (chat service, webhook
/// relay) is an external collaborator; the bot only needs publish, edit,
/// and attach.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a message; the returned handle addresses later edits.
    async fn send(&self, text: &str) -> Result<String>;

    async fn edit(&self, handle: &str, text: &str) -> Result<()>;

    async fn attach(&self, handle: &str, file: &Path) -> Result<()>;
}

/// Logs messages instead of delivering them. Used in tests and when no
/// webhook is configured.
#[derive(Default)]
pub struct LogNotifier {
    counter: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<String> {
        let handle = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!("[notify #{}] {}", handle, text);
        Ok(handle.to_string())
    }

    async fn edit(&self, handle: &str, text: &str) -> Result<()> {
        info!("[notify #{} edit] {}", handle, text);
        Ok(())
    }

    async fn attach(&self, handle: &str, file: &Path) -> Result<()> {
        info!("[notify #{} attach] {}", handle, file.display());
        Ok(())
    }
}

/// Posts messages to a configured webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, text: &str) -> Result<String> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "content": text }))
            .send()
            .await
            .context("posting webhook message")?;
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::json!({}));
        Ok(body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn edit(&self, handle: &str, text: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "edit": handle, "content": text }))
            .send()
            .await
            .context("editing webhook message")?;
        Ok(())
    }

    async fn attach(&self, handle: &str, file: &Path) -> Result<()> {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name);
        let form = reqwest::multipart::Form::new()
            .text("reply_to", handle.to_string())
            .part("file", part);
        self.client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .context("attaching webhook file")?;
        Ok(())
    }
}
