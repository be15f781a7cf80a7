use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sibyl_agent::{ChatRequest, LlmProvider, Message};
use sibyl_social::{Agent, SocialStore};

use crate::error::{Result, SchedulerError};

const POST_PROMPT: &str = "\
You write one social post as the persona below. Pick a fresh topic in the \
persona's lane. Reply with ONLY JSON:
{\"post\": \"the post text, under 500 characters\",
 \"image_prompt\": \"a one-sentence image generation prompt, or null\"}";

/// Minimal contract for the external image service: a prompt in, an opaque
/// URL out. Failures are soft — posts go out without an image.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> std::result::Result<Option<String>, String>;
}

/// Default when no image backend is configured.
pub struct NoopImageGenerator;

#[async_trait]
impl ImageGenerator for NoopImageGenerator {
    async fn generate(&self, _prompt: &str) -> std::result::Result<Option<String>, String> {
        Ok(None)
    }
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub attempted: usize,
    pub posted: usize,
    pub skipped_today: usize,
    pub failed: usize,
}

pub struct AutopostEngine {
    social: Arc<SocialStore>,
    provider: Arc<dyn LlmProvider>,
    images: Arc<dyn ImageGenerator>,
    model: String,
    /// Global kill switch — overrides every per-agent flag.
    enabled: bool,
    /// Pause between agents in a batch.
    delay: Duration,
}

impl AutopostEngine {
    pub fn new(
        social: Arc<SocialStore>,
        provider: Arc<dyn LlmProvider>,
        images: Arc<dyn ImageGenerator>,
        model: String,
        enabled: bool,
        delay: Duration,
    ) -> Self {
        Self {
            social,
            provider,
            images,
            model,
            enabled,
            delay,
        }
    }

    /// Walk every autopost-enabled agent once. Per-agent failures are
    /// logged and counted, never fatal to the batch.
    pub async fn run_batch(&self, now: chrono::DateTime<chrono::Utc>) -> Result<BatchReport> {
        if !self.enabled {
            return Err(SchedulerError::Disabled);
        }

        let candidates = self.social.autopost_candidates()?;
        let mut report = BatchReport::default();

        for (i, agent) in candidates.iter().enumerate() {
            report.attempted += 1;
            if posted_today(agent, now) {
                report.skipped_today += 1;
                continue;
            }
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.post_for(agent, now).await {
                Ok(()) => report.posted += 1,
                Err(e) => {
                    warn!(agent_id = %agent.id, error = %e, "autopost failed for agent");
                    report.failed += 1;
                }
            }
        }

        info!(
            attempted = report.attempted,
            posted = report.posted,
            skipped = report.skipped_today,
            failed = report.failed,
            "autopost batch complete"
        );
        Ok(report)
    }

    async fn post_for(&self, agent: &Agent, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let reply = self
            .provider
            .send(&ChatRequest {
                model: self.model.clone(),
                system: POST_PROMPT.to_string(),
                messages: vec![Message::user(format!(
                    "PERSONA (@{}):\n{}",
                    agent.handle, agent.persona
                ))],
                max_tokens: 512,
                stream: false,
            })
            .await
            .map_err(|e| SchedulerError::Generation(e.to_string()))?;

        let generated: GeneratedPost = parse_json_block(&reply.content)
            .map_err(SchedulerError::Generation)?;

        let image_url = match &generated.image_prompt {
            Some(prompt) if !prompt.trim().is_empty() => {
                match self.images.generate(prompt).await {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(agent_id = %agent.id, error = %e, "image generation failed, posting without image");
                        None
                    }
                }
            }
            _ => None,
        };

        self.social.create_post(
            &agent.id,
            &generated.post,
            generated.image_prompt.as_deref(),
            image_url.as_deref(),
        )?;
        self.social
            .touch_last_auto_post(&agent.id, &now.to_rfc3339())?;
        info!(agent_id = %agent.id, "autopost published");
        Ok(())
    }
}

/// Soft once-per-day guard via `last_auto_post_at` (UTC date).
fn posted_today(agent: &Agent, now: chrono::DateTime<chrono::Utc>) -> bool {
    agent
        .last_auto_post_at
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&chrono::Utc).date_naive() == now.date_naive())
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct GeneratedPost {
    post: String,
    #[serde(default)]
    image_prompt: Option<String>,
}

fn parse_json_block<T: serde::de::DeserializeOwned>(raw: &str) -> std::result::Result<T, String> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use tokio::sync::mpsc;

    use sibyl_agent::{ChatResponse, ProviderError, StreamEvent};

    struct CannedWriter;

    #[async_trait]
    impl LlmProvider for CannedWriter {
        fn name(&self) -> &str {
            "canned"
        }
        async fn send(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: r#"{"post":"Fresh bread at dawn.","image_prompt":"a bakery at sunrise"}"#
                    .into(),
                model: "canned".into(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: String::new(),
            })
        }
        async fn send_stream(
            &self,
            _req: &ChatRequest,
            _tx: mpsc::Sender<StreamEvent>,
        ) -> std::result::Result<(), ProviderError> {
            unreachable!()
        }
    }

    fn social_with_agent(auto_post: bool) -> (Arc<SocialStore>, String) {
        let social = Arc::new(SocialStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let profile = social.create_profile("baker", "Baker", "").unwrap();
        let agent = social
            .create_agent(&profile.id, "baker_ai", "Baker AI", "a friendly baker")
            .unwrap();
        social
            .update_agent(&agent.id, None, None, Some(auto_post))
            .unwrap();
        (social, agent.id)
    }

    fn engine(social: Arc<SocialStore>, enabled: bool) -> AutopostEngine {
        AutopostEngine::new(
            social,
            Arc::new(CannedWriter),
            Arc::new(NoopImageGenerator),
            "model".into(),
            enabled,
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn kill_switch_blocks_batch() {
        let (social, _) = social_with_agent(true);
        let engine = engine(social, false);
        assert!(matches!(
            engine.run_batch(chrono::Utc::now()).await,
            Err(SchedulerError::Disabled)
        ));
    }

    #[tokio::test]
    async fn posts_once_per_day() {
        let (social, agent_id) = social_with_agent(true);
        let engine = engine(social.clone(), true);
        let now = chrono::Utc::now();

        let first = engine.run_batch(now).await.unwrap();
        assert_eq!(first.posted, 1);
        assert_eq!(social.list_posts(&agent_id, 10).unwrap().len(), 1);

        // Same day: skipped.
        let second = engine.run_batch(now).await.unwrap();
        assert_eq!(second.posted, 0);
        assert_eq!(second.skipped_today, 1);

        // Next day: posts again.
        let tomorrow = now + chrono::Duration::days(1);
        let third = engine.run_batch(tomorrow).await.unwrap();
        assert_eq!(third.posted, 1);
        assert_eq!(social.list_posts(&agent_id, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disabled_agents_are_not_candidates() {
        let (social, agent_id) = social_with_agent(false);
        let engine = engine(social.clone(), true);
        let report = engine.run_batch(chrono::Utc::now()).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(social.list_posts(&agent_id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn post_carries_image_prompt() {
        let (social, agent_id) = social_with_agent(true);
        let engine = engine(social.clone(), true);
        engine.run_batch(chrono::Utc::now()).await.unwrap();
        let posts = social.list_posts(&agent_id, 10).unwrap();
        assert_eq!(posts[0].image_prompt.as_deref(), Some("a bakery at sunrise"));
        assert!(posts[0].image_url.is_none());
    }
}
