use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use dashmap::DashMap;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sibyl_agent::{
    anthropic::AnthropicProvider, openai::OpenAiProvider, ContextComposer, CrossEncoderReranker,
    IntelligenceLogger, LlmProvider, MemoryExtractor, Responder, Summarizer,
};
use sibyl_conversations::{ConversationStore, ListCache};
use sibyl_core::config::SibylConfig;
use sibyl_knowledge::{KnowledgeStore, LexicalReranker, Reranker, Retriever};
use sibyl_memory::MemoryStore;
use sibyl_orchestrator::{
    CanonicalStore, DecisionLog, EscalationStore, MetricsReader, Orchestrator, QualityStore,
    SignalComputer,
};
use sibyl_scheduler::{AutopostEngine, NoopImageGenerator};
use sibyl_social::SocialStore;
use sibyl_vector::{Embedder, HttpEmbedder, LocalHashEmbedder, VectorStore};

use crate::auth::AuthCache;
use crate::ratelimit::RateLimiter;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: SibylConfig,
    pub auth: AuthCache,
    pub limiter: RateLimiter,
    pub social: Arc<SocialStore>,
    pub conversations: Arc<ConversationStore>,
    pub list_cache: ListCache,
    pub vectors: Arc<VectorStore>,
    pub knowledge: Arc<KnowledgeStore>,
    pub memories: Arc<MemoryStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub escalations: Arc<EscalationStore>,
    pub canonical: Arc<CanonicalStore>,
    pub decisions: DecisionLog,
    pub metrics: MetricsReader,
    pub quality: Arc<QualityStore>,
    pub composer: Arc<ContextComposer>,
    pub responder: Arc<Responder>,
    pub extractor: Arc<MemoryExtractor>,
    pub intelligence: Arc<IntelligenceLogger>,
    pub summarizer: Arc<Summarizer>,
    pub autopost: Arc<AutopostEngine>,
    /// In-flight response streams by conversation id. The cancel route
    /// fires these tokens; the turn pipeline registers and clears entries.
    pub active_streams: DashMap<String, CancellationToken>,
}

impl AppState {
    /// Wire every subsystem over the configured database. Each store gets
    /// its own connection except the chat domain (conversations, decisions,
    /// escalations, canonical answers, quality), which shares one so turn
    /// writes can be transactional.
    pub fn bootstrap(config: SibylConfig) -> anyhow::Result<Arc<Self>> {
        let db_path = config.database.path.clone();
        if let Some(parent) = Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let open = || -> anyhow::Result<Connection> { Ok(Connection::open(&db_path)?) };

        // Provider stack. Anthropic is preferred for generation; the
        // OpenAI-compatible endpoint serves embeddings (and generation when
        // Anthropic is absent).
        let provider: Arc<dyn LlmProvider> = match (&config.providers.anthropic, &config.providers.openai) {
            (Some(anthropic), _) => Arc::new(AnthropicProvider::new(
                anthropic.api_key.clone(),
                Some(anthropic.base_url.clone()),
            )),
            (None, Some(openai)) => Arc::new(OpenAiProvider::new(
                openai.api_key.clone(),
                Some(openai.base_url.clone()),
            )),
            (None, None) => {
                warn!("no LLM provider configured; generation will fail until one is set");
                Arc::new(OpenAiProvider::new(String::new(), None))
            }
        };

        let embedder: Arc<dyn Embedder> = match &config.providers.openai {
            Some(openai) => Arc::new(HttpEmbedder::new(
                &openai.base_url,
                &openai.api_key,
                &config.model.embedding,
                config.vector.dim,
                Duration::from_millis(config.vector.embed_timeout_ms),
            )),
            None => {
                warn!("no embedding provider configured; using local hash embeddings");
                Arc::new(LocalHashEmbedder::new(config.vector.dim))
            }
        };

        let vectors = Arc::new(VectorStore::new(open()?, config.vector.dim)?);
        let social = Arc::new(SocialStore::new(open()?)?);
        let knowledge = Arc::new(KnowledgeStore::new(open()?, embedder.clone(), vectors.clone())?);
        let memories = Arc::new(MemoryStore::new(open()?, embedder.clone(), vectors.clone())?);

        let chat_conn = Arc::new(Mutex::new(open()?));
        let conversations = Arc::new(ConversationStore::new(chat_conn.clone())?);
        let escalations = Arc::new(EscalationStore::new(chat_conn.clone())?);
        let canonical = Arc::new(CanonicalStore::new(
            chat_conn.clone(),
            embedder.clone(),
            vectors.clone(),
        )?);
        let decisions = DecisionLog::new(chat_conn.clone())?;
        let quality = Arc::new(QualityStore::new(chat_conn.clone())?);
        let metrics = MetricsReader::new(chat_conn.clone());

        let judge_model = config.model.judge_model().to_string();
        let reranker: Arc<dyn Reranker> = if config.providers.anthropic.is_some()
            || config.providers.openai.is_some()
        {
            Arc::new(CrossEncoderReranker::new(provider.clone(), judge_model.clone()))
        } else {
            Arc::new(LexicalReranker)
        };
        let retriever = Arc::new(Retriever::new(
            embedder.clone(),
            vectors.clone(),
            knowledge.clone(),
            reranker,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            chat_conn,
            SignalComputer::new(embedder.clone(), vectors.clone()),
            conversations.clone(),
            escalations.clone(),
            canonical.clone(),
        ));

        let composer = Arc::new(ContextComposer::new(
            embedder.clone(),
            retriever,
            memories.clone(),
            conversations.clone(),
            config.chat.context_budget_tokens,
        ));
        let responder = Arc::new(Responder::new(
            provider.clone(),
            conversations.clone(),
            config.model.generation.clone(),
            Duration::from_millis(config.chat.first_token_timeout_ms),
            Duration::from_millis(config.chat.total_timeout_ms),
        ));
        let extractor = Arc::new(MemoryExtractor::new(
            provider.clone(),
            memories.clone(),
            conversations.clone(),
            judge_model.clone(),
        ));
        let intelligence = Arc::new(IntelligenceLogger::new(
            provider.clone(),
            quality.clone(),
            conversations.clone(),
            judge_model,
        ));
        let summarizer = Arc::new(Summarizer::new(
            provider.clone(),
            conversations.clone(),
            config.model.generation.clone(),
        ));
        let autopost = Arc::new(AutopostEngine::new(
            social.clone(),
            provider,
            Arc::new(NoopImageGenerator),
            config.model.generation.clone(),
            config.autopost.enabled,
            Duration::from_secs(config.autopost.delay_seconds),
        ));

        info!(db = %db_path, dim = config.vector.dim, "sibyl state ready");
        Ok(Arc::new(Self {
            auth: AuthCache::new(config.auth.clone()),
            limiter: RateLimiter::new(),
            list_cache: ListCache::with_default_ttl(),
            config,
            social,
            conversations,
            vectors,
            knowledge,
            memories,
            orchestrator,
            escalations,
            canonical,
            decisions,
            metrics,
            quality,
            composer,
            responder,
            extractor,
            intelligence,
            summarizer,
            autopost,
            active_streams: DashMap::new(),
        }))
    }

    /// Flush in-memory state. Called on graceful shutdown — in-flight
    /// streams are cancelled so their partials get persisted.
    pub fn teardown(&self) {
        for entry in self.active_streams.iter() {
            entry.value().cancel();
        }
        self.active_streams.clear();
        self.list_cache.clear();
        self.auth.clear();
        self.limiter.clear();
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        // social
        .route("/profiles", post(crate::http::social::create_profile))
        .route(
            "/profiles/{id}",
            get(crate::http::social::get_profile)
                .put(crate::http::social::update_profile)
                .delete(crate::http::social::delete_profile),
        )
        .route(
            "/profiles/{id}/follow",
            post(crate::http::social::follow).delete(crate::http::social::unfollow),
        )
        .route("/agents", post(crate::http::social::create_agent))
        .route(
            "/agents/{id}",
            get(crate::http::social::get_agent).put(crate::http::social::update_agent),
        )
        .route("/agents/{id}/posts", get(crate::http::social::list_posts))
        // knowledge
        .route(
            "/agents/{id}/documents",
            post(crate::http::knowledge::ingest_document)
                .get(crate::http::knowledge::list_documents),
        )
        .route(
            "/agents/{id}/documents/{document_id}",
            delete(crate::http::knowledge::delete_document),
        )
        .route("/agents/{id}/memories", get(crate::http::knowledge::list_memories))
        .route(
            "/agents/{id}/canonical",
            post(crate::http::knowledge::seed_canonical)
                .get(crate::http::knowledge::list_canonical),
        )
        // orchestrator
        .route(
            "/orchestrator/message",
            post(crate::http::orchestrator::route_message),
        )
        .route("/orchestrator/queue", get(crate::http::orchestrator::queue))
        .route(
            "/orchestrator/queue/{id}/accept",
            post(crate::http::orchestrator::accept),
        )
        .route(
            "/orchestrator/queue/{id}/answer",
            post(crate::http::orchestrator::answer),
        )
        .route(
            "/orchestrator/queue/{id}/decline",
            post(crate::http::orchestrator::decline),
        )
        .route(
            "/orchestrator/config/{agent_id}",
            get(crate::http::orchestrator::get_config).put(crate::http::orchestrator::put_config),
        )
        .route(
            "/orchestrator/metrics/{agent_id}",
            get(crate::http::orchestrator::agent_metrics),
        )
        // messaging
        .route(
            "/messaging/conversations",
            get(crate::http::messaging::list_conversations),
        )
        .route(
            "/messaging/conversations/{id}/messages",
            post(crate::http::messaging::send_message).get(crate::http::messaging::list_messages),
        )
        .route(
            "/messaging/conversations/{id}/stream",
            post(crate::http::messaging::stream_message),
        )
        .route(
            "/messaging/conversations/{id}/read",
            post(crate::http::messaging::mark_read),
        )
        .route(
            "/messaging/conversations/{id}/cancel",
            post(crate::http::messaging::cancel_stream),
        )
        // scheduled
        .route(
            "/scheduled/trigger-autopost",
            post(crate::http::scheduled::trigger_autopost),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
