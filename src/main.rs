//! Campbot daemon entry point.

use anyhow::Context as _;
use campbot::badges::BadgeCache;
use campbot::config::Config;
use campbot::kv::RedbKv;
use campbot::llm::{OpenAiChat, ReplyEngine};
use campbot::platform::AdapterDeps;
use campbot::platform::telegram::{TelegramAdapter, TelegramClient};
use campbot::platform::vk::{VkAdapter, VkClient};
use campbot::prompts::PersonaBundle;
use campbot::server::{self, AppState};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "campbot", about = "Webhook auto-responder for camp communities")]
struct Cli {
    /// Address to bind the webhook server to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Override the data directory (otherwise CAMPBOT_DATA_DIR or the
    /// platform data dir).
    #[arg(long)]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> campbot::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "campbot=debug,info" } else { "campbot=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Some(data_dir) = &cli.data_dir {
        // SAFETY: called before any thread reads the environment.
        unsafe { std::env::set_var("CAMPBOT_DATA_DIR", data_dir) };
    }

    let config = Config::load()?;
    tracing::info!(data_dir = %config.data_dir.display(), "starting campbot");

    let kv = Arc::new(RedbKv::open(&config.kv_path())?);
    let badges = Arc::new(BadgeCache::new(
        config.badge_index_path.clone(),
        BadgeCache::DEFAULT_MAX_AGE,
    ));

    let persona = Arc::new(PersonaBundle::default());
    let generator = config.llm.api_key.clone().map(|api_key| {
        Arc::new(OpenAiChat::new(
            api_key,
            config.llm.model.clone(),
            config.llm.proxy_base_url.clone(),
            config.llm.proxy_token.clone(),
        )) as Arc<dyn campbot::llm::ChatGenerator>
    });
    if generator.is_none() {
        tracing::warn!("no API key configured, replies will use fallback texts");
    }
    let engine = Arc::new(ReplyEngine::new(
        generator,
        persona.fallback_unconfigured.clone(),
        persona.fallback_error.clone(),
    ));

    let deps = AdapterDeps { kv, engine, badges, persona };

    let vk_api = config
        .vk
        .access_token
        .clone()
        .map(|token| Arc::new(VkClient::new(token)) as Arc<dyn campbot::platform::vk::WallApi>);
    let tg_api = config.telegram.bot_token.clone().map(|token| {
        Arc::new(TelegramClient::new(token)) as Arc<dyn campbot::platform::telegram::BotApi>
    });

    let state = AppState {
        vk: Arc::new(VkAdapter::new(deps.clone(), config.vk.clone(), vk_api)),
        telegram: Arc::new(TelegramAdapter::new(deps, config.telegram.clone(), tg_api)),
    };

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))
        .map_err(campbot::Error::Other)?;
    tracing::info!(bind = %cli.bind, "webhook server listening");

    server::serve(listener, state).await
}
