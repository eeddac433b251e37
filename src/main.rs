use clap::{Parser, Subcommand};
use std::sync::Arc;

use okxbot::config::Settings;
use okxbot::db::Store;
use okxbot::decision::{OpenAiEngine, ReasoningEngine};
use okxbot::exchange::{ExchangeGateway, OkxGateway, PaperExchange};
use okxbot::market::{MarketData, OkxMarketData};
use okxbot::models::{SymbolConfig, UserConfig};
use okxbot::pipeline::{Pipeline, PipelineHandle};
use okxbot::Result;

#[derive(Parser)]
#[command(name = "okxbot", about = "Signal-to-execution trading pipeline for OKX spot markets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for all enabled symbols
    Run {
        /// Trade against the in-memory paper exchange instead of OKX
        #[arg(long)]
        paper: bool,
    },
    /// Seed the strategy and symbol configuration rows
    InitConfig {
        /// Comma-separated spot pairs to enable
        #[arg(long, default_value = "BTC-EUR,ETH-EUR")]
        symbols: String,
        /// Portfolio fraction cap per symbol
        #[arg(long, default_value_t = 0.5)]
        max_allocation: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command {
        Command::Run { paper } => run(settings, paper).await,
        Command::InitConfig {
            symbols,
            max_allocation,
        } => init_config(settings, &symbols, max_allocation).await,
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "okxbot=info".into()),
        )
        .init();
}

async fn run(mut settings: Settings, paper: bool) -> Result<()> {
    if paper {
        settings.pipeline.paper_trading = true;
    }

    tracing::info!("🚀 okxbot starting");

    let store = Arc::new(Store::new(&settings.database_url).await?);

    let user_config = match store.active_user_config().await? {
        Some(c) => c,
        None => {
            tracing::warn!("no active strategy config in database, using defaults");
            UserConfig::default()
        }
    };
    let symbol_configs = store.active_symbol_configs().await?;
    if symbol_configs.is_empty() {
        return Err(okxbot::BotError::Config(
            "no enabled symbols; run `okxbot init-config` first".to_string(),
        ));
    }

    let market: Arc<dyn MarketData> = Arc::new(OkxMarketData::new(&settings.okx.base_url));
    let gateway: Arc<dyn ExchangeGateway> = if settings.pipeline.paper_trading {
        tracing::info!("📝 paper trading mode: orders stay in memory");
        Arc::new(PaperExchange::with_market(market.clone()))
    } else {
        if settings.okx.demo_trading {
            tracing::info!("🧪 demo trading mode: orders routed to the OKX sandbox");
        }
        Arc::new(OkxGateway::new(&settings.okx))
    };
    let engine: Arc<dyn ReasoningEngine> = Arc::new(OpenAiEngine::new(
        &settings.openai.base_url,
        settings.openai.api_key.clone(),
        settings.openai.model.clone(),
        settings.openai.timeout_secs,
        settings.openai.max_retries,
    ));

    tracing::info!("📊 Configuration:");
    tracing::info!(
        "  Strategy: EMA {}/{} on {}, RSI({}) confirm on {}, ATR {}x{}",
        user_config.fast_window,
        user_config.slow_window,
        settings.pipeline.bar_interval,
        user_config.confirmation_indicator_window,
        settings.pipeline.confirmation_bar_interval,
        user_config.atr_window,
        user_config.atr_multiplier,
    );
    for symbol in &symbol_configs {
        tracing::info!(
            "  {} (max allocation {:.0}%)",
            symbol.symbol_pair,
            symbol.max_allocation * 100.0
        );
    }

    let pipeline = Arc::new(Pipeline::new(
        store,
        market,
        gateway,
        engine,
        settings.pipeline.clone(),
    ));
    let handle = PipelineHandle::start(pipeline, user_config, symbol_configs).await;

    tracing::info!("✅ all lanes running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.map_err(|e| {
        okxbot::BotError::Config(format!("failed to listen for shutdown signal: {}", e))
    })?;

    tracing::info!("⚠️  shutting down, waiting for in-flight lane iterations");
    for lane in handle.status().await {
        tracing::info!(
            "  {}: {} open trades, last error: {}",
            lane.symbol_pair,
            lane.non_terminal_trades,
            lane.last_error.as_deref().unwrap_or("none"),
        );
    }
    handle.stop_all().await;

    tracing::info!("👋 okxbot stopped");
    Ok(())
}

async fn init_config(settings: Settings, symbols: &str, max_allocation: f64) -> Result<()> {
    let store = Store::new(&settings.database_url).await?;

    let user_config = UserConfig::default();
    let config_id = store.insert_user_config(&user_config).await?;
    tracing::info!(
        config_id,
        "strategy config seeded: EMA {}/{}, RSI({}), ATR {}x{}",
        user_config.fast_window,
        user_config.slow_window,
        user_config.confirmation_indicator_window,
        user_config.atr_window,
        user_config.atr_multiplier,
    );

    for symbol in symbols.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id = store
            .insert_symbol_config(&SymbolConfig {
                id: None,
                symbol_pair: symbol.to_string(),
                max_allocation,
                usage: true,
                added_at: chrono::Utc::now(),
                discontinued_at: None,
            })
            .await?;
        tracing::info!(id, symbol, max_allocation, "symbol enabled");
    }

    Ok(())
}
