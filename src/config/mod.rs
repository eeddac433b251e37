// Layered runtime configuration: built-in defaults < optional config file
// < environment. Strategy parameters (EMA windows, allocations) live in the
// database instead and are loaded per lane at startup.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::BotError;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub okx: OkxSettings,
    pub openai: OpenAiSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OkxSettings {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
    /// Routes orders to the OKX demo-trading environment.
    pub demo_trading: bool,
    pub max_requests_per_second: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Bar interval for the fast timeframe, OKX notation ("1H", "4H", "1D").
    pub bar_interval: String,
    /// Bar interval used for the confirmation indicator.
    pub confirmation_bar_interval: String,
    pub detector_interval_secs: u64,
    pub monitor_interval_secs: u64,
    /// Outer bound on one reasoning-engine evaluation, including the
    /// engine's own retries. Expired evaluations degrade to hold.
    pub decision_timeout_secs: u64,
    pub entry_fill_timeout_secs: u64,
    /// Non-terminal trades older than this are flagged for manual review.
    pub staleness_hours: i64,
    /// Decisions with risk_score above this are rejected before sizing.
    pub risk_ceiling: f64,
    /// Dry-run mode swaps the OKX gateway for the paper exchange.
    pub paper_trading: bool,
}

impl Settings {
    /// Load configuration. Precedence: defaults, then `okxbot.toml` if
    /// present, then `OKXBOT__`-prefixed environment variables, then the
    /// bare `DATABASE_URL` / `OKX_*` / `OPENAI_API_KEY` variables the
    /// deployment scripts already export.
    pub fn load() -> Result<Self, BotError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder()
            .set_default("database_url", "postgres://localhost/okxbot")?
            .set_default("okx.base_url", "https://www.okx.com")?
            .set_default("okx.api_key", "")?
            .set_default("okx.api_secret", "")?
            .set_default("okx.passphrase", "")?
            .set_default("okx.demo_trading", true)?
            .set_default("okx.max_requests_per_second", 5)?
            .set_default("openai.base_url", "https://api.openai.com")?
            .set_default("openai.api_key", "")?
            .set_default("openai.model", "gpt-4o-mini")?
            .set_default("openai.timeout_secs", 30)?
            .set_default("openai.max_retries", 3)?
            .set_default("pipeline.bar_interval", "1H")?
            .set_default("pipeline.confirmation_bar_interval", "4H")?
            .set_default("pipeline.detector_interval_secs", 60)?
            .set_default("pipeline.monitor_interval_secs", 15)?
            .set_default("pipeline.decision_timeout_secs", 120)?
            .set_default("pipeline.entry_fill_timeout_secs", 300)?
            .set_default("pipeline.staleness_hours", 24)?
            .set_default("pipeline.risk_ceiling", 0.8)?
            .set_default("pipeline.paper_trading", false)?
            .add_source(File::with_name("okxbot").required(false))
            .add_source(Environment::with_prefix("OKXBOT").separator("__"));

        // Flat variables win over everything: these are what ops sets.
        for (var, key) in [
            ("DATABASE_URL", "database_url"),
            ("OKX_API_KEY", "okx.api_key"),
            ("OKX_API_SECRET", "okx.api_secret"),
            ("OKX_PASSPHRASE", "okx.passphrase"),
            ("OPENAI_API_KEY", "openai.api_key"),
        ] {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), BotError> {
        if self.database_url.is_empty() {
            return Err(BotError::Config("database_url must be set".to_string()));
        }
        if self.pipeline.decision_timeout_secs == 0 {
            return Err(BotError::Config(
                "pipeline.decision_timeout_secs must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pipeline.risk_ceiling) {
            return Err(BotError::Config(format!(
                "pipeline.risk_ceiling must be in [0,1], got {}",
                self.pipeline.risk_ceiling
            )));
        }
        if !self.pipeline.paper_trading
            && (self.okx.api_key.is_empty() || self.okx.api_secret.is_empty())
        {
            return Err(BotError::Config(
                "OKX credentials required unless pipeline.paper_trading is set".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            database_url: "postgres://localhost/okxbot_test".to_string(),
            okx: OkxSettings {
                base_url: "https://www.okx.com".to_string(),
                api_key: String::new(),
                api_secret: String::new(),
                passphrase: String::new(),
                demo_trading: true,
                max_requests_per_second: 5,
            },
            openai: OpenAiSettings {
                base_url: "https://api.openai.com".to_string(),
                api_key: String::new(),
                model: "gpt-4o-mini".to_string(),
                timeout_secs: 30,
                max_retries: 3,
            },
            pipeline: PipelineSettings {
                bar_interval: "1H".to_string(),
                confirmation_bar_interval: "4H".to_string(),
                detector_interval_secs: 60,
                monitor_interval_secs: 15,
                decision_timeout_secs: 120,
                entry_fill_timeout_secs: 300,
                staleness_hours: 24,
                risk_ceiling: 0.8,
                paper_trading: true,
            },
        }
    }

    #[test]
    fn test_paper_trading_needs_no_credentials() {
        let settings = base_settings();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_live_trading_requires_credentials() {
        let mut settings = base_settings();
        settings.pipeline.paper_trading = false;
        assert!(settings.validate().is_err());

        settings.okx.api_key = "key".to_string();
        settings.okx.api_secret = "secret".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_decision_timeout_is_its_own_setting() {
        // A fast detector cadence must not shrink the reasoning budget.
        let mut settings = base_settings();
        settings.pipeline.detector_interval_secs = 5;
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pipeline.decision_timeout_secs, 120);

        settings.pipeline.decision_timeout_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_risk_ceiling_bounds() {
        let mut settings = base_settings();
        settings.pipeline.risk_ceiling = 1.4;
        assert!(settings.validate().is_err());
    }
}
