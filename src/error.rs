use thiserror::Error;

/// Pipeline error taxonomy.
///
/// The retry/degrade policy keys off these variants: `Transient` errors are
/// retried with backoff, `Validation` degrades the decision to a hold,
/// `Invariant` rejects before any exchange call, and `Database` aborts the
/// operation so no order is placed without a durable intent row.
#[derive(Debug, Error)]
pub enum BotError {
    /// Collaborator failure that is expected to clear on retry
    /// (network timeout, rate-limit rejection, 5xx).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed or out-of-bounds data from a collaborator.
    #[error("validation failure: {0}")]
    Validation(String),

    /// A business rule would be violated; nothing was sent to the exchange.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The exchange accepted the request and reported a failure.
    #[error("exchange rejected {symbol}: {reason}")]
    ExchangeRejected { symbol: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BotError {
    /// Whether the error class is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            BotError::Transient(_) => true,
            BotError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BotError::Transient("timeout".into()).is_transient());
        assert!(!BotError::Validation("bad action".into()).is_transient());
        assert!(!BotError::Invariant("open position exists".into()).is_transient());
    }
}
