use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("unknown tag source: {0}")]
    UnknownSource(String),

    #[error("unknown sender role: {0}")]
    UnknownSender(String),

    #[error("unknown ticket status: {0}")]
    UnknownStatus(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("thresholds must lie in [0, 1] (high = {high}, low = {low})")]
    ThresholdRange { high: f64, low: f64 },

    #[error("high threshold {high} must be greater than low threshold {low}")]
    ThresholdOrder { high: f64, low: f64 },

    #[error("adjudicator timeout must be non-zero")]
    ZeroTimeout,
}
