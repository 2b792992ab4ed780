#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    /// A user-caused, terminal configuration problem: invalid schedule, missing
    /// Agent, mount-path conflict, cross-namespace denied, invalid context, etc.
    /// Reconcilers surface this as a terminal `Ready=False`/`Failed` condition
    /// and do not requeue.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Out of range: {source}")]
    OutOfRange {
        #[from]
        source: chrono::OutOfRangeError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Invalid cron schedule: {0}")]
    Cron(String),
}

impl Error {
    /// `true` for errors that are the user's fault and should be reported as a
    /// terminal condition rather than retried by the reconcile substrate.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Cron(_))
    }
}

