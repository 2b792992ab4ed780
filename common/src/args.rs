use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Address the HTTP server binds to.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Maximum accepted request body size, in bytes.
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 1_048_576)]
    pub max_body_bytes: usize,

    /// Namespace the process watches; empty means cluster-wide.
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,
}

impl ServerArgs {
    pub fn watch_namespace(&self) -> Option<&str> {
        if self.watch_namespace.is_empty() {
            None
        } else {
            Some(&self.watch_namespace)
        }
    }
}
