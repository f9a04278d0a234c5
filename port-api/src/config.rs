use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    /// Upper bound on the size of an uploaded ports document.
    #[envconfig(from = "MAX_BODY_BYTES", default = "268435456")]
    pub max_body_bytes: usize,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    /// How long a `GET /ports` response may be served from cache when no ingestion clears it.
    #[envconfig(from = "LIST_CACHE_TTL_SECONDS", default = "300")]
    pub list_cache_ttl_seconds: u64,

    #[envconfig(nested = true)]
    pub ingest: port_ingestor::config::Config,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
