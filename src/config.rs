use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    /// Base64 keyset for field encryption. Read from OPENLANE_TINK_KEYSET.
    pub keyset: Option<String>,
    /// Base64 PKCS#8 Ed25519 signing key. Ephemeral key is generated when unset.
    pub signing_key: Option<String>,
    pub signing_kid: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub refresh_overlap: Duration,
    pub clock_skew: Duration,
    /// Remote JWKS endpoint. When unset tokens are verified with local keys.
    pub jwks_url: Option<String>,
    pub jwks_min_refresh: Duration,
    /// How long a recorded SSO authorization stays valid. Zero accepts any entry.
    pub sso_freshness: Duration,
    pub request_timeout: Duration,
    pub http_timeout: Duration,
    pub provider_specs_path: Option<String>,
    pub pool_max_size: usize,
    pub pool_ttl: Duration,
    pub feature_ttl: Duration,
    pub cookie_secure: bool,
    /// Externally reachable base URL, used for OAuth redirect URIs.
    pub public_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "postgres://localhost/gatehouse".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            keyset: None,
            signing_key: None,
            signing_kid: None,
            issuer: "http://localhost:8080".into(),
            audience: "http://localhost:8080".into(),
            access_ttl: Duration::from_secs(60 * 60),
            refresh_ttl: Duration::from_secs(2 * 60 * 60),
            refresh_overlap: Duration::from_secs(15 * 60),
            clock_skew: Duration::from_secs(30),
            jwks_url: None,
            jwks_min_refresh: Duration::from_secs(5 * 60),
            sso_freshness: Duration::from_secs(24 * 60 * 60),
            request_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            provider_specs_path: None,
            pool_max_size: 4,
            pool_ttl: Duration::from_secs(5 * 60),
            feature_ttl: Duration::from_secs(5 * 60),
            cookie_secure: true,
            public_url: "http://localhost:8080".into(),
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    let defaults = Config::default();

    let cfg = Config {
        port: parse_env("GATEHOUSE_PORT").unwrap_or(defaults.port),
        database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
        keyset: non_empty_env("OPENLANE_TINK_KEYSET"),
        signing_key: non_empty_env("GATEHOUSE_SIGNING_KEY"),
        signing_kid: non_empty_env("GATEHOUSE_SIGNING_KID"),
        issuer: std::env::var("GATEHOUSE_ISSUER").unwrap_or(defaults.issuer),
        audience: std::env::var("GATEHOUSE_AUDIENCE").unwrap_or(defaults.audience),
        access_ttl: secs_env("GATEHOUSE_ACCESS_TTL_SECS").unwrap_or(defaults.access_ttl),
        refresh_ttl: secs_env("GATEHOUSE_REFRESH_TTL_SECS").unwrap_or(defaults.refresh_ttl),
        refresh_overlap: secs_env("GATEHOUSE_REFRESH_OVERLAP_SECS")
            .unwrap_or(defaults.refresh_overlap),
        clock_skew: secs_env("GATEHOUSE_CLOCK_SKEW_SECS").unwrap_or(defaults.clock_skew),
        jwks_url: non_empty_env("GATEHOUSE_JWKS_URL"),
        jwks_min_refresh: secs_env("GATEHOUSE_JWKS_MIN_REFRESH_SECS")
            .unwrap_or(defaults.jwks_min_refresh),
        sso_freshness: secs_env("GATEHOUSE_SSO_FRESHNESS_SECS").unwrap_or(defaults.sso_freshness),
        request_timeout: secs_env("GATEHOUSE_REQUEST_TIMEOUT_SECS")
            .unwrap_or(defaults.request_timeout),
        http_timeout: secs_env("GATEHOUSE_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout),
        provider_specs_path: non_empty_env("GATEHOUSE_PROVIDER_SPECS"),
        pool_max_size: parse_env("GATEHOUSE_POOL_MAX_SIZE").unwrap_or(defaults.pool_max_size),
        pool_ttl: secs_env("GATEHOUSE_POOL_TTL_SECS").unwrap_or(defaults.pool_ttl),
        feature_ttl: secs_env("GATEHOUSE_FEATURE_TTL_SECS").unwrap_or(defaults.feature_ttl),
        cookie_secure: parse_env("GATEHOUSE_COOKIE_SECURE").unwrap_or(defaults.cookie_secure),
        public_url: std::env::var("GATEHOUSE_PUBLIC_URL").unwrap_or(defaults.public_url),
    };

    if cfg.refresh_overlap >= cfg.access_ttl {
        anyhow::bail!(
            "GATEHOUSE_REFRESH_OVERLAP_SECS ({}s) must be shorter than the access token TTL ({}s)",
            cfg.refresh_overlap.as_secs(),
            cfg.access_ttl.as_secs()
        );
    }
    if cfg.pool_max_size == 0 {
        anyhow::bail!("GATEHOUSE_POOL_MAX_SIZE must be at least 1");
    }

    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn secs_env(key: &str) -> Option<Duration> {
    parse_env::<u64>(key).map(Duration::from_secs)
}
