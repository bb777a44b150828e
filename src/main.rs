//! Threatgate - Entry point

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use threatgate::bouncer::{Bouncer, BouncerConfig};
use threatgate::cache::filesystem::FilesystemBackend;
use threatgate::cache::{CacheBackend, CacheStore};
use threatgate::captcha::CaptchaPipeline;
use threatgate::config::{BouncingSettings, CacheSettings, CacheSystem, Config, LapiSettings};
use threatgate::decision::DecisionIndex;
use threatgate::error::{BouncerError, Result};
use threatgate::forwarded::{ForwardedIpResolver, TrustedProxies};
use threatgate::lapi::{self, LapiClient};
use threatgate::proxy::ProxyClient;
use threatgate::resolver::{Resolver, ResolverConfig};
use threatgate::server::Server;
use threatgate::stream::StreamSynchroniser;

#[derive(Parser)]
#[command(name = "threatgate")]
#[command(version, about = "HTTP bouncer backed by a threat-intelligence decision feed")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bouncing reverse proxy
    Serve,
    /// Pull the latest decision diff into the cache
    RefreshCache,
    /// Remove every cached entry
    ClearCache,
    /// Drop expired entries from the filesystem cache
    PruneCache,
}

fn exit_code(err: &BouncerError) -> i32 {
    match err {
        BouncerError::Config(_) => 2,
        BouncerError::Storage(_)
        | BouncerError::CacheVersion(_)
        | BouncerError::Transport(_)
        | BouncerError::Timeout(_)
        | BouncerError::Api { .. } => 3,
        BouncerError::Busy => 4,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(exit_code(&e));
    }
}

fn build_store(cache: &CacheSettings) -> Result<Arc<CacheStore>> {
    let backend: Arc<dyn CacheBackend> = match cache.system {
        CacheSystem::Filesystem => Arc::new(FilesystemBackend::new(cache.fs_cache_path.clone())),
        #[cfg(feature = "redis-storage")]
        CacheSystem::Redis => {
            let dsn = cache
                .redis_dsn
                .as_ref()
                .ok_or_else(|| BouncerError::Config("REDIS_DSN is required".to_string()))?;
            Arc::new(threatgate::cache::redis::RedisBackend::new(dsn)?)
        }
        #[cfg(feature = "memcached-storage")]
        CacheSystem::Memcached => {
            let dsn = cache
                .memcached_dsn
                .as_ref()
                .ok_or_else(|| BouncerError::Config("MEMCACHED_DSN is required".to_string()))?;
            Arc::new(threatgate::cache::memcached::MemcachedBackend::new(dsn)?)
        }
    };
    info!(backend = backend.name(), "Cache store ready");
    Ok(Arc::new(CacheStore::new(backend)))
}

fn build_lapi(settings: &LapiSettings) -> Result<Arc<dyn LapiClient>> {
    lapi::build_client(
        lapi::LapiConfig {
            api_url: settings.api_url.clone(),
            auth: settings.auth.clone(),
            timeout: settings.timeout,
            user_agent: settings.user_agent.clone(),
        },
        settings.use_curl,
    )
}

async fn run(cli: Cli) -> Result<()> {
    // Cache maintenance commands only need the sections they touch.
    let _ = dotenvy::dotenv();

    match cli.command {
        Commands::Serve => {
            let config = Config::from_env()?;
            let store = build_store(&config.cache)?;
            let index = Arc::new(DecisionIndex::new(store.clone()));
            serve(config, store, index).await
        }
        Commands::RefreshCache => {
            let cache = CacheSettings::from_env()?;
            let lapi_settings = LapiSettings::from_env()?;
            let bouncing = BouncingSettings::from_env()?;

            let store = build_store(&cache)?;
            let index = Arc::new(DecisionIndex::new(store));
            let lapi = build_lapi(&lapi_settings)?;
            let sync = StreamSynchroniser::new(index, lapi, bouncing.fallback_remediation);
            let outcome = sync.refresh().await?;
            info!(
                new = outcome.new,
                deleted = outcome.deleted,
                "Cache refreshed"
            );
            Ok(())
        }
        Commands::ClearCache => {
            let store = build_store(&CacheSettings::from_env()?)?;
            store.clear().await?;
            info!("Cache cleared");
            Ok(())
        }
        Commands::PruneCache => {
            let store = build_store(&CacheSettings::from_env()?)?;
            let pruned = store.prune().await?;
            info!(pruned, "Cache pruned");
            Ok(())
        }
    }
}

async fn serve(config: Config, store: Arc<CacheStore>, index: Arc<DecisionIndex>) -> Result<()> {
    info!("Starting Threatgate bouncer");
    info!("Server: {}:{}", config.server.host, config.server.port);
    info!("Upstream: {}", config.proxy.upstream_url);
    info!(
        "Bouncing: stream_mode={}, level={:?}, fallback={}",
        config.bouncing.stream_mode,
        config.bouncing.bouncing_level,
        config.bouncing.fallback_remediation
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| BouncerError::Config(format!("Invalid server address: {e}")))?;

    let lapi = build_lapi(&config.lapi)?;

    if config.geo.enabled {
        // The country scope needs an embedding application to supply a
        // GeoProvider; the standalone driver runs without one.
        warn!(
            provider = config.geo.provider_type,
            "geolocation is enabled but the standalone driver ships no provider; country scope disabled"
        );
    }

    let resolver = Resolver::new(
        index.clone(),
        if config.bouncing.stream_mode {
            None
        } else {
            Some(lapi.clone())
        },
        None,
        ResolverConfig {
            stream_mode: config.bouncing.stream_mode,
            fallback: config.bouncing.fallback_remediation,
            bouncing_level: config.bouncing.bouncing_level,
            max_remediation: config.bouncing.max_remediation_level,
            clean_ip_cache_duration: config.cache.clean_ip_cache_duration,
            bad_ip_cache_duration: config.cache.bad_ip_cache_duration,
            geolocation_enabled: false,
        },
    );

    let captcha = CaptchaPipeline::new(store.clone(), config.cache.captcha_cache_duration);
    let forwarded = ForwardedIpResolver::new(
        TrustedProxies::from_networks(&config.bouncing.trust_ip_forward_array),
        config.bouncing.honour_forwarded,
    );
    let bouncer = Arc::new(Bouncer::new(
        resolver,
        captcha,
        forwarded,
        BouncerConfig {
            excluded_uris: config.bouncing.excluded_uris.clone(),
            forced_test_ip: config.bouncing.forced_test_ip.clone(),
            forced_test_forwarded_ip: config.bouncing.forced_test_forwarded_ip.clone(),
            display_errors: config.bouncing.display_errors,
        },
    ));

    if config.bouncing.stream_mode {
        let sync = StreamSynchroniser::new(
            index.clone(),
            lapi.clone(),
            config.bouncing.fallback_remediation,
        );
        let frequency = config.bouncing.stream_refresh_frequency;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frequency);
            loop {
                ticker.tick().await;
                match sync.refresh().await {
                    Ok(outcome) => info!(
                        new = outcome.new,
                        deleted = outcome.deleted,
                        "Stream refresh cycle"
                    ),
                    Err(e) => warn!(error = %e, "Stream refresh failed"),
                }
            }
        });
    }

    let proxy_client = ProxyClient::new(config.proxy.clone())?;
    let server = Server::bind(addr, bouncer, proxy_client).await?;

    info!("Server listening on {}", server.addr());

    server.run().await
}
