//! Pool Stratum Front-End - Main Entry Point
//!
//! Loads configuration, builds the upstream pool, template engine and
//! backend, then runs the Stratum server alongside its background tasks
//! (template refresh, upstream health checks, backend state heartbeat,
//! difficulty adjustment).

mod config;

use clap::Parser;
use config::{parse_duration, Config};
use log::{error, info};
use poolbackend::{Backend, MemoryBackend};
use poolstratum::{
    DiffAdjustConfig, PermissivePolicy, StratumServer, StratumServerConfig,
};
use pooltemplate::TemplateEngine;
use poolupstream::{UpstreamClient, UpstreamPool};
use std::process;
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments for the pool Stratum front-end.
#[derive(Parser)]
#[clap(name = "poold")]
#[clap(about = "Bitcoin mining pool Stratum front-end")]
struct Cli {
    /// Path to the pool's JSON config file
    #[clap(short, long, value_name = "FILE")]
    config: std::path::PathBuf,

    /// Override the Stratum listen address from the config file
    #[clap(long)]
    stratum_bind: Option<String>,

    /// Verbosity level (0-5)
    #[clap(short, long, default_value = "3")]
    verbosity: u8,
}

fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    info!("Starting pool Stratum front-end");

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            process::exit(1);
        }
    };

    let upstream_check_interval = parse_duration(&config.upstream_check_interval)
        .unwrap_or(Duration::from_secs(30));
    let block_template_interval = parse_duration(&config.proxy.block_template_interval)
        .unwrap_or(Duration::from_secs(5));
    let state_update_interval = parse_duration(&config.proxy.state_update_interval)
        .unwrap_or(Duration::from_secs(10));
    let hashrate_expiration = parse_duration(&config.proxy.hashrate_expiration)
        .unwrap_or(Duration::from_secs(600));
    let diff_adjust_interval = parse_duration(&config.proxy.diff_adjust.adjust_interval)
        .unwrap_or(Duration::from_secs(30));

    let upstream_clients: Vec<Arc<UpstreamClient>> = config
        .upstream
        .iter()
        .map(|u| {
            let timeout = parse_duration(&u.timeout).unwrap_or(Duration::from_secs(10));
            Arc::new(UpstreamClient::new(&u.name, &u.url, timeout))
        })
        .collect();
    if upstream_clients.is_empty() {
        error!("config must list at least one upstream node");
        process::exit(1);
    }
    let upstream_pool = Arc::new(UpstreamPool::new(upstream_clients));

    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let policy = Arc::new(PermissivePolicy);

    let template_engine = Arc::new(TemplateEngine::new(
        upstream_pool.clone(),
        config.coinbase_params(),
        block_template_interval.as_secs(),
    ));

    let stratum_bind = cli
        .stratum_bind
        .as_deref()
        .unwrap_or(&config.proxy.stratum.listen)
        .parse()
        .unwrap_or_else(|e| {
            error!("invalid stratum bind address: {e}");
            process::exit(1);
        });

    let server_config = StratumServerConfig {
        bind_addr: stratum_bind,
        max_connections: config.proxy.stratum.max_conn,
        node_id: config.cluster.node_id,
        initial_diff: config.proxy.difficulty,
        hashrate_expiration_secs: hashrate_expiration.as_secs(),
        diff_adjust: DiffAdjustConfig {
            enabled: config.proxy.diff_adjust.enabled,
            interval: diff_adjust_interval,
            expect_share_count: config.proxy.diff_adjust.expect_share_count,
        },
    };

    let server = StratumServer::new(
        server_config,
        template_engine.clone(),
        upstream_pool.clone(),
        backend.clone(),
        policy,
    );

    let stratum_enabled = config.proxy.stratum.enabled;

    spawn_template_refresh_task(
        server.clone(),
        template_engine.clone(),
        block_template_interval,
        stratum_enabled,
    );
    spawn_upstream_health_task(upstream_pool.clone(), upstream_check_interval);
    spawn_backend_state_task(
        backend,
        template_engine,
        config.cluster.node_name.clone(),
        state_update_interval,
    );

    info!("pool Stratum front-end ready: node={}", config.cluster.node_name);

    if !stratum_enabled {
        info!("Stratum is disabled in config; running background tasks only");
        std::future::pending::<()>().await;
        return;
    }

    if let Err(e) = server.run().await {
        error!("Stratum server terminated: {e}");
        process::exit(1);
    }
}

fn spawn_template_refresh_task(
    server: Arc<StratumServer>,
    template_engine: Arc<TemplateEngine>,
    interval: Duration,
    stratum_enabled: bool,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match template_engine.poll().await {
                Ok(Some(template)) => {
                    if stratum_enabled {
                        server.broadcast(template).await;
                    }
                }
                Ok(None) => {}
                Err(e) => error!("template refresh failed: {e}"),
            }
        }
    });
}

fn spawn_upstream_health_task(upstream_pool: Arc<UpstreamPool>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            upstream_pool.check_upstreams().await;
        }
    });
}

fn spawn_backend_state_task(
    backend: Arc<dyn Backend>,
    template_engine: Arc<TemplateEngine>,
    node_name: String,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Some(template) = template_engine.snapshot() {
                use num_traits::ToPrimitive;
                let difficulty = template.difficulty.to_f64().unwrap_or(0.0);
                if let Err(e) = backend
                    .write_node_state(&node_name, template.height, difficulty)
                    .await
                {
                    error!("backend state heartbeat failed: {e}");
                }
            }
        }
    });
}
