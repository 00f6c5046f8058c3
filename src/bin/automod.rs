use anyhow::{Context, Result};
use atproto_identity::resolve::{HickoryDnsResolver, InnerIdentityResolver, SharedIdentityResolver};
use automod::{
    capture::{self, RecordFetcher},
    config::{Config, IdentityBackend, create_redis_pool},
    cursor::{
        CursorStore, FileCursorStore, MemoryCursorStore, RedisCursorStore, StreamCursor, StreamId,
        TimestampCursor, run_persist_loop,
    },
    dispatch::{
        ActionDispatcher, ModerationService, OzoneClient, PdsAdminClient, RerouteMode,
        SlackNotifier,
    },
    engine::{RulesetEngine, StaticSets},
    firehose::{FirehoseConfig, FirehoseConsumer},
    http::{DiagnosticsContext, build_router},
    identity::{IdentityDirectory, MemoryDirectory, RedisDirectory, ResolverDirectory},
    metrics::{PrometheusMetricsPublisher, SharedMetricsPublisher, create_metrics_publisher},
    ozone::{OzoneConsumer, OzoneConsumerConfig},
    processor::RulePipeline,
    scheduler::{AutoScaler, RepoScheduler, WorkerPool, run_autoscaler},
    tasks::{spawn_cancellable_task, spawn_managed_task},
};
use clap::{Parser, Subcommand};
use deadpool_redis::Pool as RedisPool;
use std::{env, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

const METRICS_PREFIX: &str = "automod";

#[derive(Parser)]
#[command(name = "automod", about = "Automated moderation for the AT Protocol firehose")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the firehose and apply the ruleset (default)
    Run,
    /// Fetch one record and run it through the rules and dispatcher
    ProcessRecord {
        /// at:// URI of the record
        uri: String,
    },
    /// Fetch an account's recent posts and run each through the rules and dispatcher
    ProcessRecent {
        /// DID or handle
        identifier: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Print an account's identity and recent posts as JSON
    CaptureRecent {
        /// DID or handle
        identifier: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

/// Everything the rule pipeline needs, shared by the daemon and the one-shot commands.
struct Services {
    http: reqwest::Client,
    redis_pool: Option<RedisPool>,
    prometheus: Arc<PrometheusMetricsPublisher>,
    metrics: SharedMetricsPublisher,
    identities: Arc<dyn IdentityDirectory>,
    ozone: Option<Arc<OzoneClient>>,
    dispatcher: Arc<ActionDispatcher>,
    pipeline: Arc<RulePipeline>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let version = automod::config::version()?;

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    let cli = Cli::parse();

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "automod=info,tower_http=info".into()),
    );

    // stdout is reserved for command output
    let fmt_layer = if std::env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    let config = Config::new()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ProcessRecord { uri } => {
            let services = build_services(&config).await?;
            let fetcher = RecordFetcher::new(services.http.clone(), services.identities.clone());
            let report = capture::process_record(&fetcher, &services.pipeline, &uri).await?;
            tracing::info!(
                uri = %uri,
                applied = report.applied,
                dropped = report.dropped,
                "Processed record"
            );
            Ok(())
        }
        Command::ProcessRecent { identifier, limit } => {
            let services = build_services(&config).await?;
            let fetcher = RecordFetcher::new(services.http.clone(), services.identities.clone());
            let report =
                capture::process_recent(&fetcher, &services.pipeline, &identifier, limit).await?;
            tracing::info!(
                identifier = %identifier,
                applied = report.applied,
                dropped = report.dropped,
                "Processed recent posts"
            );
            Ok(())
        }
        Command::CaptureRecent { identifier, limit } => {
            let http = config.http.build()?;
            let redis_pool = config.redis_url.as_deref().map(create_redis_pool).transpose()?;
            let identities = build_identity_directory(&config, &http, redis_pool.as_ref());
            let fetcher = RecordFetcher::new(http, identities);
            let capture = fetcher.capture_recent(&identifier, limit).await?;
            println!("{}", serde_json::to_string_pretty(&capture)?);
            Ok(())
        }
    }
}

fn build_identity_directory(
    config: &Config,
    http: &reqwest::Client,
    redis_pool: Option<&RedisPool>,
) -> Arc<dyn IdentityDirectory> {
    let dns_resolver = HickoryDnsResolver::create_resolver(&[]);
    let base_resolver = Arc::new(SharedIdentityResolver(Arc::new(InnerIdentityResolver {
        dns_resolver: Arc::new(dns_resolver),
        http_client: http.clone(),
        plc_hostname: config.identity.plc_hostname(),
    })));

    let resolver: Arc<dyn IdentityDirectory> = Arc::new(ResolverDirectory::new(
        base_resolver,
        http.clone(),
        &config.identity.appview_host,
        config.identity.plc_rate_limit,
    ));

    match (config.identity.backend, redis_pool) {
        (IdentityBackend::Redis, Some(pool)) => {
            tracing::info!("Using Redis identity directory");
            Arc::new(RedisDirectory::new(
                resolver,
                pool.clone(),
                config.identity.cache_ttl,
                config.identity.negative_ttl,
            ))
        }
        _ => {
            tracing::info!(
                capacity = *config.identity.cache_size.as_ref(),
                "Using in-memory identity directory"
            );
            Arc::new(MemoryDirectory::new(resolver, config.identity.cache_config()))
        }
    }
}

async fn build_services(config: &Config) -> Result<Services> {
    let http = config.http.build()?;

    let redis_pool = match &config.redis_url {
        Some(redis_url) => {
            let pool = create_redis_pool(redis_url)?;
            tracing::info!("Redis pool created successfully");
            Some(pool)
        }
        None => None,
    };

    let prometheus = Arc::new(PrometheusMetricsPublisher::new(METRICS_PREFIX));
    let metrics = create_metrics_publisher(
        prometheus.clone(),
        config.statsd_host.as_deref(),
        METRICS_PREFIX,
    )?;

    let identities = build_identity_directory(config, &http, redis_pool.as_ref());

    let sets = match &config.sets_json_path {
        Some(path) => StaticSets::load(Path::new(path)).await?,
        None => StaticSets::empty_builtin(),
    };
    tracing::info!(sets = sets.len(), "Static sets loaded");

    let engine = RulesetEngine::new(config.ruleset, Arc::new(sets), config.rules.clone())?;
    tracing::info!(
        ruleset = engine.ruleset().as_str(),
        rules = ?engine.rule_names(),
        "Ruleset selected"
    );

    let ozone = config.dispatch.ozone.as_ref().map(|ozone| {
        Arc::new(OzoneClient::new(
            http.clone(),
            &ozone.host,
            ozone.operator_did.as_str(),
            &ozone.admin_token,
        ))
    });

    let mut dispatcher = ActionDispatcher::new(config.dispatch.retry.clone(), metrics.clone());
    if let Some(ozone) = &ozone {
        dispatcher = dispatcher.with_moderation(ozone.clone());
    }
    if let Some(pds) = &config.dispatch.pds {
        dispatcher = dispatcher.with_account_host(Arc::new(PdsAdminClient::new(
            http.clone(),
            &pds.host,
            &pds.admin_token,
        )));
    }
    if config.dispatch.reroute_mode != RerouteMode::Off {
        let destinations: Vec<Arc<dyn ModerationService>> = config
            .dispatch
            .reroute_destinations
            .iter()
            .map(|destination| {
                Arc::new(OzoneClient::new(
                    http.clone(),
                    &destination.host,
                    &destination.did,
                    &destination.token,
                )) as Arc<dyn ModerationService>
            })
            .collect();
        tracing::info!(
            mode = ?config.dispatch.reroute_mode,
            destinations = destinations.len(),
            "Rerouting moderation events"
        );
        dispatcher = dispatcher.with_reroute(config.dispatch.reroute_mode, destinations);
    }
    if let Some(webhook_url) = &config.dispatch.slack_webhook_url {
        dispatcher = dispatcher.with_notifier(Arc::new(SlackNotifier::new(
            http.clone(),
            webhook_url,
        )));
    }
    dispatcher
        .verify_credentials()
        .await
        .context("moderation credentials were not accepted")?;
    let dispatcher = Arc::new(dispatcher);

    let pipeline = Arc::new(RulePipeline::new(
        identities.clone(),
        Arc::new(engine),
        dispatcher.clone(),
        config.identity.lookup_timeout,
        metrics.clone(),
    ));

    Ok(Services {
        http,
        redis_pool,
        prometheus,
        metrics,
        identities,
        ozone,
        dispatcher,
        pipeline,
    })
}

async fn build_cursor_store(
    config: &Config,
    redis_pool: Option<&RedisPool>,
) -> Result<Arc<dyn CursorStore>> {
    if let Some(pool) = redis_pool {
        tracing::info!("Using Redis cursor store");
        return Ok(Arc::new(RedisCursorStore::new(pool.clone())));
    }
    if let Some(path) = &config.cursor_file {
        tracing::info!(path = %path, "Using file cursor store");
        return Ok(Arc::new(FileCursorStore::open(path.as_str()).await?));
    }
    tracing::warn!("No REDIS_URL or CURSOR_FILE configured, cursors will not survive a restart");
    Ok(Arc::new(MemoryCursorStore::new()))
}

async fn run(config: Config) -> Result<()> {
    let services = build_services(&config).await?;
    let metrics = services.metrics.clone();

    let store = build_cursor_store(&config, services.redis_pool.as_ref()).await?;

    let firehose_cursor = Arc::new(StreamCursor::new(
        StreamId::Firehose,
        store.clone(),
        metrics.clone(),
    ));
    firehose_cursor
        .load()
        .await
        .context("failed to load firehose cursor")?;

    let scheduler = RepoScheduler::new(
        config.workers.scheduler.clone(),
        services.pipeline.clone(),
        firehose_cursor.clone(),
        metrics.clone(),
    );
    let pool = WorkerPool::new(scheduler.clone());
    pool.resize(config.workers.initial_workers());

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Setup signal handler
    {
        let signal_token = token.clone();

        tracing::info!("Starting signal handler task");
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                () = signal_token.cancelled() => {
                    tracing::info!("Signal handler task shutting down gracefully");
                },
                _ = terminate => {
                    tracing::info!("Received SIGTERM signal, initiating shutdown");
                },
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C signal, initiating shutdown");
                },
            }

            signal_token.cancel();
        });
    }

    if config.workers.parallelism == 0 {
        spawn_managed_task(
            &tracker,
            token.clone(),
            "autoscaler",
            run_autoscaler(
                pool.clone(),
                AutoScaler::new(config.workers.scaling.clone()),
                config.workers.scale_interval,
                metrics.clone(),
                token.child_token(),
            ),
        );
    } else {
        tracing::info!(workers = config.workers.parallelism, "Fixed worker pool");
    }

    spawn_managed_task(
        &tracker,
        token.clone(),
        "firehose-cursor",
        run_persist_loop(
            firehose_cursor.clone(),
            config.cursor_persist_interval,
            token.child_token(),
        ),
    );

    let ozone_cursor = match &services.ozone {
        Some(client) if services.dispatcher.reroute_mode() != RerouteMode::Off => {
            let cursor = Arc::new(TimestampCursor::new(store.clone()));
            cursor
                .load()
                .await
                .context("failed to load moderation-event cursor")?;

            let consumer = OzoneConsumer::new(
                client.clone(),
                services.dispatcher.clone(),
                cursor.clone(),
                config.dispatch.excluded_creators(),
                OzoneConsumerConfig {
                    poll_interval: config.ozone_poll_interval,
                    ..OzoneConsumerConfig::default()
                },
                metrics.clone(),
            );
            let cancel = token.child_token();
            spawn_managed_task(&tracker, token.clone(), "ozone-consumer", async move {
                consumer.run(cancel).await
            });
            Some(cursor)
        }
        _ => None,
    };

    {
        let consumer = FirehoseConsumer::new(
            FirehoseConfig::new(&config.relay_host, config.firehose_start),
            scheduler.clone(),
            metrics.clone(),
        );
        let cancel = token.child_token();
        spawn_managed_task(&tracker, token.clone(), "firehose-consumer", async move {
            consumer.run(cancel).await
        });
    }

    // Start diagnostics server
    {
        let context = DiagnosticsContext::new(
            &config.version,
            pool.clone(),
            ozone_cursor.clone(),
            services.prometheus.clone(),
        );
        let router = build_router(context);
        let listen = *config.metrics_listen.as_ref();
        let version = config.version.clone();

        spawn_cancellable_task(&tracker, token.clone(), "diagnostics", move |cancel_token| {
            async move {
                let listener = TcpListener::bind(listen)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen, e))?;

                tracing::info!(address = %listen, version = %version, "Diagnostics server listening");

                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        cancel_token.cancelled().await;
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("Diagnostics server error: {}", e))?;

                Ok(())
            }
        });
    }

    token.cancelled().await;
    tracing::info!("Shutting down, draining worker pool");

    let drained = pool.shutdown(config.shutdown_timeout).await;
    metrics
        .incr_with_tags(
            "shutdown",
            &[("drained", if drained { "true" } else { "false" })],
        )
        .await;

    tracker.close();
    tracing::info!("Waiting for all tasks to complete...");
    tracker.wait().await;

    match firehose_cursor.persist().await {
        Ok(Some(seq)) => tracing::info!(seq, "Persisted final firehose cursor"),
        Ok(None) => {}
        Err(e) => tracing::error!(error = ?e, "Failed to persist final firehose cursor"),
    }
    if let Some(cursor) = &ozone_cursor
        && let Err(e) = cursor.persist().await
    {
        tracing::error!(error = ?e, "Failed to persist final moderation-event cursor");
    }

    tracing::info!("All tasks completed, application shutting down");
    Ok(())
}
