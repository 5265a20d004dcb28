use std::{process, sync::Arc, time::Duration};

use abovefold::{
    application::{
        error::AppError,
        generator::{CriticalCssGenerator, GeneratorOptions},
        maintenance::{GenerateReport, MaintenanceError, MaintenanceService},
        site::SiteDirectory,
    },
    cache::{
        ArtifactStore, CacheGateKeeper, CriticalCssState, GateConfig, RegenerationPlanner,
        RegenerationQueue, RegenerationTrigger, ViewportClassifier,
    },
    config,
    infra::{
        error::InfraError,
        extractor::CommandExtractor,
        fetch::{AssetMapping, HttpHtmlFetcher},
        http::{self, AdminState, ProxyState},
        sitemap::SiteMapDirectory,
        telemetry,
    },
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Generate(args) => run_generate(settings, args).await,
        config::Command::Clear(_) => run_clear(settings),
    }
}

struct GenerationContext {
    store: Arc<ArtifactStore>,
    generator: Arc<CriticalCssGenerator>,
    directory: Arc<dyn SiteDirectory>,
}

fn build_generation_context(settings: &config::Settings) -> Result<GenerationContext, AppError> {
    let store = Arc::new(build_store(settings));

    let assets = AssetMapping::new(
        settings.assets.public_url.clone(),
        settings.assets.root_dir.clone(),
    );
    let fetcher = HttpHtmlFetcher::new(assets, settings.extractor.timeout)?;
    let extractor = CommandExtractor::new(settings.extractor.bin.clone());

    let generator = Arc::new(CriticalCssGenerator::new(
        Arc::clone(&store),
        settings.viewports.clone(),
        Arc::new(fetcher),
        Arc::new(extractor),
        GeneratorOptions {
            ignore: settings.extractor.ignore.clone(),
            timeout: settings.extractor.timeout,
        },
    ));

    let directory: Arc<dyn SiteDirectory> = Arc::new(SiteMapDirectory::from_file(
        settings.site.map_file.clone(),
        settings.site.base_url.clone(),
    ));

    Ok(GenerationContext {
        store,
        generator,
        directory,
    })
}

fn build_store(settings: &config::Settings) -> ArtifactStore {
    ArtifactStore::new(
        settings.storage.directory.clone(),
        settings.viewports.classes(),
        settings.storage.pretend,
    )
}

async fn run_generate(
    settings: config::Settings,
    args: config::GenerateArgs,
) -> Result<(), AppError> {
    let context = build_generation_context(&settings)?;
    if context.store.is_pretend() {
        warn!(
            target = "abovefold::generate",
            "pretend mode enabled; nothing generated"
        );
        return Ok(());
    }

    let concurrency = args.concurrency.clamp(1, 32);
    let service = MaintenanceService::new(
        context.generator,
        context.directory,
        settings.site.base_url.clone(),
        concurrency,
    );

    let report = service.generate(args.uri.as_deref()).await?;
    log_generate_report(&report);
    Ok(())
}

fn log_generate_report(report: &GenerateReport) {
    for failure in &report.failures {
        let viewport = failure
            .viewport
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "all".to_string());
        if failure.warning {
            warn!(
                target = "abovefold::generate",
                url = %failure.url,
                viewport = %viewport,
                reason = failure.reason,
                detail = %failure.message,
                "critical CSS not generated"
            );
        } else {
            error!(
                target = "abovefold::generate",
                url = %failure.url,
                viewport = %viewport,
                reason = failure.reason,
                detail = %failure.message,
                "critical CSS generation failed"
            );
        }
    }

    info!(
        target = "abovefold::generate",
        urls = report.urls,
        written = report.written,
        skipped = report.skipped,
        failed = report.failures.len(),
        "generate finished"
    );
}

fn run_clear(settings: config::Settings) -> Result<(), AppError> {
    let store = build_store(&settings);
    store.clear(None).map_err(MaintenanceError::from)?;
    info!(
        target = "abovefold::clear",
        directory = %store.root().display(),
        "critical CSS store cleared"
    );
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let context = build_generation_context(&settings)?;
    settings
        .viewports
        .validate(&ViewportClassifier::new().classes())
        .map_err(MaintenanceError::from)?;
    if !context.store.is_pretend() {
        context
            .store
            .ensure_root_exists()
            .map_err(MaintenanceError::from)?;
    }

    let (queue, worker) = RegenerationQueue::spawn(
        Arc::clone(&context.generator),
        settings.queue.concurrency.get() as usize,
        settings.queue.capacity.get() as usize,
    );
    let trigger = Arc::new(RegenerationTrigger::new(
        RegenerationPlanner::new(Arc::clone(&context.directory)),
        Arc::clone(&context.store),
        queue.clone(),
    ));

    let critical_css = CriticalCssState {
        store: Arc::clone(&context.store),
        gate: Arc::new(CacheGateKeeper::new(GateConfig::from(&settings.marker))),
        classifier: ViewportClassifier::new(),
        site_base: settings.site.base_url.clone(),
    };
    let proxy = ProxyState {
        client: reqwest::Client::builder()
            .user_agent(HttpHtmlFetcher::user_agent())
            .timeout(settings.extractor.timeout)
            .build()
            .map_err(InfraError::from)?,
        upstream: settings.site.upstream_url.clone(),
    };
    let admin = AdminState {
        trigger,
        store: Arc::clone(&context.store),
        site_base: settings.site.base_url.clone(),
    };

    let result = serve_http(&settings, proxy, critical_css, admin).await;

    drain_queue(queue, settings.server.graceful_shutdown).await;
    worker.abort();
    let _ = worker.await;

    result
}

async fn serve_http(
    settings: &config::Settings,
    proxy: ProxyState,
    critical_css: CriticalCssState,
    admin: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_router(proxy, critical_css);
    let admin_router = http::build_admin_router(admin);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "abovefold::serve",
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        upstream = %settings.site.upstream_url,
        "listening"
    );

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    try_join!(public_server, admin_server)
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(target = "abovefold::serve", "shutdown signal received");
}

/// Give in-flight regeneration a bounded chance to finish.
async fn drain_queue(queue: RegenerationQueue, grace: Duration) {
    let pending = queue.pending();
    if pending == 0 {
        return;
    }
    info!(
        target = "abovefold::serve",
        pending,
        grace_secs = grace.as_secs(),
        "waiting for regeneration queue"
    );
    if tokio::time::timeout(grace, queue.wait_idle()).await.is_err() {
        warn!(
            target = "abovefold::serve",
            pending = queue.pending(),
            "regeneration queue not drained before shutdown"
        );
    }
}
