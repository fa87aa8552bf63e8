//! tempdrop 服务入口。
//!
//! 临时文件投递服务：客户端从终端上传，每个上传都记入持久化账本，受全局上限
//! 与单客户端上限约束，超过保存时长后过期。入口解析配置，对账账本与 Blob 存储，
//! 构建 Axum 路由并运行到收到关闭信号为止。

mod assets;
mod atomic;
mod background;
mod client;
mod config;
mod coordinator;
mod error;
mod handlers;
mod http;
mod ledger;
mod logging;
mod quota;
mod storage;
mod sweeper;
mod throttle;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::background::spawn_background_tasks;
use crate::config::{Args, Settings};
use crate::coordinator::Coordinator;
use crate::http::build_cors_layer;
use crate::ledger::Ledger;
use crate::storage::BlobStore;
use crate::throttle::UploadThrottle;

shadow!(build);

/// 启动服务并阻塞到关闭。
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let settings = Arc::new(Settings::resolve(&args)?);

    let blobs = BlobStore::new(settings.storage_dir.clone());
    blobs.ensure_root().await?;
    let ledger = Ledger::load(settings.ledger_path.clone()).await;
    let coordinator = Arc::new(Coordinator::new(
        ledger,
        blobs,
        settings.limits.clone(),
        settings.lock_timeout,
    ));
    coordinator
        .reconcile()
        .await
        .map_err(|err| io::Error::other(err.to_string()))?;
    let throttle = Arc::new(UploadThrottle::new(settings.rate_limit));

    let accounted = coordinator.current_global_usage().await;
    match coordinator.blobs().scan_usage().await {
        Ok(on_disk) if on_disk != accounted => {
            warn!(accounted, on_disk, "blob sizes on disk differ from the ledger");
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "failed to scan blob store"),
    }

    info!(
        storage_dir = %coordinator.blobs().root_path().display(),
        ledger = %settings.ledger_path.display(),
        global_cap = settings.limits.global_cap_bytes,
        client_cap = settings.limits.client_cap_bytes,
        max_age_secs = settings.limits.max_age.as_secs(),
        policy = ?settings.limits.policy,
        key_mode = ?settings.key_mode,
        "ledger ready"
    );

    let router = app(
        coordinator.clone(),
        throttle.clone(),
        settings.clone(),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(coordinator, throttle, settings);
    tokio::spawn(shutdown_signal(handle));
    server.await?;

    info!("server stopped");
    Ok(())
}

/// 组装路由、中间件与共享状态。
fn app(
    coordinator: Arc<Coordinator>,
    throttle: Arc<UploadThrottle>,
    settings: Arc<Settings>,
    cors_origins: Option<&str>,
) -> Router {
    let app = Router::new()
        .route("/", get(handlers::index))
        .route("/index.html", get(handlers::index))
        .route("/upload.sh", get(assets::serve_upload_script))
        .route("/static/{file}", get(assets::serve_static))
        .route(
            "/upload",
            post(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/clear", post(handlers::clear))
        .route("/token", get(handlers::usage).post(handlers::usage))
        .route("/download/{blob_id}", get(handlers::download))
        .route("/api/status", get(handlers::api_status))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = client::client_ip(request.headers(), connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(coordinator))
        .layer(Extension(throttle))
        .layer(Extension(settings));

    match build_cors_layer(cors_origins) {
        Some(cors_layer) => app.layer(cors_layer),
        None => app,
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
