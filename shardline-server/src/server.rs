use crate::config::{Config, ScorerKind};
use crate::watcher::FileConfigSource;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use shardline_core::{
    ConstantLoadScorer, LoadScorer, PlacementRuntime, Result, S3ClientFactory, TopologyEvent,
    TopologyEventKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub runtime: Arc<PlacementRuntime>,
    /// Present when the topology comes from a file that `POST /reload` re-reads.
    pub file_source: Option<Arc<FileConfigSource>>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct NodeView {
    name: String,
    endpoint: String,
    fault_domain: Option<String>,
    weight: u32,
    online: bool,
    load_score: Option<f64>,
    last_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DomainView {
    name: String,
    members: Vec<String>,
    healthy: usize,
    min_healthy: usize,
    accepts_writes: bool,
    active: bool,
    standby: bool,
}

#[derive(Debug, Serialize)]
struct PlacementView {
    key: String,
    targets: Vec<String>,
    candidates: Vec<String>,
    read_node: Option<String>,
    replication_factor: usize,
    write_quorum: usize,
}

#[derive(Debug, Serialize)]
struct DomainPlacementView {
    key: String,
    domain: String,
    node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeDomainRequest {
    domain: String,
}

#[derive(Debug, Serialize)]
struct ChangeDomainResponse {
    node: String,
    previous_domain: Option<String>,
    domain: String,
}

pub async fn run_server(config: Config, config_path: String) -> Result<()> {
    let source = Arc::new(FileConfigSource::new(
        config_path,
        config.topology.clone(),
        Duration::from_secs(config.reload.poll_interval_secs),
    ));

    let factory = S3ClientFactory::builder()
        .connect_timeout(Duration::from_millis(config.client.connect_timeout_ms))
        .request_timeout(Duration::from_millis(config.client.request_timeout_ms))
        .allow_http(config.client.allow_http)
        .build()?;

    let scorer: Option<Arc<dyn LoadScorer>> = match config.health.scorer {
        ScorerKind::Metrics => None,
        ScorerKind::Constant => Some(Arc::new(ConstantLoadScorer::default())),
    };

    let runtime = Arc::new(PlacementRuntime::new(
        source.clone(),
        Arc::new(factory),
        config.health.monitor_config(),
        scorer,
    )?);
    let report = runtime.start().await;
    tracing::info!(
        "Registered {} storage nodes ({} failed)",
        runtime.registry().len(),
        report.failed.len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    {
        let runtime = runtime.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            runtime.run_health(shutdown).await;
        }));
    }
    {
        let runtime = runtime.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            runtime.watch_config(shutdown).await;
        }));
    }
    tasks.push(tokio::spawn(source.clone().run(shutdown_rx.clone())));

    let state = Arc::new(ServerState {
        runtime: runtime.clone(),
        file_source: Some(source),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Admin server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }
    runtime.shutdown().await;

    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
    let _ = shutdown.send(true);
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:name/domain", post(change_node_domain))
        .route("/domains", get(list_domains))
        .route("/placement/:key", get(placement_for_key))
        .route("/placement/:key/domains/:domain", get(placement_in_domain))
        .route("/reload", post(reload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let runtime = &state.runtime;
    let configured = runtime.registry().len();
    let online = runtime.health().online_nodes().len();
    let status = if configured > 0 && online == 0 {
        "unavailable"
    } else if online < configured {
        "degraded"
    } else {
        "ok"
    };

    let response = serde_json::json!({
        "status": status,
        "configured_nodes": configured,
        "online_nodes": online,
        "revision": runtime.placement().snapshot().revision(),
        "time": chrono::Utc::now().to_rfc3339(),
    });

    (StatusCode::OK, Json(response))
}

async fn list_nodes(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let runtime = &state.runtime;
    let nodes: Vec<NodeView> = runtime
        .registry()
        .node_configs()
        .into_iter()
        .map(|config| {
            let status = runtime.health().node_status(&config.name);
            NodeView {
                fault_domain: runtime.placement().node_domain(&config.name),
                name: config.name,
                endpoint: config.endpoint,
                weight: config.weight,
                online: status.online,
                load_score: status.load_score,
                last_error: status.last_error,
            }
        })
        .collect();

    (StatusCode::OK, ApiResponse::ok(nodes))
}

async fn list_domains(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let placement = state.runtime.placement();
    let snapshot = placement.snapshot();

    let domains: Vec<DomainView> = snapshot
        .known_domains()
        .into_iter()
        .map(|name| DomainView {
            members: snapshot.nodes_in_domain(&name),
            healthy: placement.count_healthy_nodes_in_domain(&name),
            min_healthy: snapshot.min_healthy_nodes(&name),
            accepts_writes: snapshot
                .domain_config(&name)
                .map(|config| config.accepts_writes)
                .unwrap_or(true),
            active: snapshot.active_domains().contains(&name),
            standby: snapshot.standby_domain() == Some(name.as_str()),
            name,
        })
        .collect();

    (StatusCode::OK, ApiResponse::ok(domains))
}

async fn placement_for_key(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let placement = state.runtime.placement();
    let candidates = placement.candidate_nodes(&key);

    let view = PlacementView {
        targets: placement.target_nodes(&key),
        read_node: placement.select_best_node_for_read(&candidates),
        candidates,
        replication_factor: placement.replication_factor(),
        write_quorum: placement.write_quorum(),
        key,
    };

    (StatusCode::OK, ApiResponse::ok(view))
}

async fn placement_in_domain(
    State(state): State<Arc<ServerState>>,
    Path((key, domain)): Path<(String, String)>,
) -> Response {
    let placement = state.runtime.placement();
    if placement.nodes_in_domain(&domain).is_empty() {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("fault domain '{}' has no nodes", domain),
        );
    }

    let view = DomainPlacementView {
        node: placement.target_node_in_domain(&key, &domain),
        key,
        domain,
    };
    (StatusCode::OK, ApiResponse::ok(view)).into_response()
}

async fn change_node_domain(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(request): Json<ChangeDomainRequest>,
) -> Response {
    let runtime = &state.runtime;
    let placement = runtime.placement();

    if placement.node_config(&name).is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("node '{}' not found", name));
    }

    let domain = request.domain.trim().to_string();
    let previous_domain = placement.node_domain(&name);
    if !placement.change_node_domain(&name, &domain) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("cannot move node '{}' to fault domain '{}'", name, request.domain),
        );
    }

    if previous_domain.as_deref() != Some(domain.as_str()) {
        runtime.events().publish(TopologyEvent::new(
            name.clone(),
            TopologyEventKind::NodeDomainChanged,
            Some(domain.clone()),
        ));
    }

    let response = ChangeDomainResponse {
        node: name,
        previous_domain,
        domain,
    };
    (StatusCode::OK, ApiResponse::ok(response)).into_response()
}

async fn reload(State(state): State<Arc<ServerState>>) -> Response {
    if let Some(source) = &state.file_source {
        if let Err(e) = source.refresh() {
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    }

    let report = state.runtime.apply_config_change().await;
    (StatusCode::OK, ApiResponse::ok(report)).into_response()
}
