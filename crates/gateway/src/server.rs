use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::State,
        middleware,
        response::{IntoResponse, Json},
        routing::{delete, get, post, put},
    },
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
    wagate_bridge::BridgeClient,
    wagate_config::{CredentialBackend, WagateConfig},
    wagate_sessions::{
        CredentialStore, FileCredentialStore, HttpWebhookDispatcher, ManagerOptions,
        SessionManager, SledCredentialStore, SqliteMessageStats, SqliteTenantDirectory,
    },
};

use crate::{
    auth::{self, ResolvedAuth},
    routes,
    state::GatewayState,
};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route(
            "/sessions",
            post(routes::create_session).get(routes::list_sessions),
        )
        .route("/sessions/{id}/status", get(routes::session_status))
        .route("/sessions/{id}/messages", post(routes::send_message))
        .route("/sessions/{id}/messages/bulk", post(routes::send_bulk))
        .route("/instances", post(routes::register_instance))
        .route(
            "/instances/{key}/session",
            delete(routes::disconnect_instance),
        )
        .route("/instances/{key}/webhook", put(routes::set_webhook))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ));

    let router = Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1", api);

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(crate::metrics::metrics_handler));

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Wiring ───────────────────────────────────────────────────────────────────

/// Open the SQLite database and create the instance and stats tables.
pub async fn open_database(config: &WagateConfig) -> anyhow::Result<SqlitePool> {
    let url = config.database_url();
    if config.database.url.is_none() {
        let dir = wagate_config::data_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
    }
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .with_context(|| format!("failed to open database {url}"))?;
    SqliteTenantDirectory::init(&pool).await?;
    SqliteMessageStats::init(&pool).await?;
    Ok(pool)
}

/// Open the configured credential backend.
pub fn open_credential_store(config: &WagateConfig) -> anyhow::Result<Arc<dyn CredentialStore>> {
    let path = config.credentials_path();
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create credentials dir {}", path.display()))?;
    let store: Arc<dyn CredentialStore> = match config.credentials.backend {
        CredentialBackend::File => Arc::new(FileCredentialStore::new(path)),
        CredentialBackend::Sled => Arc::new(
            SledCredentialStore::open(&path)
                .with_context(|| format!("failed to open sled store {}", path.display()))?,
        ),
    };
    Ok(store)
}

/// Start the gateway HTTP server. Runs until Ctrl-C, then drains every session.
pub async fn start_gateway(config: WagateConfig) -> anyhow::Result<()> {
    #[cfg(feature = "prometheus")]
    let metrics_handle = crate::metrics::install_recorder()
        .inspect_err(|e| warn!(error = %e, "metrics disabled"))
        .ok();

    let pool = open_database(&config).await?;
    let directory = Arc::new(SqliteTenantDirectory::new(pool.clone()));
    let stats = Arc::new(SqliteMessageStats::new(pool));
    let store = open_credential_store(&config)?;
    let webhooks = Arc::new(
        HttpWebhookDispatcher::new(
            Duration::from_secs(config.webhook.timeout_secs),
            config.webhook.signing_secret.clone(),
        )
        .context("failed to build webhook client")?,
    );
    let client = Arc::new(BridgeClient::new(config.bridge.url.clone()));

    let manager = SessionManager::builder(client, store)
        .directory(Arc::clone(&directory) as _)
        .stats(stats)
        .webhooks(webhooks)
        .options(ManagerOptions::from_config(&config))
        .build();

    let resolved_auth = ResolvedAuth {
        token: config.server.api_token.clone(),
    };
    if resolved_auth.token.is_none() {
        warn!("no api token configured; /api routes are open");
    }

    #[cfg(feature = "prometheus")]
    let state = match metrics_handle {
        Some(handle) => {
            GatewayState::with_metrics(manager.clone(), directory, resolved_auth, handle)
        },
        None => GatewayState::new(manager.clone(), directory, resolved_auth),
    };
    #[cfg(not(feature = "prometheus"))]
    let state = GatewayState::new(manager.clone(), directory, resolved_auth);

    let report = manager
        .restore_all()
        .await
        .context("failed to list stored sessions")?;

    let app = build_gateway_app(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Startup banner.
    let lines = [
        format!("wagate gateway v{}", state.version),
        format!("listening on {addr}"),
        format!("bridge: {}", config.bridge.url),
        format!(
            "sessions: {} restored, {} failed",
            report.restored.len(),
            report.failed.len()
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "sessions": state.manager.active_sessions(),
        "uptimeSecs": state.uptime_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        axum::{
            body::Body,
            http::{Method, Request, StatusCode},
        },
        secrecy::Secret,
        tower::ServiceExt,
        wagate_protocol::{ProtocolError, ProtocolEvent, testing::ScriptedClient},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        client: ScriptedClient,
        manager: SessionManager,
        app: Router,
    }

    async fn fixture(token: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new();
        let store = Arc::new(FileCredentialStore::new(dir.path().join("auth")));
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteTenantDirectory::init(&pool).await.unwrap();
        let directory = Arc::new(SqliteTenantDirectory::new(pool));
        directory
            .register_instance("u1", "inst-1", Some("https://hooks.example/u1"))
            .await
            .unwrap();

        let manager = SessionManager::builder(Arc::new(client.clone()), store)
            .directory(Arc::clone(&directory) as _)
            .options(ManagerOptions {
                bulk_delay: Duration::ZERO,
                ..ManagerOptions::default()
            })
            .build();
        let auth = ResolvedAuth {
            token: token.map(|t| Secret::new(t.to_string())),
        };
        let app = build_gateway_app(GatewayState::new(manager.clone(), directory, auth));
        Fixture {
            _dir: dir,
            client,
            manager,
            app,
        }
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            },
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    async fn create(f: &Fixture) -> String {
        f.client
            .auto_emit(vec![ProtocolEvent::PairingCode("ABC123".into())]);
        let (status, body) = call(
            &f.app,
            Method::POST,
            "/api/v1/sessions",
            Some(serde_json::json!({"ownerId": "u1", "instanceKey": "inst-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["sessionId"].as_str().unwrap().to_string()
    }

    async fn wait_connected(f: &Fixture, id: &str) {
        for _ in 0..500 {
            let (_, body) = call(
                &f.app,
                Method::GET,
                &format!("/api/v1/sessions/{id}/status"),
                None,
            )
            .await;
            if body["status"] == "connected" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never connected");
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let f = fixture(Some("t0ken")).await;
        let (status, body) = call(&f.app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn api_requires_bearer_token() {
        let f = fixture(Some("t0ken")).await;
        let (status, body) = call(&f.app, Method::GET, "/api/v1/sessions", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], "error");

        let req = Request::builder()
            .uri("/api/v1/sessions")
            .header("authorization", "Bearer t0ken")
            .body(Body::empty())
            .unwrap();
        let resp = f.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_returns_pairing_code_and_qr() {
        let f = fixture(None).await;
        f.client
            .auto_emit(vec![ProtocolEvent::PairingCode("ABC123".into())]);
        let (status, body) = call(
            &f.app,
            Method::POST,
            "/api/v1/sessions",
            Some(serde_json::json!({"ownerId": "u1", "instanceKey": "inst-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["pairingCode"], "ABC123");
        assert!(
            body["qrCode"]
                .as_str()
                .unwrap()
                .starts_with("data:image/svg+xml;base64,")
        );

        let (_, list) = call(&f.app, Method::GET, "/api/v1/sessions", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["ownerId"], "u1");
    }

    #[tokio::test]
    async fn create_validates_body() {
        let f = fixture(None).await;
        let (status, _) = call(
            &f.app,
            Method::POST,
            "/api/v1/sessions",
            Some(serde_json::json!({"ownerId": " ", "instanceKey": "inst-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(f.client.connect_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_maps_to_bad_gateway() {
        let f = fixture(None).await;
        f.client
            .fail_next_connect(ProtocolError::Connect("bridge down".into()));
        let (status, body) = call(
            &f.app,
            Method::POST,
            "/api/v1/sessions",
            Some(serde_json::json!({"ownerId": "u1", "instanceKey": "inst-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("bridge down"));
        assert!(f.manager.list().is_empty());
    }

    #[tokio::test]
    async fn create_for_foreign_instance_is_forbidden() {
        let f = fixture(None).await;
        let (status, body) = call(
            &f.app,
            Method::POST,
            "/api/v1/sessions",
            Some(serde_json::json!({"ownerId": "intruder", "instanceKey": "inst-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["status"], "error");
        assert_eq!(f.client.connect_count(), 0);
        assert!(f.manager.list().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let f = fixture(None).await;
        let (status, _) = call(
            &f.app,
            Method::GET,
            "/api/v1/sessions/nope/status",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &f.app,
            Method::GET,
            "/api/v1/sessions/..%2Fetc/status",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn send_requires_connected_session() {
        let f = fixture(None).await;
        let id = create(&f).await;
        let uri = format!("/api/v1/sessions/{id}/messages");
        let msg = serde_json::json!({"to": "9876543210", "message": "hi"});

        let (status, _) = call(&f.app, Method::POST, &uri, Some(msg.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let conn = f.client.last_connection().unwrap();
        conn.emit(ProtocolEvent::Connected { self_address: None });
        wait_connected(&f, &id).await;

        let (status, body) = call(&f.app, Method::POST, &uri, Some(msg)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["to"], "919876543210@s.whatsapp.net");
        assert_eq!(conn.sent().len(), 1);

        let (status, _) = call(
            &f.app,
            Method::POST,
            &uri,
            Some(serde_json::json!({"to": "abc", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bulk_send_reports_each_item() {
        let f = fixture(None).await;
        let id = create(&f).await;
        let conn = f.client.last_connection().unwrap();
        conn.emit(ProtocolEvent::Connected { self_address: None });
        wait_connected(&f, &id).await;

        let (status, body) = call(
            &f.app,
            Method::POST,
            &format!("/api/v1/sessions/{id}/messages/bulk"),
            Some(serde_json::json!({"messages": [
                {"to": "9876543210", "message": "one"},
                {"to": "", "message": "two"},
                {"to": "911234567890", "text": "three"},
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["sent"], 2);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["results"][1]["success"], false);
        assert_eq!(conn.sent().len(), 2);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let f = fixture(None).await;
        let id = create(&f).await;
        let conn = f.client.last_connection().unwrap();

        let uri = "/api/v1/instances/inst-1/session";
        let (status, body) = call(&f.app, Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disconnected"], true);
        assert_eq!(conn.close_count(), 1);

        let (status, body) = call(&f.app, Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disconnected"], false);
        assert_eq!(conn.close_count(), 1);

        let (status, _) = call(
            &f.app,
            Method::GET,
            &format!("/api/v1/sessions/{id}/status"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &f.app,
            Method::DELETE,
            "/api/v1/instances/unknown/session",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn instances_register_and_update_webhook() {
        let f = fixture(None).await;
        let (status, body) = call(
            &f.app,
            Method::POST,
            "/api/v1/instances",
            Some(serde_json::json!({"ownerId": "u2"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let key = body["instanceKey"].as_str().unwrap().to_string();
        assert_eq!(key.len(), 64);
        assert_eq!(body["ownerId"], "u2");

        let (status, body) = call(
            &f.app,
            Method::PUT,
            &format!("/api/v1/instances/{key}/webhook"),
            Some(serde_json::json!({"webhookUrl": "https://hooks.example/u2"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["webhookUrl"], "https://hooks.example/u2");

        let (status, _) = call(
            &f.app,
            Method::PUT,
            "/api/v1/instances/missing/webhook",
            Some(serde_json::json!({"webhookUrl": "https://hooks.example/x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &f.app,
            Method::PUT,
            &format!("/api/v1/instances/{key}/webhook"),
            Some(serde_json::json!({"webhookUrl": "mailto:x@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
