// Proxy instance - the per-tool HTTP server
//
// One axum server per tool on its configured port. The request pipeline:
// method gate, bind check, local-key auth, session derivation, route
// resolution (per-session override or internal profile), loop detect,
// header rewrite, streaming forward. The response body is teed: every
// chunk goes to the client and into the tool's token processor, and the
// finalized log is submitted to the stats store and session manager
// after the stream ends. Processor errors never disturb the client's
// byte stream.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, Request, Response, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{CoreError, ErrorKind};
use crate::models::{
    ConfigMode, GlobalConfig, PricingStore, Profile, ResponseType, ToolProxyConfig,
};
use crate::paths;
use crate::profiles::ProfileManager;
use crate::sessions::{derive_session_identity, SessionManager, SessionIdentity};
use crate::stats::StatsStore;
use crate::store::DataStore;
use crate::tools::{ToolId, WireFlavor};
use crate::usage::{effective_flavor, processor_for, StreamOutcome, UsageLogger};

use super::headers;
use super::websearch;

/// Inbound header/body read budget.
const REQUEST_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Maximum silence between upstream body chunks.
const UPSTREAM_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
/// Largest accepted request body (matches the biggest context windows).
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Immutable per-instance state. Request tasks clone the Arc-ed snapshot;
/// runtime mutation of the config is forbidden (stop -> write -> start).
#[derive(Clone)]
pub struct InstanceState {
    pub tool: ToolId,
    pub cfg: Arc<ToolProxyConfig>,
    /// Internal dc_proxy_ profile carrying the upstream credentials
    pub upstream: Arc<Profile>,
    pub listen_addr: SocketAddr,
    pub client: reqwest::Client,
    pub store: Arc<DataStore>,
    pub profiles: Arc<ProfileManager>,
    pub sessions: SessionManager,
    pub stats: StatsStore,
}

/// Build the outbound HTTP client for an instance. No default UA - the
/// CLI's own User-Agent is forwarded because some vendors validate it.
pub fn build_client(global: &GlobalConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300)) // 5 minute ceiling per API call
        .connect_timeout(std::time::Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        // HTTP/1.1 avoids connection-reset issues seen with some relays
        .http1_only();
    if let Some(proxy_url) = &global.http_proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    Ok(builder.build()?)
}

/// Run the server on an already-bound listener until shutdown fires.
pub async fn serve(
    state: InstanceState,
    listener: TcpListener,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .fallback(proxy_handler)
        .with_state(state.clone());

    tracing::info!("{} proxy listening on {}", state.tool, state.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_rx.await.ok();
    })
    .await?;

    tracing::info!("{} proxy shut down", state.tool);
    Ok(())
}

/// True when the upstream URL would route back into this listener.
pub fn routes_to_self(base_url: &str, listen_addr: SocketAddr) -> bool {
    let Some((host, port)) = split_authority(base_url) else {
        return false;
    };
    let host_is_local = matches!(host.as_str(), "127.0.0.1" | "localhost" | "::1" | "[::1]");
    host_is_local && port == listen_addr.port()
}

/// True when the URL's host is a loopback address at any port.
pub fn is_loopback_url(base_url: &str) -> bool {
    split_authority(base_url)
        .map(|(host, _)| matches!(host.as_str(), "127.0.0.1" | "localhost" | "::1" | "[::1]"))
        .unwrap_or(false)
}

fn split_authority(base_url: &str) -> Option<(String, u16)> {
    let rest = base_url
        .strip_prefix("http://")
        .map(|r| (r, 80u16))
        .or_else(|| base_url.strip_prefix("https://").map(|r| (r, 443u16)));
    let (rest, default_port) = rest?;
    let authority = rest.split(['/', '?']).next()?;
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => {
            (h.to_string(), p.parse().unwrap_or(default_port))
        }
        _ => (authority.to_string(), default_port),
    };
    Some((host.trim_matches(['[', ']']).to_string(), port))
}

fn error_response(err: CoreError) -> Response<Body> {
    let status = err.http_status();
    let body = serde_json::to_vec(&err).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Resolved upstream route for one request.
struct Route {
    base_url: String,
    api_key: String,
    config_name: String,
    config_mode: ConfigMode,
    pricing_template_id: Option<String>,
    flavor: WireFlavor,
}

impl InstanceState {
    /// AMP delegates parsing to its child profile's wire. The selection
    /// rides on the profile shape: an explicit wire_api means the openai
    /// responses wire, a pinned model means gemini, default anthropic.
    fn amp_child_flavor(profile: &Profile) -> WireFlavor {
        if profile.wire_api.is_some() {
            WireFlavor::OpenAiResponses
        } else if profile.model.is_some() {
            WireFlavor::Gemini
        } else {
            WireFlavor::Anthropic
        }
    }

    fn route_from_profile(&self, profile: &Profile, config_mode: ConfigMode) -> Route {
        let flavor = effective_flavor(self.tool, Some(Self::amp_child_flavor(profile)));
        Route {
            base_url: profile.base_url.clone(),
            api_key: profile.api_key.clone(),
            config_name: match &config_mode {
                ConfigMode::Global => "global".to_string(),
                ConfigMode::Custom { profile_name } => profile_name.clone(),
            },
            config_mode,
            pricing_template_id: profile
                .pricing_template_id
                .clone()
                .or_else(|| self.cfg.pricing_template_id.clone())
                .or_else(|| self.default_template()),
            flavor,
        }
    }

    fn default_template(&self) -> Option<String> {
        let pricing: PricingStore = self
            .store
            .read_json(&paths::pricing_file())
            .unwrap_or_default();
        pricing
            .tool_defaults
            .get(&self.tool)
            .cloned()
            .or_else(|| Some(self.tool.default_pricing_template().to_string()))
    }

    /// Pick the upstream: a session-bound custom profile when enabled and
    /// present, else the internal profile.
    async fn resolve_route(&self, session_id: &str) -> Route {
        if self.cfg.session_endpoint_config_enabled {
            if let Some(ConfigMode::Custom { profile_name }) =
                self.sessions.config_mode(session_id).await
            {
                match self.profiles.get(self.tool, &profile_name).await {
                    Ok(profile) => {
                        return self.route_from_profile(
                            &profile,
                            ConfigMode::Custom { profile_name },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            "session {session_id} pinned to missing profile {profile_name}: {e}; using global route"
                        );
                    }
                }
            }
        }
        self.route_from_profile(&self.upstream, ConfigMode::Global)
    }

    fn load_pricing(&self) -> PricingStore {
        self.store
            .read_json(&paths::pricing_file())
            .unwrap_or_default()
    }
}

async fn proxy_handler(
    State(state): State<InstanceState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let req_headers = req.headers().clone();

    // Bind check before anything else: a public client on a loopback-only
    // listener gets nothing, not even the 405 surface
    if !state.cfg.allow_public && !client_addr.ip().is_loopback() {
        return error_response(
            CoreError::new(ErrorKind::AuthFailed, "forbidden_public_access")
                .with_details(serde_json::json!({"client": client_addr.ip().to_string()})),
        )
        .tap_status(StatusCode::FORBIDDEN);
    }

    // Minimal method surface: POST forwards, everything else is rejected
    if method != Method::POST {
        return error_response(CoreError::invalid("only POST is accepted"))
            .tap_status(StatusCode::METHOD_NOT_ALLOWED);
    }

    // Local-key auth from any accepted slot
    let wire = state.tool.wire_flavor();
    let presented = headers::extract_client_key(&req_headers, wire);
    let expected = state.cfg.local_api_key.clone().unwrap_or_default();
    if expected.is_empty() || presented.as_deref() != Some(expected.as_str()) {
        tracing::debug!("{}: rejected request with bad local key", state.tool);
        return error_response(CoreError::new(ErrorKind::AuthFailed, "unauthorized"));
    }

    // Read the request body; session derivation needs the JSON once
    let body_bytes = match tokio::time::timeout(
        REQUEST_READ_TIMEOUT,
        axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES),
    )
    .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            return error_response(CoreError::invalid(format!("body read failed: {e}")));
        }
        Err(_) => {
            return error_response(CoreError::new(
                ErrorKind::Timeout,
                "request body read timed out",
            ));
        }
    };

    // AMP serves its web-search tool locally instead of forwarding
    if state.tool == ToolId::AmpCode && uri.path().contains("webSearch2") {
        return handle_websearch(&state, &body_bytes).await;
    }

    let request_json: Option<Value> = serde_json::from_slice(&body_bytes).ok();
    let client_ip = client_addr.ip().to_string();

    // Session identity comes from the flavor actually parsed downstream
    let parse_flavor = effective_flavor(
        state.tool,
        Some(InstanceState::amp_child_flavor(&state.upstream)),
    );
    let identity = derive_session_identity(
        state.tool,
        parse_flavor,
        request_json.as_ref(),
        &client_ip,
    );

    let route = state.resolve_route(&identity.session_id).await;

    // Loop detect on the resolved route; session overrides can introduce
    // loops the start-time check never saw
    if routes_to_self(&route.base_url, state.listen_addr) {
        return error_response(CoreError::new(
            ErrorKind::LoopDetected,
            "proxy_loop_detected",
        ));
    }
    if state.cfg.allow_public && is_loopback_url(&route.base_url) {
        return error_response(CoreError::new(
            ErrorKind::LoopDetected,
            "loopback upstream on a public listener",
        ));
    }

    forward(state, route, identity, uri, req_headers, body_bytes, client_ip).await
}

/// Forward the request and tee the response stream.
async fn forward(
    state: InstanceState,
    route: Route,
    identity: SessionIdentity,
    uri: Uri,
    req_headers: HeaderMap,
    body_bytes: Bytes,
    client_ip: String,
) -> Response<Body> {
    let mut logger = UsageLogger::new(
        processor_for(route.flavor),
        state.tool,
        identity.session_id.clone(),
        route.config_name.clone(),
        client_ip,
        route.pricing_template_id.clone(),
    );

    let forward_url = {
        let base = route.base_url.trim_end_matches('/');
        match uri.query() {
            Some(query) => format!("{base}{}?{query}", uri.path()),
            None => format!("{base}{}", uri.path()),
        }
    };
    tracing::debug!("{}: forwarding to {forward_url}", state.tool);

    let request = headers::rewrite_for_upstream(
        state.client.post(&forward_url),
        &req_headers,
        route.flavor,
        &route.api_key,
    )
    .body(body_bytes.to_vec());

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("{}: upstream request failed: {e}", state.tool);
            let log = logger.finalize(
                StreamOutcome::UpstreamError { status: 502 },
                &state.load_pricing(),
            );
            submit(&state, &identity, route.config_mode, log).await;
            return error_response(CoreError::new(
                ErrorKind::UpstreamError,
                format!("upstream request failed: {e}"),
            ));
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    let content_type = upstream_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let response_type = if content_type.starts_with("text/event-stream") {
        ResponseType::Sse
    } else if content_type.starts_with("application/json") {
        ResponseType::Json
    } else {
        ResponseType::Unknown
    };
    logger.set_response_type(response_type);

    // Tee the body: chunks go to the client channel and the processor.
    // The spawned task outlives client disconnects so the log always
    // lands.
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let tee_state = state.clone();
    let tee_mode = route.config_mode.clone();
    let upstream_failed = !status.is_success();
    let upstream_status = status.as_u16();

    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        let outcome = loop {
            let next = tokio::time::timeout(UPSTREAM_IDLE_TIMEOUT, stream.next()).await;
            match next {
                Err(_) => {
                    tracing::warn!("{}: upstream idle timeout", tee_state.tool);
                    break StreamOutcome::IdleTimeout;
                }
                Ok(None) => {
                    break if upstream_failed {
                        StreamOutcome::UpstreamError {
                            status: upstream_status,
                        }
                    } else {
                        StreamOutcome::Success
                    };
                }
                Ok(Some(Ok(chunk))) => {
                    logger.feed(&chunk);
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Client went away; stop pulling from upstream
                        break StreamOutcome::Interrupted;
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("{}: upstream body error: {e}", tee_state.tool);
                    let _ = tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                        .await;
                    break StreamOutcome::UpstreamError {
                        status: upstream_status,
                    };
                }
            }
        };
        drop(tx);

        let log = logger.finalize(outcome, &tee_state.load_pricing());
        submit(&tee_state, &identity, tee_mode, log).await;
    });

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in &upstream_headers {
        let name_str = name.as_str();
        if name_str == "transfer-encoding" || name_str == "connection" {
            continue;
        }
        builder = builder.header(name_str, value.as_bytes());
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|e| {
            error_response(CoreError::internal(format!("response build failed: {e}")))
        })
}

/// Hand the finalized log to the stats store and bump the session.
async fn submit(
    state: &InstanceState,
    identity: &SessionIdentity,
    config_mode: ConfigMode,
    log: crate::models::TokenLog,
) {
    state
        .sessions
        .touch(identity, state.tool, &log.counters, config_mode)
        .await;
    state.stats.append_log(log);
}

async fn handle_websearch(state: &InstanceState, body: &[u8]) -> Response<Body> {
    let request: websearch::WebSearchRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(CoreError::invalid(format!("bad webSearch2 payload: {e}")));
        }
    };
    match websearch::handle(
        &state.client,
        request,
        state.cfg.tavily_api_key.as_deref(),
    )
    .await
    {
        Ok(results) => {
            let body = serde_json::to_vec(&results).unwrap_or_default();
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => error_response(CoreError::new(
            ErrorKind::UpstreamError,
            format!("web search failed: {e:#}"),
        )),
    }
}

/// Small helper so a builder-produced response can have its status
/// replaced without re-threading the builder.
trait TapStatus {
    fn tap_status(self, status: StatusCode) -> Self;
}

impl TapStatus for Response<Body> {
    fn tap_status(mut self, status: StatusCode) -> Self {
        *self.status_mut() = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RequestStatus, TokenLog};
    use crate::stats::LogFilters;
    use chrono::Utc;

    #[test]
    fn loop_detection_matches_listen_port() {
        let listen: SocketAddr = "127.0.0.1:8788".parse().unwrap();
        assert!(routes_to_self("http://127.0.0.1:8788", listen));
        assert!(routes_to_self("http://localhost:8788/v1", listen));
        assert!(!routes_to_self("http://127.0.0.1:9999", listen));
        assert!(!routes_to_self("https://jp.duckcoding.com", listen));
    }

    #[test]
    fn default_ports_apply_per_scheme() {
        let listen: SocketAddr = "127.0.0.1:443".parse().unwrap();
        assert!(routes_to_self("https://localhost", listen));
        let listen: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert!(routes_to_self("http://127.0.0.1", listen));
    }

    #[test]
    fn loopback_url_detection() {
        assert!(is_loopback_url("http://127.0.0.1:9000"));
        assert!(is_loopback_url("http://localhost"));
        assert!(!is_loopback_url("https://api.example.com"));
        assert!(!is_loopback_url("not a url"));
    }

    const CLAUDE_SSE: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_e2e\",",
        "\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":10}}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":10}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    /// Upstream stub answering every POST with a fixed SSE transcript.
    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new().route(
            "/v1/messages",
            axum::routing::post(|| async {
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .body(Body::from(CLAUDE_SSE))
                    .unwrap()
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    struct Harness {
        proxy_addr: SocketAddr,
        stats: crate::stats::StatsStore,
        _shutdown: tokio::sync::oneshot::Sender<()>,
        _env: std::sync::MutexGuard<'static, ()>,
    }

    /// `upstream_url` of None points the route at the instance itself
    /// (loop-detection case).
    async fn spawn_instance(name: &str, upstream_url: Option<String>) -> Harness {
        let env = crate::paths::TEST_ENV_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let unique = format!(
            "duckcoding-instance-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        );
        let root = std::env::temp_dir().join(unique);
        std::env::set_var("DUCKCODING_HOME", &root);
        std::env::set_var("DUCKCODING_NATIVE_HOME", root.join("home"));

        let store = Arc::new(DataStore::new());
        // Presets on disk so finalize prices the request
        let mut pricing = PricingStore::default();
        crate::pricing::install_presets(&mut pricing);
        store
            .write_json(&crate::paths::pricing_file(), &pricing)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let upstream_url =
            upstream_url.unwrap_or_else(|| format!("http://127.0.0.1:{}", listen_addr.port()));

        let mut cfg = ToolProxyConfig::new(listen_addr.port());
        cfg.enabled = true;
        cfg.port = listen_addr.port();
        cfg.local_api_key = Some("K".to_string());

        let upstream = Profile {
            name: ToolId::ClaudeCode.internal_profile_name(),
            api_key: "sk-real-upstream".to_string(),
            base_url: upstream_url,
            wire_api: None,
            model: None,
            pricing_template_id: Some("preset-claude".to_string()),
            source: crate::models::ProfileSource::Custom,
            native_snapshot: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stats = crate::stats::StatsStore::open(&root.join("stats.sqlite")).unwrap();
        let sessions = crate::sessions::SessionManager::new(stats.clone());
        let profiles = Arc::new(ProfileManager::new(store.clone()));

        let state = InstanceState {
            tool: ToolId::ClaudeCode,
            cfg: Arc::new(cfg),
            upstream: Arc::new(upstream),
            listen_addr,
            client: reqwest::Client::new(),
            store,
            profiles,
            sessions,
            stats: stats.clone(),
        };

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = serve(state, listener, shutdown_rx).await;
        });

        Harness {
            proxy_addr: listen_addr,
            stats,
            _shutdown: shutdown_tx,
            _env: env,
        }
    }

    async fn wait_for_log(stats: &crate::stats::StatsStore) -> TokenLog {
        for _ in 0..60 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let page = stats
                .query()
                .query_logs(&LogFilters::default(), 1, 10)
                .unwrap();
            if let Some(log) = page.logs.into_iter().next() {
                return log;
            }
        }
        panic!("no token log appeared");
    }

    #[tokio::test]
    async fn claude_happy_path_streams_and_logs() {
        let upstream = spawn_upstream().await;
        let harness =
            spawn_instance("happy", Some(format!("http://127.0.0.1:{}", upstream.port()))).await;

        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "metadata": {
                "user_id": "user_X_session_11111111-2222-3333-4444-555555555555"
            },
            "messages": [{"role": "user", "content": "hi"}]
        });
        let response = reqwest::Client::new()
            .post(format!(
                "http://127.0.0.1:{}/v1/messages",
                harness.proxy_addr.port()
            ))
            .header("authorization", "Bearer K")
            .json(&body)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        let text = response.text().await.unwrap();
        assert!(text.contains("message_start"));
        assert!(text.contains("message_stop"));

        let log = wait_for_log(&harness.stats).await;
        assert_eq!(
            log.session_id,
            "user_X_session_11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(log.request_status, RequestStatus::Success);
        assert_eq!(log.counters.input, 10);
        assert_eq!(log.counters.output, 10);
        assert!(log.costs.total > 0.0);

        // The session aggregate lands on the next 100 ms flush tick
        let mut session = None;
        for _ in 0..40 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            session = harness.stats.query().get_session(&log.session_id).unwrap();
            if session.is_some() {
                break;
            }
        }
        let session = session.expect("session aggregate persisted");
        assert_eq!(
            session.display_id,
            "11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(session.request_count, 1);
        harness.stats.shutdown();
    }

    #[tokio::test]
    async fn missing_local_key_is_401_with_no_log() {
        let upstream = spawn_upstream().await;
        let harness =
            spawn_instance("noauth", Some(format!("http://127.0.0.1:{}", upstream.port()))).await;

        let response = reqwest::Client::new()
            .post(format!(
                "http://127.0.0.1:{}/v1/messages",
                harness.proxy_addr.port()
            ))
            .json(&serde_json::json!({"messages": []}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 401);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "auth_failed");

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let page = harness
            .stats
            .query()
            .query_logs(&LogFilters::default(), 1, 10)
            .unwrap();
        assert_eq!(page.total, 0);
        harness.stats.shutdown();
    }

    #[tokio::test]
    async fn non_post_is_405() {
        let upstream = spawn_upstream().await;
        let harness =
            spawn_instance("method", Some(format!("http://127.0.0.1:{}", upstream.port()))).await;

        let response = reqwest::Client::new()
            .delete(format!(
                "http://127.0.0.1:{}/v1/messages",
                harness.proxy_addr.port()
            ))
            .header("authorization", "Bearer K")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 405);
        harness.stats.shutdown();
    }

    #[tokio::test]
    async fn self_addressed_route_is_508() {
        // Upstream deliberately points back at the instance itself
        let harness = spawn_instance("loop", None).await;

        let response = reqwest::Client::new()
            .post(format!(
                "http://127.0.0.1:{}/v1/messages",
                harness.proxy_addr.port()
            ))
            .header("authorization", "Bearer K")
            .json(&serde_json::json!({"messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 508);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "loop_detected");
        harness.stats.shutdown();
    }
}
