use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Bytes,
    extract::{Path as AxumPath, RawQuery, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hickory_proto::op::ResponseCode;
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use tracing::{debug, error, info, warn};

use super::metrics::{DnsMetrics, PROMETHEUS_CONTENT_TYPE};
use super::upstream::{DNS_CONTENT_TYPE, UpstreamForwarder};
use super::{DnsHandler, DnsProcessError, Transport, build_error_response};
use crate::config::{NearLinkConfig, ResolverSettings};
use crate::lookup::{NearLinkResolver, authority_from_config};
use crate::oracle::{NearRpcClient, OracleClient};

const MAX_UDP_DATAGRAM: usize = 65_535;

pub struct NearLinkDaemon {
    config: Arc<NearLinkConfig>,
    handler: Arc<DnsHandler>,
}

impl NearLinkDaemon {
    /// Wire the resolver, oracle client and upstream from a loaded configuration.
    ///
    /// Build this outside the async runtime; the oracle client is blocking.
    pub fn new(config: NearLinkConfig) -> Result<Self> {
        let settings = ResolverSettings::from_config(&config)?;
        let oracle: Arc<dyn OracleClient> = Arc::new(NearRpcClient::from_settings(&config.oracle)?);
        let authority = authority_from_config(&config.authority)?;
        let resolver = NearLinkResolver::new(Arc::new(settings), oracle).with_authority(authority);
        let upstream = UpstreamForwarder::from_settings(&config.upstream)?;
        let metrics = DnsMetrics::new().context("Failed to initialise NearLink metrics")?;

        let handler = DnsHandler::new(Arc::new(resolver), upstream, Arc::new(metrics));
        Ok(Self::with_handler(config, handler))
    }

    pub fn with_handler(config: NearLinkConfig, handler: DnsHandler) -> Self {
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
        }
    }

    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let dns_addr: SocketAddr = server
            .dns_listen
            .parse()
            .with_context(|| format!("Invalid DNS listener address: {}", server.dns_listen))?;

        let udp = UdpSocket::bind(dns_addr)
            .await
            .with_context(|| format!("Failed to bind UDP listener at {dns_addr}"))?;
        let tcp = TcpListener::bind(dns_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener at {dns_addr}"))?;
        info!(listener = %dns_addr, "Starting NearLink DNS server");

        let doh = async {
            match &server.doh_listen {
                Some(addr) => {
                    let router = doh_router(self.handler.clone(), server.doh_path.clone());
                    serve_router(addr, router, "DoH").await
                }
                None => Ok(()),
            }
        };
        let metrics = async {
            match &server.metrics_listen {
                Some(addr) => {
                    let router = metrics_router(self.handler.metrics().clone());
                    serve_router(addr, router, "metrics").await
                }
                None => Ok(()),
            }
        };

        tokio::try_join!(
            run_udp_server(udp, self.handler.clone()),
            run_tcp_server(tcp, self.handler.clone()),
            doh,
            metrics,
        )?;
        info!("NearLink stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; stopping NearLink");
}

async fn run_udp_server(socket: UdpSocket, handler: Arc<DnsHandler>) -> Result<()> {
    let socket = Arc::new(socket);
    let mut buffer = vec![0u8; MAX_UDP_DATAGRAM];

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            received = socket.recv_from(&mut buffer) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "Failed to receive UDP datagram");
                        continue;
                    }
                };
                let payload = buffer[..len].to_vec();
                let socket = socket.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let reply = reply_or_servfail(&handler, &payload, Transport::Udp).await;
                    let Some(reply) = reply else {
                        return;
                    };
                    if let Err(err) = socket.send_to(&reply, peer).await {
                        warn!(peer = %peer, error = %err, "Failed to send UDP reply");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn run_tcp_server(listener: TcpListener, handler: Arc<DnsHandler>) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "Failed to accept TCP connection");
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_tcp_connection(stream, handler).await {
                        debug!(peer = %peer, error = %err, "TCP connection terminated with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_tcp_connection(mut stream: TcpStream, handler: Arc<DnsHandler>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("Failed to read DNS frame length"),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }

        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .await
            .context("Failed to read DNS frame payload")?;

        if let Some(reply) = reply_or_servfail(&handler, &payload, Transport::Tcp).await {
            write_framed(&mut stream, &reply).await?;
        }
    }
    Ok(())
}

/// Malformed queries get no reply; internal failures get SERVFAIL.
async fn reply_or_servfail(
    handler: &DnsHandler,
    payload: &[u8],
    transport: Transport,
) -> Option<Vec<u8>> {
    match handler.handle(payload, transport).await {
        Ok(reply) => Some(reply),
        Err(DnsProcessError::BadRequest(_)) => None,
        Err(DnsProcessError::Internal(_)) => build_error_response(payload, ResponseCode::ServFail),
    }
}

async fn write_framed<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > u16::MAX as usize {
        anyhow::bail!("DNS message exceeds TCP frame size limit");
    }
    stream
        .write_u16(payload.len() as u16)
        .await
        .context("Failed to write DNS frame length")?;
    stream
        .write_all(payload)
        .await
        .context("Failed to write DNS frame payload")?;
    stream.flush().await.context("Failed to flush DNS frame")
}

async fn serve_router(addr: &str, router: Router, label: &'static str) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid {label} listener address: {addr}"))?;
    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind {label} listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting NearLink {label} server");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .with_context(|| format!("NearLink {label} server terminated unexpectedly"))
}

#[derive(Clone)]
struct DohState {
    handler: Arc<DnsHandler>,
    doh_path: String,
}

pub(crate) fn doh_router(handler: Arc<DnsHandler>, doh_path: String) -> Router {
    Router::new()
        .route("/*tail", get(doh_get).post(doh_post))
        .with_state(Arc::new(DohState { handler, doh_path }))
}

fn metrics_router(metrics: Arc<DnsMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<DnsMetrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], buffer).into_response(),
        Err(err) => {
            error!(error = %err, "Failed to render NearLink metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

impl IntoResponse for DnsProcessError {
    fn into_response(self) -> Response {
        match self {
            DnsProcessError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            DnsProcessError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        }
        .into_response()
    }
}

async fn doh_get(
    State(state): State<Arc<DohState>>,
    AxumPath(tail): AxumPath<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, DnsProcessError> {
    if !path_matches(&state.doh_path, &tail) {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    let payload = dns_query_param(raw_query.as_deref().unwrap_or(""))?;
    answer_doh(&state.handler, &payload).await
}

async fn doh_post(
    State(state): State<Arc<DohState>>,
    AxumPath(tail): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DnsProcessError> {
    if !path_matches(&state.doh_path, &tail) {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    let is_dns_message = headers
        .get(header::CONTENT_TYPE)
        .is_some_and(|value| value.as_bytes() == DNS_CONTENT_TYPE.as_bytes());
    if !is_dns_message {
        return Err(DnsProcessError::BadRequest(format!(
            "expected content-type {DNS_CONTENT_TYPE}"
        )));
    }
    answer_doh(&state.handler, &body).await
}

async fn answer_doh(handler: &DnsHandler, payload: &[u8]) -> Result<Response, DnsProcessError> {
    let reply = handler.handle(payload, Transport::Https).await?;
    Ok(([(header::CONTENT_TYPE, DNS_CONTENT_TYPE)], reply).into_response())
}

/// Decode the base64url `dns` parameter of a DoH GET query string.
fn dns_query_param(query: &str) -> Result<Vec<u8>, DnsProcessError> {
    let encoded = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("dns="))
        .ok_or_else(|| DnsProcessError::BadRequest("missing dns query parameter".into()))?;
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|err| DnsProcessError::BadRequest(format!("invalid dns parameter: {err}")))
}

fn path_matches(expected: &str, tail: &str) -> bool {
    expected.trim_start_matches('/') == tail.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{handler, query_bytes};
    use axum::body::Body;
    use axum::http::Request;
    use hickory_proto::op::Message;
    use hickory_proto::rr::RecordType;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    fn router() -> Router {
        doh_router(Arc::new(handler()), "/dns-query".into())
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn doh_get_answers_query() {
        let query = query_bytes("alice.link.", RecordType::TXT, None);
        let uri = format!("/dns-query?dns={}", URL_SAFE_NO_PAD.encode(&query));
        let response = router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            DNS_CONTENT_TYPE
        );
        let message = Message::from_vec(&body_bytes(response).await).unwrap();
        assert_eq!(message.answers().len(), 1);
    }

    #[tokio::test]
    async fn doh_post_answers_query() {
        let query = query_bytes("alice.link.", RecordType::NS, None);
        let request = Request::post("/dns-query")
            .header(header::CONTENT_TYPE, DNS_CONTENT_TYPE)
            .body(Body::from(query))
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let message = Message::from_vec(&body_bytes(response).await).unwrap();
        assert_eq!(message.id(), 4242);
        assert_eq!(message.answers().len(), 1);
    }

    #[tokio::test]
    async fn doh_post_requires_dns_content_type() {
        let request = Request::post("/dns-query")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("hello"))
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn doh_rejects_malformed_message() {
        let request = Request::post("/dns-query")
            .header(header::CONTENT_TYPE, DNS_CONTENT_TYPE)
            .body(Body::from(vec![0x00, 0x01]))
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn doh_unknown_path_is_not_found() {
        let response = router()
            .oneshot(Request::get("/other?dns=AAAA").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_counters() {
        let handler = Arc::new(handler());
        let query = query_bytes("alice.link.", RecordType::TXT, None);
        handler.handle(&query, Transport::Udp).await.unwrap();

        let response = metrics_router(handler.metrics().clone())
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("nearlink_success_total 1"));
    }

    #[tokio::test]
    async fn tcp_connection_answers_framed_queries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_tcp_connection(stream, handler).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        for qtype in [RecordType::TXT, RecordType::NS] {
            let query = query_bytes("alice.link.", qtype, None);
            write_framed(&mut client, &query).await.unwrap();
            let len = client.read_u16().await.unwrap() as usize;
            let mut reply = vec![0u8; len];
            client.read_exact(&mut reply).await.unwrap();
            let message = Message::from_vec(&reply).unwrap();
            assert_eq!(message.queries()[0].query_type(), qtype);
            assert_eq!(message.answers().len(), 1);
        }
    }

    #[tokio::test]
    async fn udp_round_trip_through_socket() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handler = Arc::new(handler());
        tokio::spawn(run_udp_server(server, handler));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = query_bytes("alice.link.", RecordType::A, None);
        client.send_to(&query, addr).await.unwrap();
        let mut buffer = vec![0u8; 4096];
        let (len, _) = client.recv_from(&mut buffer).await.unwrap();
        let message = Message::from_vec(&buffer[..len]).unwrap();
        assert_eq!(message.answers().len(), 1);
    }

    #[tokio::test]
    async fn run_stops_when_doh_listener_cannot_bind() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = NearLinkConfig::default();
        config.server.dns_listen = "127.0.0.1:0".into();
        config.server.doh_listen = Some(occupied.local_addr().unwrap().to_string());
        config.server.metrics_listen = None;

        let daemon = NearLinkDaemon::with_handler(config, handler());
        let outcome = tokio::time::timeout(Duration::from_secs(3), daemon.run())
            .await
            .expect("run returns once a listener fails");
        let err = outcome.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to bind DoH listener"));
    }

    #[test]
    fn get_payload_requires_dns_parameter() {
        assert!(dns_query_param("foo=bar").is_err());
        assert!(dns_query_param("dns=!!!").is_err());
        assert_eq!(dns_query_param("ct=x&dns=AAE").ok(), Some(vec![0x00, 0x01]));
    }
}
