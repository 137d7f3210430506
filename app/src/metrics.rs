use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;

pub const DEFAULT_PORT: u16 = 9001;

// Create a new registry named `dpos`
lazy_static! {
    pub static ref DPOS_REGISTRY: Registry =
        Registry::new_custom(Some("dpos".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref CHAIN_BLOCK_HEIGHT: IntGauge = register_int_gauge_with_registry!(
        "chain_block_height",
        "Height of the last applied block",
        DPOS_REGISTRY
    )
    .unwrap();
    pub static ref CHAIN_PROCESS_BLOCK_TOTALS: IntCounterVec =
        register_int_counter_vec_with_registry!(
            "chain_process_block_totals",
            "Blocks processed, by outcome",
            &["status"],
            DPOS_REGISTRY
        )
        .unwrap();
    pub static ref CHAIN_REVERTED_BLOCKS: IntCounter = register_int_counter_with_registry!(
        "chain_reverted_blocks_total",
        "Blocks undone while resolving forks",
        DPOS_REGISTRY
    )
    .unwrap();
    pub static ref LOADER_SYNC_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "loader_sync_totals",
        "Sync runs, by outcome",
        &["status"],
        DPOS_REGISTRY
    )
    .unwrap();
    pub static ref LOADER_NETWORK_HEIGHT: IntGauge = register_int_gauge_with_registry!(
        "loader_network_height",
        "Consensus height of the last computed network view",
        DPOS_REGISTRY
    )
    .unwrap();
    pub static ref LOADER_REBUILDS: IntCounter = register_int_counter_with_registry!(
        "loader_rebuilds_total",
        "Times the account tables were rebuilt from stored blocks",
        DPOS_REGISTRY
    )
    .unwrap();
    pub static ref KNOWN_PEERS: IntGauge = register_int_gauge_with_registry!(
        "known_peers",
        "Peers currently held in the peer directory",
        DPOS_REGISTRY
    )
    .unwrap();
    pub static ref POOL_TRANSACTION_TOTALS: IntCounterVec =
        register_int_counter_vec_with_registry!(
            "pool_transaction_totals",
            "Transactions received from peers, by outcome",
            &["status"],
            DPOS_REGISTRY
        )
        .unwrap();
    pub static ref POOL_SIGNATURE_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "pool_signature_totals",
        "Multisignature member signatures received, by outcome",
        &["status"],
        DPOS_REGISTRY
    )
    .unwrap();
    pub static ref PROCESS_START_TIME: IntGauge = register_int_gauge_with_registry!(
        "process_start_time_seconds",
        "Unix time the node started",
        DPOS_REGISTRY
    )
    .unwrap();
}

fn respond(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

pub fn render() -> Result<(String, Vec<u8>), prometheus::Error> {
    let mut metric_families = DPOS_REGISTRY.gather();
    metric_families.extend(prometheus::gather());
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match render() {
            Ok((content_type, buffer)) => respond(StatusCode::OK, &content_type, buffer),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string().into_bytes(),
            ),
        },
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "height": CHAIN_BLOCK_HEIGHT.get(),
                "peers": KNOWN_PEERS.get(),
            });
            respond(
                StatusCode::OK,
                "application/json",
                health_status.to_string().into_bytes(),
            )
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", b"Not Found".to_vec()),
    };
    Ok(response)
}

pub async fn start_server(port_number: Option<u16>) {
    let port = port_number.unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            tracing::error!("Unable to bind metrics server on {}: {}", addr, e);
            return;
        }
    };

    PROCESS_START_TIME.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64,
    );

    tokio::spawn(async move {
        tracing::info!("Starting metrics server on {}", addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_metrics_and_health() {
        CHAIN_BLOCK_HEIGHT.set(3);
        let metrics = handle_request(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(metrics.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("dpos_chain_block_height"));

        let health = handle_request(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let missing = handle_request(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
