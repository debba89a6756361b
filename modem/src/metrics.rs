use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::Request,
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine as _, engine::general_purpose};
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec,
};
use slog::{Logger, debug, error};
use tokio::sync::oneshot;

lazy_static::lazy_static! {
    pub static ref POWER_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "modem_power_operations_total",
        "Power operations run against the modem",
        &["action", "result"]
    ).unwrap();
    pub static ref POWER_OPERATION_SECONDS: HistogramVec = register_histogram_vec!(
        "modem_power_operation_seconds",
        "Wall time of power operations, including boot waits",
        &["action"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 30.0]
    ).unwrap();
}

async fn metrics_handler() -> Response {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error encoding metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

/// Compare an `Authorization` header against `user:password`.
fn credentials_match(auth_header: Option<&str>, credentials: &(String, String)) -> bool {
    let Some(encoded) = auth_header.and_then(|h| h.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    decoded == format!("{}:{}", credentials.0, credentials.1)
}

async fn basic_auth(
    req: Request,
    next: Next,
    credentials: Arc<(String, String)>,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    if credentials_match(auth_header, &credentials) {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Start a metrics server with optional basic authentication
///
/// Returns a shutdown signal sender that can be used to stop the server
pub async fn start_metrics_server(
    addr: SocketAddr,
    username: String,
    password: String,
    logger: Logger,
) -> Result<oneshot::Sender<()>> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let mut app = Router::new()
        .route("/metrics", get(metrics_handler))
        .fallback(handler_404);

    // Only add auth middleware if both username and password are provided
    if !username.is_empty() && !password.is_empty() {
        let credentials = Arc::new((username, password));

        let auth_middleware = move |req: Request, next: Next| {
            let creds = credentials.clone();
            async move { basic_auth(req, next, creds).await }
        };

        app = app.layer(middleware::from_fn(auth_middleware));
        debug!(logger, "Metrics server using authentication");
    } else {
        debug!(logger, "Metrics server without authentication");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not bind metrics listener to {}", addr))?;

    debug!(logger, "Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await;
        if let Err(e) = served {
            error!(logger, "metrics server stopped"; "error" => %e);
        }
    });

    Ok(shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> (String, String) {
        ("prom".to_string(), "secret".to_string())
    }

    #[test]
    fn accepts_matching_basic_auth() {
        let header = format!("Basic {}", general_purpose::STANDARD.encode("prom:secret"));
        assert!(credentials_match(Some(&header), &creds()));
    }

    #[test]
    fn rejects_bad_basic_auth() {
        let wrong = format!("Basic {}", general_purpose::STANDARD.encode("prom:nope"));
        assert!(!credentials_match(Some(&wrong), &creds()));
        assert!(!credentials_match(Some("Bearer abc"), &creds()));
        assert!(!credentials_match(Some("Basic !!!"), &creds()));
        assert!(!credentials_match(None, &creds()));
    }

    #[test]
    fn power_metrics_are_exported() {
        POWER_OPERATIONS
            .with_label_values(&["hard-on", "ok"])
            .inc();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("modem_power_operations_total{action=\"hard-on\",result=\"ok\"}"));
    }
}
