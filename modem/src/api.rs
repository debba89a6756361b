use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, post},
    Json, Router,
};
use derive_builder::Builder;
use serde_json::json;
use slog::{error, info, Logger};
use tokio::net::TcpListener;

use crate::{
    error::ModemError,
    modem::{Modem, ModemStatus, PowerAction},
};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        ApiError {
            status,
            message: msg.into(),
        }
    }

    fn not_found(msg: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, msg)
    }

    fn internal(msg: impl Into<String>) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl From<ModemError> for ApiError {
    fn from(e: ModemError) -> Self {
        if e.is_device_error() {
            // the host is fine, the module behind it is not
            ApiError::new(StatusCode::BAD_GATEWAY, e.to_string())
        } else {
            ApiError::internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> AxumResponse {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Builder)]
#[builder(pattern = "mutable")]
pub struct API {
    addr: SocketAddr,
    modem: Arc<dyn Modem>,
    #[builder(default)]
    logger: Option<Logger>,
}

pub struct AppState {
    modem: Arc<dyn Modem>,
    logger: Logger,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/modem", get(handle_status))
        .route("/api/v1/modem/power/{action}", post(handle_power))
        .with_state(state)
}

impl API {
    pub fn builder() -> APIBuilder {
        APIBuilder::default()
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let Some(logger) = self.logger else {
            return Err(anyhow::anyhow!("Logger is not set"));
        };

        let state = Arc::new(AppState {
            modem: self.modem,
            logger: logger.clone(),
        });

        let api_listener = TcpListener::bind(self.addr)
            .await
            .context("Failed to bind API listener")?;

        axum::serve(api_listener, router(state))
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(logger, "install Ctrl+C handler"; "error" => %e);
                }
            })
            .await?;

        Ok(())
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<ModemStatus> {
    Json(state.modem.status())
}

async fn handle_power(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action: PowerAction = action
        .parse()
        .map_err(|e: crate::modem::UnknownAction| ApiError::not_found(e.to_string()))?;

    info!(state.logger, "Power request"; "action" => action.as_str());

    state.modem.power(action).await?;

    Ok(Json(json!({
        "status": "success",
        "action": action.as_str(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::DeviceFault,
        modem::BootStage,
        properties::EC2X_PROPERTIES,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeModem {
        seen: Mutex<Vec<PowerAction>>,
    }

    #[async_trait]
    impl Modem for FakeModem {
        async fn power(&self, action: PowerAction) -> crate::error::Result<()> {
            self.seen.lock().unwrap().push(action);
            match action {
                PowerAction::SoftOn => Err(ModemError::Device(DeviceFault::NotReady)),
                PowerAction::HardOff => Err(ModemError::Poisoned),
                _ => Ok(()),
            }
        }

        fn status(&self) -> ModemStatus {
            ModemStatus {
                model: "fake",
                active_high: true,
                pwr_pin: Some(17),
                rst_pin: None,
                flow_control: None,
                start_timeout_ms: 15000,
                busy: false,
                boot_stage: Some(BootStage::Idle),
                properties: EC2X_PROPERTIES,
            }
        }
    }

    fn state() -> (Arc<AppState>, Arc<FakeModem>) {
        let modem = Arc::new(FakeModem::default());
        let state = Arc::new(AppState {
            modem: modem.clone(),
            logger: Logger::root(slog::Discard, slog::o!()),
        });
        (state, modem)
    }

    #[tokio::test]
    async fn power_runs_action() {
        let (state, modem) = state();
        let Json(body) = handle_power(State(state), Path("hard-on".to_string()))
            .await
            .unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(*modem.seen.lock().unwrap(), vec![PowerAction::HardOn]);
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let (state, modem) = state();
        let err = handle_power(State(state), Path("reboot".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(modem.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_error_is_bad_gateway() {
        let (state, _) = state();
        let err = handle_power(State(state), Path("soft-on".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert!(err.message.contains("did not report RDY"));
    }

    #[tokio::test]
    async fn host_error_is_internal() {
        let (state, _) = state();
        let err = handle_power(State(state), Path("hard-off".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn status_reports_modem() {
        let (state, _) = state();
        let Json(status) = handle_status(State(state)).await;
        assert_eq!(status.model, "fake");
        assert_eq!(status.pwr_pin, Some(17));
    }

    #[test]
    fn run_requires_logger() {
        let api = API::builder()
            .addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .modem(Arc::new(FakeModem::default()) as Arc<dyn Modem>)
            .build()
            .unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let err = rt.block_on(api.run()).unwrap_err();
        assert_eq!(err.to_string(), "Logger is not set");
    }
}
