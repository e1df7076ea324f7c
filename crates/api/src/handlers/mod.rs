pub mod distributions;
pub mod metrics;
pub mod monitoring;

pub use distributions::distribute_handler;
pub use metrics::metrics_handler;
pub use monitoring::{restart_handler, status_handler};

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use chainops_monitor::DistributionError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

impl ApiError {
    fn kind(&self) -> &str {
        match self {
            ApiError::Distribution(err) => err.kind(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Distribution(err) => match err {
                DistributionError::Validation(_) => StatusCode::BAD_REQUEST,
                DistributionError::Unauthorized { .. }
                | DistributionError::Signing(_)
                | DistributionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                DistributionError::InsufficientSupply { .. }
                | DistributionError::SimulationReverted { .. }
                | DistributionError::Reverted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                DistributionError::DuplicateInFlight => StatusCode::CONFLICT,
                DistributionError::Unavailable(_)
                | DistributionError::Network(_)
                | DistributionError::Unconfirmed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            success: false,
            error: self.to_string(),
            kind: self.kind().to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub kind: String,
}
