use actix_web::{web::Data, HttpResponse};
use chainops_monitor::StatusSnapshot;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::AppState;

pub async fn status_handler(state: Data<AppState>) -> HttpResponse {
    let snapshot: StatusSnapshot = state.monitor().status();
    HttpResponse::Ok().json(snapshot)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestartResponse {
    pub success: bool,
    pub message: String,
}

/// Always answers 200; the body carries the outcome.
pub async fn restart_handler(state: Data<AppState>) -> HttpResponse {
    let outcome = state.monitor().restart().await;
    if outcome.success {
        info!(message = %outcome.message, "monitoring restarted");
    } else {
        warn!(message = %outcome.message, "monitoring restart failed");
    }
    HttpResponse::Ok().json(RestartResponse {
        success: outcome.success,
        message: outcome.message,
    })
}
