use actix_web::{
    web::{Data, Json},
    HttpResponse,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{handlers::ApiError, state::AppState};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeRequest {
    pub donor_address: String,
    pub usd_value: f64,
    /// Wait for the receipt before answering. Defaults to true.
    #[serde(default = "wait_for_receipt")]
    pub confirm: bool,
}

fn wait_for_receipt() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeResponse {
    pub success: bool,
    pub transaction_hash: String,
    /// Token base units as a decimal string.
    pub token_amount: String,
    pub replayed: bool,
    pub confirmed: bool,
}

pub async fn distribute_handler(
    state: Data<AppState>,
    payload: Json<DistributeRequest>,
) -> Result<HttpResponse, ApiError> {
    let request = payload.into_inner();
    match state
        .monitor()
        .distribute(&request.donor_address, request.usd_value, request.confirm)
        .await
    {
        Ok(receipt) => {
            Ok(HttpResponse::Ok().json(DistributeResponse {
                success: true,
                transaction_hash: format!("{:#x}", receipt.tx_hash),
                token_amount: receipt.token_amount.to_string(),
                replayed: receipt.replayed,
                confirmed: receipt.confirmed,
            }))
        }
        Err(err) => {
            warn!(donor = %request.donor_address, kind = err.kind(), error = %err, "distribution request failed");
            Err(err.into())
        }
    }
}
