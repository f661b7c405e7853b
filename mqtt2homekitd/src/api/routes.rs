use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::protocol::API_PREFIX;
use crate::accessory::Accessory;
use crate::bridge_manager::BridgeHandle;
use crate::codec::CharValue;
use crate::error::BridgeError;

/// HAP status codes reported per write
const STATUS_SUCCESS: i32 = 0;
const STATUS_COMMUNICATION_FAILURE: i32 = -70402;
const STATUS_RESOURCE_DOES_NOT_EXIST: i32 = -70409;
const STATUS_INVALID_VALUE: i32 = -70410;

#[derive(Clone)]
pub struct AppState {
    pub bridge: BridgeHandle,
}

#[derive(Debug, Deserialize)]
pub struct CharacteristicWrite {
    pub aid: u64,
    pub iid: u64,
    pub value: CharValue,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub characteristics: Vec<CharacteristicWrite>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WriteStatus {
    pub aid: u64,
    pub iid: u64,
    pub status: i32,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub characteristics: Vec<WriteStatus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{}/accessories", API_PREFIX), get(get_accessories))
        .route(
            &format!("{}/accessories/:accessory_id", API_PREFIX),
            get(get_accessory).delete(delete_accessory),
        )
        .route(&format!("{}/characteristics", API_PREFIX), put(put_characteristics))
        .with_state(state)
}

async fn get_accessories(State(state): State<AppState>) -> Result<Json<Vec<Accessory>>, StatusCode> {
    state.bridge.get_all().await.map(Json).map_err(|e| {
        tracing::error!("Failed to list accessories: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_accessory(
    State(state): State<AppState>,
    Path(accessory_id): Path<String>,
) -> Result<Json<Accessory>, StatusCode> {
    state
        .bridge
        .get_one(accessory_id)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query accessory: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_accessory(
    State(state): State<AppState>,
    Path(accessory_id): Path<String>,
) -> StatusCode {
    match state.bridge.remove_accessory(accessory_id).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Failed to remove accessory: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Controller writes. Each write is applied and published on its own; one
/// failing write does not stop the rest.
async fn put_characteristics(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> Json<WriteResponse> {
    let mut characteristics = Vec::with_capacity(request.characteristics.len());

    for write in request.characteristics {
        let status = match state.bridge.controller_write(write.aid, write.iid, write.value).await {
            Ok(reference) => {
                tracing::debug!("Controller wrote {:?}", reference);
                STATUS_SUCCESS
            }
            Err(e) => {
                tracing::warn!("Controller write {}.{} rejected: {}", write.aid, write.iid, e);
                match e.downcast_ref::<BridgeError>() {
                    Some(BridgeError::UnknownAccessory(_)) | Some(BridgeError::UnknownInstance { .. }) => {
                        STATUS_RESOURCE_DOES_NOT_EXIST
                    }
                    Some(BridgeError::InvalidCharacteristicValue { .. }) => STATUS_INVALID_VALUE,
                    _ => STATUS_COMMUNICATION_FAILURE,
                }
            }
        };
        characteristics.push(WriteStatus {
            aid: write.aid,
            iid: write.iid,
            status,
        });
    }

    Json(WriteResponse { characteristics })
}
