use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Service id of the per-worker service manager.
pub const SERVICE_MANAGER_ID: &str = "worker-service-manager";

pub const CONFIGURATION_TYPE: &str = "configuration";

/// Requests understood by the service manager running in every worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServiceManagerRequest {
    #[serde(rename = "create-service", rename_all = "camelCase")]
    CreateService {
        target_service_type: String,
        target_service_id: String,
    },
    #[serde(rename = "destroy-service", rename_all = "camelCase")]
    DestroyService { target_service_id: String },
}

/// Requests served by a decoder service.
///
/// Binary tile data is not part of the JSON body; it travels in transfer
/// slot 0 and `data` is omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DecoderRequest {
    #[serde(rename = "decode-tile-request", rename_all = "camelCase")]
    DecodeTile {
        tile_key: u64,
        projection: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    #[serde(rename = "tile-info-request", rename_all = "camelCase")]
    TileInfo {
        tile_key: u64,
        projection: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// Tile payload handed to a decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum TileData {
    /// Moved to the worker as a transferable buffer.
    Binary(Bytes),
    /// Serialized into the request.
    Json(Value),
}

impl TileData {
    /// Split into the JSON part and the transfer list.
    pub(crate) fn into_parts(self) -> (Option<Value>, Vec<Bytes>) {
        match self {
            TileData::Binary(buffer) => (None, vec![buffer]),
            TileData::Json(value) => (Some(value), Vec::new()),
        }
    }
}

/// One-way configuration message broadcast to a decoder service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationMessage {
    pub service: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_options: Option<Value>,
}
