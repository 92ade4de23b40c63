//! Tile decoder backed by a shared worker set.
//!
//! Every decoder owns one service instance per worker, created through the
//! worker-side service manager on first `connect`. Decoders hold a reference
//! on the worker set, so the pool stops once the last decoder is gone and
//! restarts when a new one is created.

use std::sync::atomic::{AtomicBool, Ordering};

use nanoid::nanoid;
use serde_json::Value;
use tokio::sync::OnceCell;
use worker_pool::{ConcurrentWorkerSet, PoolError, Reply, RequestToken, WorkerMessage};

use crate::requests::{
    CONFIGURATION_TYPE, ConfigurationMessage, DecoderRequest, SERVICE_MANAGER_ID,
    ServiceManagerRequest, TileData,
};

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

pub struct WorkerBasedDecoder {
    worker_set: ConcurrentWorkerSet,
    service_type: String,
    service_id: String,
    service_created: OnceCell<()>,
    disposed: AtomicBool,
}

impl WorkerBasedDecoder {
    /// Bind a new decoder service of `service_type` to `worker_set`.
    pub fn new(worker_set: ConcurrentWorkerSet, service_type: impl Into<String>) -> Self {
        let service_type = service_type.into();
        let service_id = format!("{}-{}", service_type, nanoid!(12, &ID_ALPHABET));
        worker_set.add_reference();
        Self {
            worker_set,
            service_type,
            service_id,
            service_created: OnceCell::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn worker_count(&self) -> usize {
        self.worker_set.worker_count()
    }

    /// Wait for the workers, then create this decoder's service on each of
    /// them. Only the first successful call creates the service.
    pub async fn connect(&self) -> Result<(), PoolError> {
        self.worker_set.connect(SERVICE_MANAGER_ID).await?;
        self.service_created
            .get_or_try_init(|| async {
                let request = ServiceManagerRequest::CreateService {
                    target_service_type: self.service_type.clone(),
                    target_service_id: self.service_id.clone(),
                };
                self.worker_set
                    .broadcast_request(SERVICE_MANAGER_ID, to_value(&request), Vec::new())
                    .await?;
                tracing::debug!("Created decoder service {}", self.service_id);
                Ok::<(), PoolError>(())
            })
            .await?;
        Ok(())
    }

    pub async fn decode_tile(
        &self,
        data: TileData,
        tile_key: u64,
        projection: &str,
        token: Option<RequestToken>,
    ) -> Result<Reply, PoolError> {
        let (data, transfer) = data.into_parts();
        let request = DecoderRequest::DecodeTile {
            tile_key,
            projection: projection.to_string(),
            data,
        };
        self.worker_set
            .invoke_request(self.service_id.as_str(), to_value(&request), transfer, token)
            .await
    }

    pub async fn get_tile_info(
        &self,
        data: TileData,
        tile_key: u64,
        projection: &str,
        token: Option<RequestToken>,
    ) -> Result<Reply, PoolError> {
        let (data, transfer) = data.into_parts();
        let request = DecoderRequest::TileInfo {
            tile_key,
            projection: projection.to_string(),
            data,
        };
        self.worker_set
            .invoke_request(self.service_id.as_str(), to_value(&request), transfer, token)
            .await
    }

    /// Send new options to this decoder's service on every worker.
    pub async fn configure(
        &self,
        options: Option<Value>,
        custom_options: Option<Value>,
    ) -> Result<(), PoolError> {
        let message = ConfigurationMessage {
            service: self.service_id.clone(),
            kind: CONFIGURATION_TYPE,
            options,
            custom_options,
        };
        let event = WorkerMessage::Event {
            service: self.service_id.clone(),
            payload: to_value(&message),
        };
        self.worker_set.broadcast_message(event, Vec::new()).await
    }

    /// Destroy the remote service and release the worker set.
    pub async fn dispose(self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let request = destroy_request(&self.service_id);
        // The workers may already be gone.
        if let Err(err) = self
            .worker_set
            .broadcast_request(SERVICE_MANAGER_ID, request, Vec::new())
            .await
        {
            tracing::debug!("Destroying service {} failed: {}", self.service_id, err);
        }
        self.worker_set.release_service(self.service_id.as_str());
        self.worker_set.remove_reference();
    }
}

impl Drop for WorkerBasedDecoder {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker_set.release_service(self.service_id.as_str());
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.worker_set.remove_reference();
            return;
        };
        let worker_set = self.worker_set.clone();
        let request = destroy_request(&self.service_id);
        handle.spawn(async move {
            let _ = worker_set
                .broadcast_request(SERVICE_MANAGER_ID, request, Vec::new())
                .await;
            worker_set.remove_reference();
        });
    }
}

impl std::fmt::Debug for WorkerBasedDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBasedDecoder")
            .field("service_id", &self.service_id)
            .field("service_created", &self.service_created.initialized())
            .finish()
    }
}

fn destroy_request(service_id: &str) -> Value {
    to_value(&ServiceManagerRequest::DestroyService {
        target_service_id: service_id.to_string(),
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    // Plain derived structs with string keys always serialize.
    serde_json::to_value(value).unwrap_or(Value::Null)
}
