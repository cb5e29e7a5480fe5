//! Replicated key/value records, assets and local capabilities.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::core::{
    Asset, DataEvent, DataFilter, DataItem, DataValue, PutDataRequest, StatusCode, Transport, TransportError, WearEvent,
};
use crate::infrastructure::events::ConsumerRegistry;
use crate::utils::{check_not_empty, in_dispatch};

/// Map a transport change batch to consumer events, one per item
pub fn data_events(batch: Vec<DataEvent>) -> Vec<WearEvent> {
    batch
        .into_iter()
        .map(|event| match event {
            DataEvent::Changed(item) => WearEvent::DataChanged(item),
            DataEvent::Deleted { path } => WearEvent::DataDeleted { path },
        })
        .collect()
}

pub struct DataLayer {
    transport: Arc<dyn Transport>,
    registry: Arc<ConsumerRegistry>,
    runtime: Handle,
    /// Capabilities this node registered and removes again on cleanup
    watched: Mutex<HashSet<String>>,
}

impl DataLayer {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<ConsumerRegistry>, runtime: Handle) -> Self {
        Self {
            transport,
            registry,
            runtime,
            watched: Mutex::new(HashSet::new()),
        }
    }

    fn watched(&self) -> MutexGuard<'_, HashSet<String>> {
        self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write a single typed value under `key` of the record at `path`
    pub async fn sync(&self, path: &str, key: &str, value: impl Into<DataValue>, urgent: bool) -> StatusCode {
        let mut request = PutDataRequest::create(path);
        request.data_mut().put(key, value);
        self.sync_data(request, urgent).await
    }

    /// Write `bytes` as an asset under `key` of the record at `path`
    pub async fn sync_asset(&self, path: &str, key: &str, bytes: Vec<u8>, urgent: bool) -> StatusCode {
        let mut request = PutDataRequest::create(path);
        request.data_mut().put(key, Asset::from_bytes(bytes));
        self.sync_data(request, urgent).await
    }

    /// Like [`sync_asset`](Self::sync_asset), optionally stamping the record with the write time
    pub async fn put_asset(
        &self,
        path: &str,
        key: &str,
        bytes: Vec<u8>,
        urgent: bool,
        add_timestamp: bool,
    ) -> StatusCode {
        let mut request = PutDataRequest::create(path);
        request.data_mut().put(key, Asset::from_bytes(bytes));
        if add_timestamp {
            request = request.with_timestamp();
        }
        self.sync_data(request, urgent).await
    }

    /// Write a record. Rejected without retry when the transport is not connected.
    pub async fn sync_data(&self, mut request: PutDataRequest, urgent: bool) -> StatusCode {
        let path = request.path.clone();
        if !self.transport.is_connected() {
            error!(%path, "Failed to sync data: not connected");
            let status = StatusCode::ApiNotConnected;
            self.registry.publish(WearEvent::SendDataResult { path, status });
            return status;
        }

        if urgent {
            request = request.set_urgent();
        }
        let status = match self.transport.put_data_item(request).await {
            Ok(_) => {
                debug!(%path, urgent, "Record synced");
                StatusCode::Success
            }
            Err(e) => {
                error!(%path, "Failed to sync record: {}", e);
                e.status()
            }
        };
        self.registry.publish(WearEvent::SendDataResult { path, status });
        status
    }

    /// Write a prepared request as is, urgent flag included
    pub async fn put_data_item(&self, request: PutDataRequest) -> Result<DataItem, TransportError> {
        let path = request.path.clone();
        let result = self.transport.put_data_item(request).await;
        let status = status_of(&result);
        if let Err(e) = &result {
            error!(%path, "put_data_item failed: {}", e);
        }
        self.registry.publish(WearEvent::SendDataResult { path, status });
        result
    }

    pub async fn get_data_items(&self) -> Result<Vec<DataItem>, TransportError> {
        let result = self.transport.get_data_items().await;
        self.publish_items(result)
    }

    /// Records selected by `path` under `filter`
    pub async fn get_data_items_matching(
        &self,
        path: &str,
        filter: DataFilter,
    ) -> Result<Vec<DataItem>, TransportError> {
        let result = self
            .transport
            .get_data_items()
            .await
            .map(|items| items.into_iter().filter(|item| filter.matches(path, &item.path)).collect());
        self.publish_items(result)
    }

    fn publish_items(&self, result: Result<Vec<DataItem>, TransportError>) -> Result<Vec<DataItem>, TransportError> {
        let (status, items) = match &result {
            Ok(items) => (StatusCode::Success, items.clone()),
            Err(e) => {
                error!("get_data_items failed: {}", e);
                (e.status(), Vec::new())
            }
        };
        self.registry.publish(WearEvent::GetDataItems { status, items });
        result
    }

    pub async fn get_data_item(&self, path: &str) -> Result<Option<DataItem>, TransportError> {
        let result = self.transport.get_data_item(path).await;
        let (status, item) = match &result {
            Ok(item) => (StatusCode::Success, item.clone()),
            Err(e) => {
                error!(%path, "get_data_item failed: {}", e);
                (e.status(), None)
            }
        };
        self.registry.publish(WearEvent::GetDataItem { status, item });
        result
    }

    /// Returns the number of records removed
    pub async fn delete_data_items(&self, path: &str) -> Result<usize, TransportError> {
        self.delete_data_items_matching(path, DataFilter::Literal).await
    }

    pub async fn delete_data_items_matching(&self, path: &str, filter: DataFilter) -> Result<usize, TransportError> {
        let result = self.transport.delete_data_items(path, filter).await;
        let status = status_of(&result);
        let deleted = *result.as_ref().unwrap_or(&0);
        if let Err(e) = &result {
            error!(%path, "delete_data_items failed: {}", e);
        }
        self.registry.publish(WearEvent::DeleteDataItemsResult {
            path: path.to_string(),
            status,
            deleted,
        });
        result
    }

    pub async fn load_asset(&self, asset: &Asset) -> Result<Vec<u8>, TransportError> {
        self.transport.load_asset(asset).await
    }

    /// Run `operation` to completion on the calling thread, bounded by `timeout`.
    ///
    /// Plain threads and `spawn_blocking` threads are fine. Event dispatch and
    /// consumer handlers are refused, as is any thread of a current-thread
    /// runtime; on a multi-thread worker the worker is handed off first.
    fn block_on<T, F>(&self, operation: &str, timeout: Duration, future: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if in_dispatch() {
            error!(operation, "Blocking call made from event dispatch");
            return Err(TransportError::WrongThread);
        }

        let run = || {
            self.runtime.block_on(async {
                match tokio::time::timeout(timeout, future).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(operation, ?timeout, "Blocking call timed out");
                        Err(TransportError::Timeout)
                    }
                }
            })
        };
        match Handle::try_current() {
            Err(_) => run(),
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(run),
            Ok(_) => {
                error!(operation, "Blocking call made on a current-thread runtime");
                Err(TransportError::WrongThread)
            }
        }
    }

    pub fn put_data_item_blocking(&self, request: PutDataRequest, timeout: Duration) -> Result<DataItem, TransportError> {
        self.block_on("put_data_item", timeout, self.put_data_item(request))
    }

    pub fn get_data_items_blocking(&self, timeout: Duration) -> Result<Vec<DataItem>, TransportError> {
        self.block_on("get_data_items", timeout, self.get_data_items())
    }

    pub fn get_data_item_blocking(&self, path: &str, timeout: Duration) -> Result<Option<DataItem>, TransportError> {
        self.block_on("get_data_item", timeout, self.get_data_item(path))
    }

    pub fn delete_data_items_blocking(&self, path: &str, timeout: Duration) -> Result<usize, TransportError> {
        self.block_on("delete_data_items", timeout, self.delete_data_items(path))
    }

    pub fn load_asset_blocking(&self, asset: &Asset, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.block_on("load_asset", timeout, self.load_asset(asset))
    }

    /// Advertise capabilities of this node; successful ones are tracked for cleanup
    pub async fn add_capabilities(&self, capabilities: &[&str]) -> Vec<(String, StatusCode)> {
        let mut results = Vec::with_capacity(capabilities.len());
        for &capability in capabilities {
            let status = if !check_not_empty(capability, "capability") {
                StatusCode::DeveloperError
            } else {
                match self.transport.add_local_capability(capability).await {
                    Ok(()) => {
                        self.watched().insert(capability.to_string());
                        info!(capability, "Capability added");
                        StatusCode::Success
                    }
                    Err(e) => {
                        error!(capability, "Failed to add capability: {}", e);
                        e.status()
                    }
                }
            };
            self.registry.publish(WearEvent::AddCapabilityResult {
                capability: capability.to_string(),
                status,
            });
            results.push((capability.to_string(), status));
        }
        results
    }

    pub async fn remove_capabilities(&self, capabilities: &[&str]) -> Vec<(String, StatusCode)> {
        let mut results = Vec::with_capacity(capabilities.len());
        for &capability in capabilities {
            let status = if !check_not_empty(capability, "capability") {
                StatusCode::DeveloperError
            } else {
                match self.transport.remove_local_capability(capability).await {
                    Ok(()) => {
                        self.watched().remove(capability);
                        info!(capability, "Capability removed");
                        StatusCode::Success
                    }
                    Err(e) => {
                        error!(capability, "Failed to remove capability: {}", e);
                        e.status()
                    }
                }
            };
            self.registry.publish(WearEvent::RemoveCapabilityResult {
                capability: capability.to_string(),
                status,
            });
            results.push((capability.to_string(), status));
        }
        results
    }

    /// Capabilities added through this layer and not yet removed
    pub fn watched_capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = self.watched().iter().cloned().collect();
        capabilities.sort();
        capabilities
    }

    pub async fn remove_watched_capabilities(&self) -> Vec<(String, StatusCode)> {
        let watched = self.watched_capabilities();
        let names: Vec<&str> = watched.iter().map(String::as_str).collect();
        self.remove_capabilities(&names).await
    }
}

fn status_of<T>(result: &Result<T, TransportError>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::Success,
        Err(e) => e.status(),
    }
}
