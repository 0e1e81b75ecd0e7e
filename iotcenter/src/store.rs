pub mod flux;
pub mod influx;
pub mod line_protocol;
pub mod memory;

use crate::errors::Result;
use crate::model::{Authorization, AuthorizationRequest, Bucket};
use async_trait::async_trait;
use flux::{FluxQuery, FluxRecord};
use line_protocol::Point;

/// Operations the service needs from the time-series database.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<Bucket>>;

    /// `Ok(None)` when no bucket has that name.
    async fn find_bucket_by_name(&self, name: &str) -> Result<Option<Bucket>>;

    async fn create_authorization(&self, request: &AuthorizationRequest) -> Result<Authorization>;

    /// Appends points; returns once the store has acknowledged the write.
    async fn write(&self, bucket: &str, points: &[Point]) -> Result<()>;

    async fn query(&self, query: &FluxQuery) -> Result<Vec<FluxRecord>>;

    /// Runs Flux text as-is and returns the store's annotated CSV body.
    async fn query_csv(&self, flux: &str) -> Result<String>;
}
