use async_trait::async_trait;

use crate::error::Error;

pub mod postgres;
pub mod rate_limiting;
pub mod sync_queue;

pub use rate_limiting::*;
pub use sync_queue::*;

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}
