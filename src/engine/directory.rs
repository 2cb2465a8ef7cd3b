use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn create_resource(&self, name: &str) -> Result<Resource, EngineError> {
        validate_name(name)?;
        if self.store.resource_count().await? >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let resource = Resource {
            id: Ulid::new(),
            name: name.to_string(),
        };
        // The store's unique index decides between concurrent creators.
        self.store.insert_resource(resource.clone()).await.inspect_err(|e| {
            debug!("resource {name:?} rejected: {e}");
        })?;

        metrics::counter!(crate::observability::RESOURCES_CREATED_TOTAL).increment(1);
        info!(id = %resource.id, "created resource {name:?}");
        Ok(resource)
    }

    /// Look up a resource by a client-supplied identifier.
    pub async fn get_resource(&self, raw_id: &str) -> Result<Resource, EngineError> {
        let id = parse_id(raw_id)?;
        self.resource(id).await
    }

    pub async fn resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        self.store
            .resource_by_id(id)
            .await?
            .ok_or(EngineError::ResourceNotFound(id))
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, EngineError> {
        Ok(self.store.all_resources().await?)
    }

    /// Case-sensitive prefix match. An empty prefix matches everything;
    /// rejecting it is up to the caller.
    pub async fn find_resources_by_name_prefix(&self, prefix: &str) -> Result<Vec<Resource>, EngineError> {
        Ok(self.store.resources_by_name_prefix(prefix).await?)
    }
}
