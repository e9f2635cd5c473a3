//! Shared state handed to every handler.

use crate::services::{
    access_token::AccessTokenSigner,
    cluster::{NodeRegistry, PlacementService},
    delivery::StreamingDelivery,
    metadata::MetadataStore,
    storage::StorageService,
    upload::UploadService,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub metadata: MetadataStore,
    pub storage: StorageService,
    pub uploads: UploadService,
    pub delivery: StreamingDelivery,
    pub placement: PlacementService,
    pub registry: Arc<NodeRegistry>,
    pub signer: AccessTokenSigner,
    pub public_base_url: String,
}
