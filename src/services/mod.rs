//! Gateway services, leaves first: the store contract and its local
//! backend, the bucket-bound client facade, the three core components, and
//! the `FileService` state that ties them together for the HTTP layer.

pub mod archive_extractor;
pub mod chunked_upload;
pub mod file_service;
pub mod listing;
pub mod local_store;
pub mod object_store;
pub mod store_client;
