pub mod file_handlers;
pub mod health_handlers;
pub mod identity;
pub mod internal_handlers;
pub mod upload_handlers;
