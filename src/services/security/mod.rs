pub mod scan;
pub mod validator;

pub use scan::{ScanVerdict, scan_upload};
pub use validator::{UploadLimits, ValidationError, validate_upload};
