//! Maps handler failures onto stable error codes

use super::types::ToolErrorInfo;
use crate::error::StoreError;

pub const CODE_IO: &str = "io_error";
pub const CODE_INVALID_JSON: &str = "invalid_json";
pub const CODE_STORAGE: &str = "storage_error";
pub const CODE_PERMISSION: &str = "permission_denied";
pub const CODE_NOT_FOUND: &str = "not_found";
pub const CODE_EXECUTION: &str = "execution_error";
pub const CODE_VERSION_CONFLICT: &str = "version_conflict";
pub const CODE_INVALID_REQUEST: &str = "invalid_request";

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &anyhow::Error) -> ToolErrorInfo;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, err: &anyhow::Error) -> ToolErrorInfo {
        let message = format!("{:#}", err);

        for cause in err.chain() {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                let code = match io.kind() {
                    std::io::ErrorKind::NotFound => CODE_NOT_FOUND,
                    std::io::ErrorKind::PermissionDenied => CODE_PERMISSION,
                    _ => CODE_IO,
                };
                return ToolErrorInfo::new(code, message);
            }
            if cause.downcast_ref::<serde_json::Error>().is_some() {
                return ToolErrorInfo::new(CODE_INVALID_JSON, message);
            }
            if let Some(store) = cause.downcast_ref::<StoreError>() {
                let code = match store {
                    StoreError::NotFound(_) => CODE_NOT_FOUND,
                    StoreError::Serialization(_) => CODE_INVALID_JSON,
                    StoreError::VersionConflict { .. } => CODE_VERSION_CONFLICT,
                    StoreError::InvalidRequest(_) => CODE_INVALID_REQUEST,
                    _ => CODE_STORAGE,
                };
                return ToolErrorInfo::new(code, message);
            }
            if cause.downcast_ref::<rusqlite::Error>().is_some() {
                return ToolErrorInfo::new(CODE_STORAGE, message);
            }
        }

        let lower = message.to_lowercase();
        let code = if lower.contains("permission") {
            CODE_PERMISSION
        } else if lower.contains("not found") {
            CODE_NOT_FOUND
        } else {
            CODE_EXECUTION
        };
        ToolErrorInfo::new(code, message)
    }
}
