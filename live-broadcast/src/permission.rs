use async_trait::async_trait;

use crate::error::PermissionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Platform prompt for camera and microphone access.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_camera_and_mic(&self) -> Result<PermissionStatus, PermissionError>;
}

/// Gate for platforms that do not prompt at runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoGrant;

#[async_trait]
impl PermissionGate for AutoGrant {
    async fn request_camera_and_mic(&self) -> Result<PermissionStatus, PermissionError> {
        Ok(PermissionStatus::Granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_grant_always_grants() {
        assert_eq!(
            AutoGrant.request_camera_and_mic().await,
            Ok(PermissionStatus::Granted)
        );
    }
}
