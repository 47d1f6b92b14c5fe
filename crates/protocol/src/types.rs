use serde::{Deserialize, Serialize};

/// Upload session lifecycle state as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Open,
    Verifying,
    Completed,
    Failed,
    Expired,
}

/// Snapshot of an upload session returned by `get_upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    pub upload_id: String,
    pub state: UploadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    /// Current artifact length in bytes.
    pub current_size: u64,
    /// Seconds since the last successful write.
    pub idle_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_state_lowercase() {
        assert_eq!(
            serde_json::to_string(&UploadState::Verifying).unwrap(),
            "\"verifying\""
        );
        let s: UploadState = serde_json::from_str("\"expired\"").unwrap();
        assert_eq!(s, UploadState::Expired);
    }

    #[test]
    fn upload_info_json() {
        let info = UploadInfo {
            upload_id: "u1".into(),
            state: UploadState::Open,
            declared_size: Some(4096),
            target_path: None,
            current_size: 4096,
            idle_secs: 3,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"uploadId\":\"u1\""));
        assert!(json.contains("\"state\":\"open\""));
        assert!(json.contains("\"currentSize\":4096"));
        assert!(!json.contains("targetPath"));

        let parsed: UploadInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
