use serde::{Deserialize, Serialize};

/// `GET <api_url>?length=..` success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    pub checkwork_addresses: Vec<String>,
    pub range: RangeHex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeHex {
    pub start: String,
    pub end: String,
}

/// Error bodies are `{"error": "..."}` but the pool is not strict about
/// it, so every field is optional at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub error: String,
}

/// `POST <api_url>/submit` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitKeys {
    pub private_keys: Vec<String>,
}
