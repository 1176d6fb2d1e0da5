use serde::{Deserialize, Serialize};

/// Body of a successful prediction
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PredictResponse {
    pub text: String,
}

/// Body of every error response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}
