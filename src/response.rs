use crate::dispatch::Dispatched;
use crate::upstream::UpstreamFailure;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageGenerationResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub account_used: u32,
    pub data: Vec<ImageData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageData {
    pub b64_json: String,
    pub prompt: String,
    pub revised_prompt: String,
}

pub fn assemble_success(
    dispatched: Dispatched,
    prompt: &str,
    model: &str,
) -> ImageGenerationResponse {
    assemble_success_with(
        dispatched,
        prompt,
        model,
        uuid::Uuid::new_v4().to_string(),
        chrono::Utc::now().timestamp(),
    )
}

pub fn assemble_success_with(
    dispatched: Dispatched,
    prompt: &str,
    model: &str,
    id: String,
    created: i64,
) -> ImageGenerationResponse {
    ImageGenerationResponse {
        id,
        object: "image.generation".to_string(),
        created,
        model: model.to_string(),
        account_used: dispatched.account_used,
        data: vec![ImageData {
            b64_json: dispatched.image,
            prompt: prompt.to_string(),
            revised_prompt: prompt.to_string(),
        }],
    }
}

/// Error text for a pool in which every account was rate limited. Always
/// names the attempted accounts.
pub fn exhausted_message(attempted: &[u32], last_error: Option<&UpstreamFailure>) -> String {
    let tried = attempted
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let last = last_error
        .map(|err| err.message.as_str())
        .unwrap_or("no account was attempted");
    format!("All accounts are rate limited or out of quota (tried accounts: [{tried}]). Last error: {last}")
}
