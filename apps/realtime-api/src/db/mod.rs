//! Storage collaborators: a key-value abstraction and the presence status
//! store built on top of it.

pub mod kv;
pub mod status;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value at `{key}`: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}
