pub mod http;
pub mod lark;

pub use http::{router, AppState, Server};
pub use lark::{compute_signature, decrypt_event, DecryptError};
