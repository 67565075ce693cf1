pub mod bus;
pub mod classifier;
pub mod dedup;
pub mod handler;
pub mod lark_client;
pub mod types;

pub use bus::{reply_loop, BusError, ReplyBus, ReplyJob};
pub use classifier::{extract_text, ActionableMessage, Classifier, Decision, SelfIdentity};
pub use dedup::DedupStore;
pub use handler::{PipelineOutcome, ReplyPipeline};
pub use lark_client::{LarkMessenger, Messenger, TransportError};
pub use types::{Delivery, EventType, MalformedPayloadError, MessageRef, SenderKind, MESSAGE_RECEIVE_EVENT};
