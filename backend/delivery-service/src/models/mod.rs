pub mod conversation;
pub mod message;
pub mod read_marker;

pub use conversation::ConversationMute;
pub use message::{
    truncate_chars, Attachment, DeliveryStatus, HistoryQuery, InsertOutcome, Message, NewMessage,
    StatusChange,
};
pub use read_marker::ReadMarker;
