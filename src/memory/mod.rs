//! 记忆层：对话历史（仅追加）

pub mod conversation;

pub use conversation::{Message, MessageHistory, Role};
