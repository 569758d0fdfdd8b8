pub mod accounts;
pub mod assignments;
pub mod chat;
pub mod core;
pub mod materials;
pub mod progress;
pub mod push_tokens;
