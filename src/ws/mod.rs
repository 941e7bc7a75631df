pub mod docsession;
pub mod handler;
pub mod message;
pub mod registry;
