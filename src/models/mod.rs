pub mod health;
pub mod diagnostics;
pub mod client_config;
pub mod error;

pub use health::*;
pub use diagnostics::*;
pub use client_config::*;
pub use error::*;
