pub mod citation;
pub mod content;
pub mod history;
pub mod identity;
pub mod thread;
