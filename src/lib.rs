#![forbid(unsafe_code)]

pub mod assemble;
pub mod cli;
pub mod config_store;
pub mod crawl;
pub mod document;
pub mod export;
pub mod fallback;
pub mod formats;
pub mod harvest;
pub mod logging;
pub mod media;
pub mod openai;
pub mod resolve;
pub mod session;
pub mod transform;
