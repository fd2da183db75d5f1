pub mod caldav;
pub mod config;
pub mod error;
pub mod extractor;
pub mod hub;
pub mod instagram;
pub mod llm;
pub mod media;
pub mod ocr;
pub mod response;
pub mod service;

pub use error::{Error, Result};
