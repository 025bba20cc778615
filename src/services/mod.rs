pub mod error;
pub mod ocr;
pub mod prompt;
pub mod providers;
pub mod transcript;
