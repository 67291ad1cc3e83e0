#![forbid(unsafe_code)]

pub mod language;
pub mod model;
pub mod time;

pub use language::{Language, detect};
pub use time::Clock;
