pub mod client;
pub mod messages;

pub use client::OkxClient;
