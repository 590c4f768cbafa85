pub mod client;
pub mod gate;
pub mod retry;

pub use client::{ProjectLookup, TokenResponse, UpstreamClient};
pub use gate::RateGate;
