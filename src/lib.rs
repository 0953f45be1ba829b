pub mod config;
pub mod error;
pub mod mptcp;
pub mod net;
pub mod proto;
pub mod sim;

#[cfg(test)]
mod test;
