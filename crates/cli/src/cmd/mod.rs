//! CLI command implementations

pub mod add;
pub mod cache;
pub mod checkout;
pub mod commit;
pub mod exp;
pub mod gc;
pub mod init;
pub mod metrics;
pub mod params;
pub mod plots;
pub mod remote;
pub mod repro;
pub mod status;
pub mod transfer;
