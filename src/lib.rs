//! tollgate — pay-per-request API gateway for autonomous agents.
//!
//! Agents call upstream HTTP APIs through the gateway. Each request is
//! matched to a priced route, pushed through a layered admission pipeline
//! (idempotency, signed spending mandate, x402 micropayment, agent policy),
//! proxied upstream, and closed out with a structured receipt.
//!
//! # Modules
//!
//! - [`config`] — environment-driven gateway configuration
//! - [`gateway`] — route table, replay store, SSRF checks, proxy, pipeline
//! - [`mandate`] — AP2 mandate verification and spend ledgers
//! - [`payment`] — 402 challenge/verify/settle gate over a facilitator
//! - [`policy`] — agent blacklist and reputation checks
//! - [`receipt`] — receipt engine: build, sign, store, query, stats
//! - [`api`] — HTTP surface (public dispatch + admin)
//! - [`utils`] — keccak hashing, EIP-191 recovery, USDC decimals, clock

pub mod api;
pub mod config;
pub mod gateway;
pub mod mandate;
pub mod payment;
pub mod policy;
pub mod receipt;
pub mod utils;

pub use config::GatewayConfig;
pub use gateway::pipeline::GatewayState;
