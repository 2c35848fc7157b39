// Copyright (C) 2026 Palisade Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Palisade gateway library
//!
//! A JSON-RPC admission gateway for blockchain execution nodes: method
//! allow-lists, transaction admission rules, distributed stock-based rate
//! limiting over a shared backing store, and duplex WebSocket session
//! proxying between clients and the upstream node.

pub mod blocknum;
pub mod census;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod manager;
pub mod rules;
pub mod server;
pub mod session;
pub mod stock;
pub mod store;
pub mod tx;

pub use config::RulesConfig;
pub use error::GatewayError;
pub use gateway::ProxyGateway;
pub use limiter::{LimiterSettings, RateLimiter};
pub use server::{GatewayServer, GatewayServerBuilder, StoreConfig};
