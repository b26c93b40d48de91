//! # Chunkstream Testkit
//!
//! Testing utilities for chunkstream.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: in-memory test nodes, connected pairs and a scripted raw
//!   protocol peer for misbehaviour scenarios
//! - **Generators**: Proptest strategies for property-based testing
//! - **Simulation**: an N-node chain that checks full replication
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use chunkstream_sync::MemoryNetwork;
//! use chunkstream_testkit::fixtures::{connect, TestNode};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let (a, b) = (TestNode::new(), TestNode::new());
//!     connect(&network, &a, &b).await?;
//!
//!     let addresses = a.upload(b"shared").await?;
//!     assert_eq!(b.download(&addresses).await?, b"shared");
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use chunkstream_testkit::generators::{node_id, sync_stream};
//!
//! proptest! {
//!     #[test]
//!     fn cursor_keys_differ_per_peer(a in node_id(), b in node_id(), s in sync_stream()) {
//!         prop_assume!(a != b);
//!         prop_assert_ne!(cursor_key(&a, &s), cursor_key(&b, &s));
//!     }
//! }
//! ```
//!
//! ## Simulation
//!
//! ```rust,no_run
//! use chunkstream_testkit::simulation::{run_chain, ChainConfig};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let report = run_chain(ChainConfig::with_nodes(8)).await?;
//!     assert!(report.is_synced() || report.is_inconclusive());
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod simulation;

pub use fixtures::{connect, fast_config, init_tracing, wait_until, ScriptedPeer, TestNode};
pub use simulation::{run_chain, ChainConfig, ChainOutcome, ChainReport};
