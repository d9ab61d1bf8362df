//! synod-node: peer-to-peer coordination fabric for autonomous work agents
//!
//! Each node discovers its peers on the local network, advertises its
//! capabilities and load, claims work items atomically through an external
//! tracker, debates plans with peers on per-item topics, and escalates to a
//! human when the conversation calls for it. Every significant event lands
//! in a per-node hash-chained ledger.

pub mod clients;
pub mod config;
pub mod coordination;
pub mod discussion;
pub mod dispatch;
pub mod engine;
pub mod ledger;
pub mod messaging;
pub mod p2p;
pub mod presence;
pub mod tasks;

pub use config::Config;
pub use ledger::{Ledger, LedgerEntry, LedgerEvent};
pub use messaging::{Envelope, MessageFabric, MessageType};
pub use tasks::{ItemState, Repository, WorkItem};
