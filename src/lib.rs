//! pathprobe -- UDP/TCP path reachability and throughput prober.
//!
//! A client and a cooperating server exchange small tagged tests over a set
//! of ports to learn which protocols get through NATs and firewalls, then
//! compare UDP and TCP throughput in both directions on the first port where
//! both work.

pub mod clock;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod server;
pub mod trace;
pub mod transport;
pub mod wire;
