pub mod audit;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod identity;
pub mod ledger;
pub mod policy;
pub mod probe;
pub mod runtime;
pub mod sources;
pub mod storage;
