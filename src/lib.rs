pub mod builder;
pub mod cli;
pub mod common;
pub mod intents;
pub mod op_pool;
pub mod rpc;
