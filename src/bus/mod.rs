pub mod broker;
pub mod consumer;
pub mod producer;
pub mod retention;
pub mod topic;
