pub mod args;
pub mod auth;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod content;
pub mod deferred;
pub mod exec;
pub mod files;
pub mod pipeline;
pub mod publish;
pub mod remote;
pub mod runtime;

#[cfg(test)]
mod test_support;
