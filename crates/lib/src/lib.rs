//! docchat core library: streaming chat replies and document upload tracking against the
//! analysis backend, used by the CLI.

pub mod assembler;
pub mod backend;
pub mod chat;
pub mod config;
pub mod init;
pub mod poller;
pub mod session;
pub mod sse;
pub mod upload;
