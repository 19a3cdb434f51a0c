pub mod agents;
pub mod config;
pub mod errors;
pub mod init;
pub mod logging;
pub mod pipeline;
pub mod store;
pub mod util;
