//! L4 TCP proxy engine.
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyEngine -> EndpointDirectory (first endpoint) -> Backend
//!                 |
//!        client->backend task  (shuts down backend write half at EOF)
//!        backend->client task  (shuts down client write half at EOF)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let directory = Arc::new(EndpointDirectory::new("web", None, resolver, querier));
//! directory.start().await;
//!
//! let spec = ProxiedServiceSpec::new("web", "localhost", 9090);
//! ProxyEngine::start(spec, directory).await?;
//! ```

mod engine;
mod pipe;

pub use engine::{ProxyEngine, ProxyStats};
pub use pipe::pipe;
