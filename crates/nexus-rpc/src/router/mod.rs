//! Router implementation with builder pattern
//!
//! A router is a flat map from dotted path to [`Procedure`](crate::procedure::Procedure),
//! assembled from nested builders and checked once at build time:
//!
//! ```rust,ignore
//! let router = Router::builder()
//!     .config(RpcConfig::default())
//!     .procedure("health", health)
//!     .merge("post", posts())
//!     .build()?;
//!
//! let post = router
//!     .call(CallOptions::new("post.byId", ProcedureType::Query, json!({"id": "1"})))
//!     .await?;
//! ```

mod builder;
mod core;

pub use builder::{RESERVED_WORDS, RouterBuilder};
pub use core::Router;
