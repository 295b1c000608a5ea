//! # Tern
//!
//! A distributed-object runtime. A process exposes root objects over a
//! listener; peers get proxies to them, call methods as if they were local,
//! and pass objects and proxies back and forth inside arguments and results.
//! Exported objects are reference counted per peer and reclaimed when no peer
//! and no running call can reach them.
//!
//! ```rust,ignore
//! let roots = Roots::new().with("duck_tester", duck_tester());
//! let server = Server::bind(roots, SessionConfig::default());
//! tokio::spawn(async move { server.serve(listener).await });
//!
//! let roots = connect(channel).named(["duck_tester"]);
//! let tester = roots.get("duck_tester").unwrap();
//! let verdict = tester.call("is_it_a_duck", vec![duck.into()]).await?;
//! ```

pub mod channel;
mod codec;
pub mod config;
mod dispatch;
pub mod error;
pub mod exports;
pub mod gc;
pub mod handles;
pub mod object;
pub mod proxy;
mod refs;
pub mod server;
pub mod session;
pub mod value;

pub use channel::Channel;
pub use channel::ChannelError;
pub use channel::Listener;
pub use channel::MemoryChannel;
pub use channel::StreamChannel;
pub use channel::memory_listener;
pub use config::SessionConfig;
pub use error::Error;
pub use error::RemoteError;
pub use error::Result;
pub use exports::ExportTable;
pub use exports::Exported;
pub use gc::GcStats;
pub use handles::ObjectId;
pub use handles::PeerId;
pub use object::Object;
pub use object::ObjectBuilder;
pub use object::WeakObject;
pub use object::arg;
pub use proxy::Proxy;
pub use server::RootFactory;
pub use server::RootSet;
pub use server::Roots;
pub use server::Server;
pub use server::connect;
pub use server::connect_with;
pub use server::serve;
pub use session::Session;
pub use session::SessionState;
pub use session::SessionStats;
pub use ternwire::ErrorKind;
pub use value::Value;

#[cfg(test)]
mod tests;
