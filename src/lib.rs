//! # uvwire
//!
//! A single-threaded native I/O handle bridge plus an incremental HTTP/1.x
//! framing parser.
//!
//! Every native resource (TCP and Unix sockets, UDP sockets, terminals,
//! child processes, timers, signal watchers) is wrapped in a handle owned by
//! one [`Reactor`]. Handles report through single-fire completions that the
//! reactor delivers from its run queue, writes complete in submission order,
//! and closing a handle cancels whatever it still had queued. The
//! [`http::Parser`] turns the bytes those handles read into framing events.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use uvwire::{
//!     AnyHandle, CapabilityToken, Completion, Handle, Listener, ReadEvent, Readable, Reactor,
//!     ReactorConfig, TcpHandle, Writable,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut reactor = Reactor::new(ReactorConfig::default())?;
//!     reactor.run(|ctx| {
//!         let server = TcpHandle::new(ctx, CapabilityToken::all()).unwrap();
//!         server.bind("127.0.0.1:8080".parse().unwrap()).unwrap();
//!         server.on_connection(|conn| {
//!             if let Ok(AnyHandle::Tcp(conn)) = conn {
//!                 let closer = conn.clone();
//!                 let done = Completion::new(move |_| closer.close_with(Completion::discard()));
//!                 conn.write_with(Bytes::from_static(b"hello\n"), done).unwrap();
//!             }
//!         });
//!         server.listen_default().unwrap();
//!
//!         let client = TcpHandle::new(ctx, CapabilityToken::all()).unwrap();
//!         let reader = client.clone();
//!         client.on_read(move |event| match event {
//!             ReadEvent::Data(data) => println!("{}", String::from_utf8_lossy(&data)),
//!             _ => reader.close_with(Completion::discard()),
//!         });
//!         let started = client.clone();
//!         client
//!             .connect_with(
//!                 "127.0.0.1:8080".parse().unwrap(),
//!                 Completion::new(move |status: Result<(), uvwire::NativeError>| {
//!                     if status.is_ok() {
//!                         let _ = started.read_start();
//!                     }
//!                 }),
//!             )
//!             .unwrap();
//!     })?;
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("uvwire wraps Unix descriptors and only builds on Unix targets");

pub mod capability;
pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
pub mod http;
pub mod native;
pub mod reactor;

pub use capability::{Capability, CapabilityGate, CapabilityToken};
pub use config::{ConfigError, ReactorConfig};
pub use error::{Error, NativeError, PermissionError, ProtocolError, Result, UsageError};
pub use handle::{
    AnyHandle, Completion, Encoding, Handle, HandleKind, HandleState, Listener, Pending, PipeHandle,
    ProcessHandle, ReadEvent, Readable, SignalHandle, TcpHandle, TimerHandle, TtyHandle, UdpHandle,
    Writable, WriteRequest,
};
pub use reactor::{HandleId, KeepAlive, Reactor, ReactorContext, ReactorError, Remote};
