//! routecast - Real-time namespace router for WebSocket applications
//!
//! Routes messages arriving on WebSocket namespaces to controller actions,
//! runs pre/post filter chains around them and acknowledges each caller
//! with the action's reply.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → Server → Namespace → pre filters → Action
//!                                                    ↓ reply
//! Client (ack) ←──────────────────── post filters ←──┘
//! ```
//!
//! Configuration is read once into a [`Container`]; [`Kernel::boot`]
//! resolves it into an immutable snapshot shared by every connection.
//! Namespace-wide broadcasts travel through a pluggable pub/sub store
//! (in-process or PostgreSQL LISTEN/NOTIFY).

pub mod bridge;
pub mod client;
pub mod config;
pub mod container;
pub mod context;
pub mod controller;
pub mod events;
pub mod filter;
pub mod hub;
pub mod kernel;
pub mod log;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod store;

pub use bridge::{Ack, Bridge, BridgeError, Namespace};
pub use client::{Client, ClientError, ServerEvent};
pub use config::{Config, ConfigError};
pub use container::{Container, Tag};
pub use context::{ReplyError, Request, Response, build_request, build_response};
pub use controller::{Action, action_fn};
pub use events::{Event, EventDispatcher, EventPayload, Listener, ListenerBinding, listener_fn};
pub use filter::{Filter, FilterOutcome, FilterRunner, Phase, filter_fn};
pub use hub::{Broadcaster, Hub};
pub use kernel::{BootError, Kernel};
pub use log::{LogSink, TracingSink};
pub use protocol::{Envelope, ProtocolError, ServerFrame};
pub use router::{Route, RouteError, RouteTable};
pub use server::{IdentityResolver, Server};
pub use session::{Connection, ConnectionRef};
pub use store::{MemoryPubSub, PostgresPubSub, PubSub, StoreSelection};
