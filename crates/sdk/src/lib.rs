//! A dynamic, schema-driven Rust SDK for clients to interface with
//! SpacetimeDB.
//!
//! Unlike the codegen SDK, nothing about the database is known at compile
//! time: the client fetches the schema over HTTP at startup, decodes
//! subscribed rows into dynamic [`Row`] values against it, and encodes
//! reducer arguments from name-keyed maps. Server-driven activity reaches
//! the application through a [`ClientObserver`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use stdb_dyn_sdk::{ClientConfig, DbClient, NoopObserver};
//!
//! let config = ClientConfig::builder("localhost:3000", "quickstart-chat")
//!     .with_subscriptions(["SELECT * FROM message"])
//!     .build();
//! let client = DbClient::start(config, Arc::new(NoopObserver)).unwrap();
//! println!("{} messages", client.count("message"));
//! ```

mod cache;
mod callbacks;
mod client;
mod connection;
mod error;
mod event;
mod row;
mod websocket;

pub mod schema;

pub use callbacks::{ClientObserver, NoopObserver};
pub use client::{ClientConfig, ClientConfigBuilder, DbClient};
pub use connection::ReconnectPolicy;
pub use error::ClientError;
pub use event::{QueryResultRows, ReducerOutcomeEvent, RowEventDispatch, TableChanges};
pub use row::Row;
pub use schema::{fetch_schema, Column, ReducerDef, Schema, SchemaError, TableDef};

pub use stdb_dyn_client_messages::websocket::{ProcedureStatus, TimeDuration, Timestamp};
pub use stdb_dyn_client_messages::{Compression, ConnectionId, Identity};
pub use stdb_dyn_sats::{AlgebraicType, AlgebraicValue};
