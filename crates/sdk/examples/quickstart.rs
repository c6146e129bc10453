//! A minimal chat-style client: subscribe to a table, watch it change, and
//! call a reducer, all without generated bindings.
//!
//! Run a SpacetimeDB with the quickstart-chat module published, then:
//!
//! ```sh
//! cargo run --example quickstart -- localhost:3000 quickstart-chat
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use stdb_dyn_sdk::{
    ClientConfig, ClientObserver, ConnectionId, DbClient, Identity, Row, TableChanges,
};

struct ChatObserver;

impl ClientObserver for ChatObserver {
    fn on_connect(&self, identity: &Identity, _connection_id: &ConnectionId, _token: &str) {
        println!("connected as {identity}");
    }

    fn on_insert(&self, table: &str, row: &Row) {
        if table == "message" {
            if let Some(text) = row.get("text").and_then(|v| v.as_string()) {
                println!("new message: {text}");
            }
        }
    }

    fn on_transaction(&self, changes: &[TableChanges]) -> stdb_dyn_sdk::RowEventDispatch {
        log::debug!("transaction touching {} tables", changes.len());
        stdb_dyn_sdk::RowEventDispatch::Dispatch
    }

    fn on_disconnect(&self, reason: &str, attempt: u32) {
        eprintln!("disconnected (attempt {attempt}): {reason}");
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "localhost:3000".to_string());
    let database = args.next().unwrap_or_else(|| "quickstart-chat".to_string());

    let config = ClientConfig::builder(host, database)
        .with_subscriptions(["SELECT * FROM message", "SELECT * FROM user"])
        .build();
    let client = DbClient::start(config, Arc::new(ChatObserver))?;

    // Let the snapshot land, then say hello.
    std::thread::sleep(std::time::Duration::from_secs(1));
    println!("{} messages so far", client.count("message"));

    let mut send_args = HashMap::new();
    send_args.insert("text".to_string(), "hello from the dynamic SDK".into());
    match client.call_reducer("send_message", &send_args) {
        Ok(request_id) => println!("send_message requested ({request_id})"),
        Err(e) => eprintln!("send_message failed: {e}"),
    }

    std::thread::sleep(std::time::Duration::from_secs(5));
    client.disconnect();
    Ok(())
}
