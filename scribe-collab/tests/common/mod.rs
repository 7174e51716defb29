//! Shared helpers: a relay on a free port and clients wired to it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use scribe_collab::client::CollabClient;
use scribe_collab::config::{CollabConfig, ReconnectPolicy};
use scribe_collab::document::Document;
use scribe_collab::editor::{MemoryEditor, StaticCredentials, StaticIdentity};
use scribe_collab::relay::{RelayConfig, RelayServer};
use scribe_collab::transport::TransportSession;

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return it with its url.
pub async fn start_relay() -> (Arc<RelayServer>, String) {
    let port = free_port().await;
    let server = Arc::new(RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
    }));
    let listener = server.bind().await.unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

/// Short timings so tests settle quickly.
pub fn fast_config(url: &str) -> CollabConfig {
    CollabConfig {
        server_url: url.to_string(),
        edit_debounce: Duration::from_millis(50),
        cursor_debounce: Duration::from_millis(20),
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
        join_retry_delay: Duration::from_millis(50),
        join_retry_limit: None,
    }
}

/// Transport authenticated as `userId:userName`, not yet connected.
pub fn transport(url: &str, user_id: &str, user_name: &str) -> Arc<TransportSession> {
    let credentials = Arc::new(StaticCredentials::new(format!("{user_id}:{user_name}")));
    Arc::new(TransportSession::from_config(&fast_config(url), credentials))
}

pub struct Peer {
    pub client: CollabClient<MemoryEditor>,
    pub transport: Arc<TransportSession>,
}

/// A started client on `note_id` with a connecting transport.
pub fn peer(url: &str, note_id: &str, user_id: &str, user_name: &str) -> Peer {
    peer_with(url, note_id, user_id, user_name, false)
}

pub fn peer_with(url: &str, note_id: &str, user_id: &str, user_name: &str, read_only: bool) -> Peer {
    let transport = transport(url, user_id, user_name);
    let (editor, events) = MemoryEditor::new(Document::from_paragraphs(&["Title", "Body"]));
    let mut client = CollabClient::new(
        note_id,
        transport.clone(),
        Arc::new(StaticIdentity::new(user_id)),
        &fast_config(url),
        editor,
        events,
    )
    .read_only(read_only);
    client.start();
    transport.connect().unwrap();
    Peer { client, transport }
}

impl Peer {
    /// Drive until `done` holds, giving up after two seconds.
    pub async fn drive_until<F>(&mut self, mut done: F) -> bool
    where
        F: FnMut(&CollabClient<MemoryEditor>) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !done(&self.client) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            self.client.drive(tokio::time::sleep(Duration::from_millis(10))).await;
        }
        true
    }

    /// Drive for a fixed period.
    pub async fn settle(&mut self, period: Duration) {
        self.client.drive(tokio::time::sleep(period)).await;
    }

    pub async fn joined(&mut self) -> bool {
        self.drive_until(|c| c.session().is_joined()).await
    }
}
