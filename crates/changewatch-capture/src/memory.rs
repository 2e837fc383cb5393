//! In-process [`Connection`] for tests and local runs.
//!
//! Answers the three administrative commands the pipeline sends, serves
//! change feeds from notifications pushed with [`MemoryConnection::emit`],
//! and records every insert. Faults can be injected at each seam.
//!
//! Emitted notifications are kept in a per-collection history so a feed
//! opened with a resume token replays everything after that token.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use changewatch_core::{
    Document, ID_FIELD, Principal, PrincipalProfile, RoleRef, into_document,
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use crate::connection::{ChangeStream, Connection, FullDocumentBeforeChange, WatchOptions};
use crate::error::{DriverError, DriverResult};

type FeedSender = mpsc::UnboundedSender<DriverResult<Document>>;

#[derive(Default)]
struct State {
    connected: bool,
    principal: Option<Principal>,
    users: Vec<PrincipalProfile>,
    coll_mod_failure: Option<String>,
    coll_mod_calls: Vec<String>,
    images_enabled: HashSet<String>,
    feeds: HashMap<String, Vec<FeedSender>>,
    history: HashMap<String, Vec<Document>>,
    watch_requests: Vec<(String, WatchOptions)>,
    inserts: Vec<(String, Document)>,
    failing_watches: u32,
    failing_inserts: u32,
    sequence: u64,
}

/// An in-memory database session.
pub struct MemoryConnection {
    state: Mutex<State>,
    watch_opened: Notify,
    inserted: Notify,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryConnection")
            .field("connected", &state.connected)
            .field("principal", &state.principal)
            .field("inserts", &state.inserts.len())
            .finish_non_exhaustive()
    }
}

impl MemoryConnection {
    /// A connected session with no authenticated principal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                connected: true,
                ..State::default()
            }),
            watch_opened: Notify::new(),
            inserted: Notify::new(),
        }
    }

    /// A connected session authenticated as `auditor@admin` holding `root`.
    #[must_use]
    pub fn with_admin() -> Self {
        let conn = Self::new();
        let principal = Principal::new("auditor", "admin");
        conn.add_user(PrincipalProfile::new(&principal).with_role(RoleRef::new("root", "admin")));
        conn.authenticate_as(principal);
        conn
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Mark the session connected or disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// Set the principal reported by `connectionStatus`.
    pub fn authenticate_as(&self, principal: Principal) {
        self.state().principal = Some(principal);
    }

    /// Add or replace a user registry entry.
    pub fn add_user(&self, profile: PrincipalProfile) {
        let mut state = self.state();
        state
            .users
            .retain(|u| !(u.user == profile.user && u.db == profile.db));
        state.users.push(profile);
    }

    /// Make every subsequent `collMod` reply `ok: 0` with `message`.
    pub fn fail_coll_mod(&self, message: impl Into<String>) {
        self.state().coll_mod_failure = Some(message.into());
    }

    /// Enable image retention on `collection` without a `collMod`.
    pub fn enable_images(&self, collection: &str) {
        self.state().images_enabled.insert(collection.to_owned());
    }

    /// Fail the next `count` feed opens.
    pub fn fail_next_watches(&self, count: u32) {
        self.state().failing_watches = count;
    }

    /// Fail the next `count` inserts.
    pub fn fail_next_inserts(&self, count: u32) {
        self.state().failing_inserts = count;
    }

    // ------------------------------------------------------------------
    // Feeds
    // ------------------------------------------------------------------

    /// Push a raw change notification onto `collection`'s feeds.
    ///
    /// A resume token (`_id`) and namespace are filled in when absent.
    /// The before-image is stripped unless retention is enabled on the
    /// collection. Returns how many open feeds received it.
    pub fn emit(&self, collection: &str, notification: Value) -> usize {
        let mut raw = into_document(notification).unwrap_or_default();
        let mut state = self.state();

        state.sequence = state.sequence.wrapping_add(1);
        let sequence = state.sequence;
        raw.entry(ID_FIELD)
            .or_insert_with(|| json!({ "_data": format!("{sequence:016x}") }));
        raw.entry("ns")
            .or_insert_with(|| json!({ "db": "test", "coll": collection }));
        if !state.images_enabled.contains(collection) {
            raw.remove("fullDocumentBeforeChange");
        }

        state
            .history
            .entry(collection.to_owned())
            .or_default()
            .push(raw.clone());

        let feeds = state.feeds.entry(collection.to_owned()).or_default();
        feeds.retain(|tx| !tx.is_closed());
        feeds
            .iter()
            .filter(|tx| tx.send(Ok(raw.clone())).is_ok())
            .count()
    }

    /// Push a feed fault onto `collection`'s open feeds.
    pub fn fail_feed(&self, collection: &str, message: &str) {
        let mut state = self.state();
        if let Some(feeds) = state.feeds.get_mut(collection) {
            for tx in feeds.iter() {
                let _ = tx.send(Err(DriverError::Stream {
                    collection: collection.to_owned(),
                    message: message.to_owned(),
                }));
            }
            feeds.clear();
        }
    }

    /// End every open feed on `collection`.
    pub fn close_feeds(&self, collection: &str) {
        self.state().feeds.remove(collection);
    }

    /// Number of feeds on `collection` still being read.
    #[must_use]
    pub fn open_feeds(&self, collection: &str) -> usize {
        self.state()
            .feeds
            .get(collection)
            .map_or(0, |feeds| feeds.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Options of every successful feed open on `collection`, in order.
    #[must_use]
    pub fn watch_requests(&self, collection: &str) -> Vec<WatchOptions> {
        self.state()
            .watch_requests
            .iter()
            .filter(|(name, _)| name == collection)
            .map(|(_, options)| options.clone())
            .collect()
    }

    /// Wait until `count` feeds in total have been opened on `collection`.
    pub async fn wait_for_watchers(&self, collection: &str, count: usize) {
        loop {
            let notified = self.watch_opened.notified();
            if self.watch_requests(collection).len() >= count {
                return;
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    /// Every document inserted into `collection`, in insert order.
    #[must_use]
    pub fn inserted(&self, collection: &str) -> Vec<Document> {
        self.state()
            .inserts
            .iter()
            .filter(|(name, _)| name == collection)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Wait until `count` documents in total have been inserted into `collection`.
    pub async fn wait_for_inserts(&self, collection: &str, count: usize) {
        loop {
            let notified = self.inserted.notified();
            if self.inserted(collection).len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Give spawned tasks a moment to act, then report the insert count.
    pub async fn settle(&self, collection: &str, window: Duration) -> usize {
        tokio::time::sleep(window).await;
        self.inserted(collection).len()
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Collections named in `collMod` commands, in order.
    #[must_use]
    pub fn coll_mod_calls(&self) -> Vec<String> {
        self.state().coll_mod_calls.clone()
    }

    /// Whether image retention is enabled on `collection`.
    #[must_use]
    pub fn images_enabled(&self, collection: &str) -> bool {
        self.state().images_enabled.contains(collection)
    }

    fn connection_status(&self) -> Document {
        let state = self.state();
        let users: Vec<Value> = state
            .principal
            .iter()
            .map(|p| json!({ "user": p.user, "db": p.db }))
            .collect();
        object(json!({
            "ok": 1,
            "authInfo": { "authenticatedUsers": users, "authenticatedUserRoles": [] },
        }))
    }

    fn users_info(&self, command: &Document) -> DriverResult<Document> {
        let target = command
            .get("usersInfo")
            .cloned()
            .and_then(|v| serde_json::from_value::<Principal>(v).ok())
            .ok_or_else(|| DriverError::Command {
                command: "usersInfo".into(),
                message: "expected { user, db }".into(),
            })?;
        let show_privileges = command
            .get("showPrivileges")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let state = self.state();
        let mut users = Vec::new();
        for profile in state
            .users
            .iter()
            .filter(|u| u.user == target.user && u.db == target.db)
        {
            let mut entry = profile.clone();
            if !show_privileges {
                entry.privileges.clear();
                entry.inherited_privileges.clear();
            }
            users.push(serde_json::to_value(entry).map_err(|e| DriverError::Command {
                command: "usersInfo".into(),
                message: e.to_string(),
            })?);
        }
        Ok(object(json!({ "ok": 1, "users": users })))
    }

    fn coll_mod(&self, command: &Document) -> DriverResult<Document> {
        let collection = command
            .get("collMod")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Command {
                command: "collMod".into(),
                message: "expected a collection name".into(),
            })?
            .to_owned();
        let enable = command
            .get("changeStreamPreAndPostImages")
            .and_then(|v| v.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut state = self.state();
        state.coll_mod_calls.push(collection.clone());
        if let Some(message) = &state.coll_mod_failure {
            return Ok(object(json!({ "ok": 0, "errmsg": message, "code": 72 })));
        }
        if enable {
            state.images_enabled.insert(collection);
        } else {
            state.images_enabled.remove(&collection);
        }
        Ok(object(json!({ "ok": 1 })))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn run_command(&self, command: Document) -> DriverResult<Document> {
        if !self.is_connected() {
            return Err(DriverError::Disconnected);
        }
        let name = command.keys().next().cloned().unwrap_or_default();
        match name.as_str() {
            "connectionStatus" => Ok(self.connection_status()),
            "usersInfo" => self.users_info(&command),
            "collMod" => self.coll_mod(&command),
            _ => Err(DriverError::Command {
                command: name,
                message: "no such command".into(),
            }),
        }
    }

    async fn watch(&self, collection: &str, options: WatchOptions) -> DriverResult<ChangeStream> {
        let rx = {
            let mut state = self.state();
            if !state.connected {
                return Err(DriverError::Disconnected);
            }
            if state.failing_watches > 0 {
                state.failing_watches = state.failing_watches.saturating_sub(1);
                return Err(DriverError::Stream {
                    collection: collection.to_owned(),
                    message: "injected watch failure".into(),
                });
            }
            if options.full_document_before_change == FullDocumentBeforeChange::Required
                && !state.images_enabled.contains(collection)
            {
                return Err(DriverError::Stream {
                    collection: collection.to_owned(),
                    message: "before-images required but retention is disabled".into(),
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(token) = &options.resume_after {
                let history = state
                    .history
                    .get(collection)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let position = history
                    .iter()
                    .position(|doc| doc.get(ID_FIELD) == Some(&token.0));
                if let Some(pos) = position {
                    for doc in history.iter().skip(pos.saturating_add(1)) {
                        let _ = tx.send(Ok(doc.clone()));
                    }
                }
            }
            state
                .feeds
                .entry(collection.to_owned())
                .or_default()
                .push(tx);
            state.watch_requests.push((collection.to_owned(), options));
            rx
        };
        self.watch_opened.notify_waiters();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> DriverResult<()> {
        {
            let mut state = self.state();
            if !state.connected {
                return Err(DriverError::Disconnected);
            }
            if state.failing_inserts > 0 {
                state.failing_inserts = state.failing_inserts.saturating_sub(1);
                return Err(DriverError::Write {
                    collection: collection.to_owned(),
                    message: "injected write failure".into(),
                });
            }
            state.inserts.push((collection.to_owned(), document));
        }
        self.inserted.notify_waiters();
        Ok(())
    }
}

fn object(value: Value) -> Document {
    into_document(value).unwrap_or_default()
}
