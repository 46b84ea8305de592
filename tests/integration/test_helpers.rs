//! Shared helpers for scheduler-level integration tests.
//!
//! Provides an in-memory [`FakeTracker`], a `GlobalConfig` whose agent is a
//! `sh -c` script, and a workspace layout that never needs `git clone`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use issue_autopilot::config::GlobalConfig;
use issue_autopilot::models::ticket::{Author, DiscussionThread, Note, Ticket};
use issue_autopilot::persistence::db;
use issue_autopilot::persistence::session_repo::SessionRepo;
use issue_autopilot::tracker::{Tracker, TrackerFuture};
use issue_autopilot::AppError;

pub const PROJECT: &str = "group/service";
pub const BOT_HANDLE: &str = "claude-bot";
pub const SESSION_ID: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

/// Upper bound for any eventually-true assertion.
pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct FakeState {
    tickets: HashMap<u64, Ticket>,
    notes: HashMap<u64, Vec<Note>>,
    label_writes: Vec<(u64, Vec<String>)>,
    comments: Vec<(u64, String)>,
    next_note_id: u64,
}

/// In-memory tracker recording every mutation.
pub struct FakeTracker {
    project: String,
    state: Mutex<FakeState>,
}

impl FakeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            project: PROJECT.to_owned(),
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn add_ticket(&self, iid: u64, labels: &[&str]) {
        let ticket = Ticket {
            id: iid + 1000,
            iid,
            title: format!("Ticket {iid}"),
            description: Some("Make the service faster.".into()),
            state: "opened".into(),
            labels: labels.iter().map(|&l| l.to_owned()).collect(),
            author: Author::new("Alice", "alice"),
            web_url: format!("https://gitlab.example.com/{PROJECT}/-/issues/{iid}"),
        };
        self.lock().tickets.insert(iid, ticket);
    }

    pub fn add_note(&self, iid: u64, name: &str, username: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.next_note_id += 1;
        let note = Note {
            id: state.next_note_id,
            body: format!("comment from {username}"),
            created_at: at,
            system: false,
            author: Author::new(name, username),
        };
        state.notes.entry(iid).or_default().push(note);
    }

    pub fn labels_of(&self, iid: u64) -> Vec<String> {
        self.lock()
            .tickets
            .get(&iid)
            .map(|t| t.labels.clone())
            .unwrap_or_default()
    }

    pub fn label_writes(&self) -> Vec<(u64, Vec<String>)> {
        self.lock().label_writes.clone()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.lock().comments.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake tracker state poisoned")
    }
}

impl Tracker for FakeTracker {
    fn project_path(&self) -> &str {
        &self.project
    }

    fn list_tickets<'a>(
        &'a self,
        labels: &'a [String],
        state: &'a str,
    ) -> TrackerFuture<'a, Vec<Ticket>> {
        Box::pin(async move {
            let guard = self.lock();
            let mut found: Vec<Ticket> = guard
                .tickets
                .values()
                .filter(|t| t.state == state && labels.iter().all(|l| t.has_label(l)))
                .cloned()
                .collect();
            found.sort_by_key(|t| t.iid);
            Ok(found)
        })
    }

    fn get_ticket(&self, iid: u64) -> TrackerFuture<'_, Ticket> {
        Box::pin(async move {
            self.lock()
                .tickets
                .get(&iid)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("ticket {iid}")))
        })
    }

    fn set_labels<'a>(&'a self, iid: u64, labels: &'a [String]) -> TrackerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            let ticket = state
                .tickets
                .get_mut(&iid)
                .ok_or_else(|| AppError::NotFound(format!("ticket {iid}")))?;
            ticket.labels = labels.to_vec();
            state.label_writes.push((iid, labels.to_vec()));
            Ok(())
        })
    }

    fn create_comment<'a>(&'a self, iid: u64, body: &'a str) -> TrackerFuture<'a, Note> {
        Box::pin(async move {
            let mut state = self.lock();
            state.next_note_id += 1;
            let note = Note {
                id: state.next_note_id,
                body: body.to_owned(),
                created_at: Utc::now(),
                system: false,
                author: Author::new("Claude Bot", BOT_HANDLE),
            };
            state.notes.entry(iid).or_default().push(note.clone());
            state.comments.push((iid, body.to_owned()));
            Ok(note)
        })
    }

    fn list_discussions(&self, iid: u64) -> TrackerFuture<'_, Vec<DiscussionThread>> {
        Box::pin(async move {
            let state = self.lock();
            let threads = state
                .notes
                .get(&iid)
                .map(|notes| {
                    notes
                        .iter()
                        .map(|n| DiscussionThread {
                            id: format!("d{}", n.id),
                            notes: vec![n.clone()],
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(threads)
        })
    }
}

/// Temp workspace root holding `service/.git`, so no clone happens.
pub fn workspace() -> (tempfile::TempDir, PathBuf) {
    let root = tempfile::tempdir().expect("temp workspace");
    let checkout = root.path().join("service");
    std::fs::create_dir_all(checkout.join(".git")).expect("fake checkout");
    (root, checkout)
}

/// Config whose agent runs `script` under `sh -c`.
pub fn test_config(workspace_root: &Path, script: &str) -> GlobalConfig {
    let toml = format!(
        r#"
workspace_root = '{root}'

[gitlab]
url = "https://gitlab.example.com"
username = "{BOT_HANDLE}"
project = "{PROJECT}"

[agent]
command = "sh"
flags = ["-c", '{script}', "agent"]

[daemon]
interval_seconds = 1
shutdown_grace_seconds = 1
completion_settle_millis = 0
"#,
        root = workspace_root.display(),
    );
    GlobalConfig::from_toml_str(&toml).expect("valid test config")
}

pub async fn memory_store() -> SessionRepo {
    let pool = db::connect_memory().await.expect("in-memory db");
    SessionRepo::new(Arc::new(pool))
}

/// Current process environment as a snapshot map.
pub fn current_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

/// Agent script that announces [`SESSION_ID`] on stdout and exits `code`.
pub fn announcing_agent(code: i32) -> String {
    format!(
        r#"echo "{{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"{SESSION_ID}\"}}"; exit {code}"#
    )
}

/// Local HTTP endpoint that accepts connections and never answers, so a
/// `git clone` against it hangs until killed.
pub async fn silent_remote() -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("listener address");
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (format!("http://{addr}"), handle)
}
