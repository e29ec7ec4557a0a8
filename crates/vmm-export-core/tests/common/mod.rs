//! In-memory DSM used by the integration tests.
//!
//! Guests change state immediately when told to (power off, power on), export
//! tasks finish after a configurable number of status polls, and any call can be
//! overridden with a canned reply. Every request is recorded.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use vmm_export_core::{DsmClient, Error, Result, Transport};

/// A canned reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Body(Value),
    Timeout,
}

/// One request the fake received.
#[derive(Debug, Clone)]
pub struct Call {
    pub api: String,
    pub method: String,
    pub params: HashMap<String, String>,
}

#[derive(Debug)]
struct FakeGuest {
    id: String,
    name: String,
    status: String,
}

#[derive(Debug, Default)]
struct FakeState {
    guests: Vec<FakeGuest>,
    tasks: HashMap<String, usize>,
    next_task: u64,
    task_polls: usize,
    overrides: HashMap<String, VecDeque<Reply>>,
    calls: Vec<Call>,
}

#[derive(Debug, Default)]
pub struct FakeDsm {
    state: Mutex<FakeState>,
}

pub fn ok(data: Value) -> Value {
    json!({"success": true, "data": data})
}

pub fn fail(code: i64) -> Value {
    json!({"success": false, "error": {"code": code}})
}

impl FakeDsm {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.state.lock().unwrap().next_task = 42;
        Arc::new(fake)
    }

    pub fn with_guest(self: Arc<Self>, id: &str, name: &str, status: &str) -> Arc<Self> {
        self.state.lock().unwrap().guests.push(FakeGuest {
            id: id.to_string(),
            name: name.to_string(),
            status: status.to_string(),
        });
        self
    }

    /// Export tasks report `finish: false` this many times before finishing.
    pub fn with_task_polls(self: Arc<Self>, polls: usize) -> Arc<Self> {
        self.state.lock().unwrap().task_polls = polls;
        self
    }

    /// Queue a reply for the next request matching `key`.
    ///
    /// `key` is the method name (`poweron`, `list`, `get`, ...) or, for task status,
    /// `get:<task_id>`.
    pub fn push_reply(&self, key: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .overrides
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Register an outstanding task without going through export.
    pub fn add_task(&self, task_id: &str, polls: usize) {
        self.state
            .lock()
            .unwrap()
            .tasks
            .insert(task_id.to_string(), polls);
    }

    pub fn set_status(&self, name: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(guest) = state.guests.iter_mut().find(|g| g.name == name) {
            guest.status = status.to_string();
        }
    }

    pub fn status(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .guests
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.status.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls_to(method).len()
    }

    fn dispatch(state: &mut FakeState, call: &Call) -> Value {
        let param = |key: &str| call.params.get(key).cloned().unwrap_or_default();
        match call.method.as_str() {
            "login" => ok(json!({"sid": "fake-sid"})),
            "logout" => json!({"success": true}),
            "list" => {
                let guests: Vec<Value> = state
                    .guests
                    .iter()
                    .map(|g| {
                        json!({
                            "guest_id": g.id,
                            "guest_name": g.name,
                            "status": g.status,
                            "autorun": 0
                        })
                    })
                    .collect();
                ok(json!({"guests": guests}))
            }
            "poweroff" | "poweron" => {
                let status = if call.method == "poweroff" { "shutdown" } else { "running" };
                let name = param("guest_name");
                match state.guests.iter_mut().find(|g| g.name == name) {
                    Some(guest) => {
                        guest.status = status.to_string();
                        json!({"success": true})
                    }
                    None => fail(401),
                }
            }
            "delete" => json!({"success": true}),
            "export" => {
                let task_id = state.next_task.to_string();
                state.next_task += 1;
                state.tasks.insert(task_id.clone(), state.task_polls);
                ok(json!({"task_id": task_id.parse::<u64>().unwrap()}))
            }
            "get" => {
                let task_id = param("task_id");
                match state.tasks.get_mut(&task_id) {
                    Some(0) => ok(json!({"finish": true, "success": true})),
                    Some(remaining) => {
                        *remaining -= 1;
                        ok(json!({"finish": false}))
                    }
                    None => fail(1000),
                }
            }
            _ => fail(103),
        }
    }
}

impl Transport for FakeDsm {
    fn get(&self, _url: &str, query: &[(String, String)], _: Option<Duration>) -> Result<String> {
        let params: HashMap<String, String> = query.iter().cloned().collect();
        let call = Call {
            api: params.get("api").cloned().unwrap_or_default(),
            method: params.get("method").cloned().unwrap_or_default(),
            params,
        };

        let mut state = self.state.lock().unwrap();
        state.calls.push(call.clone());

        let keyed = call
            .params
            .get("task_id")
            .map(|id| format!("{}:{id}", call.method));
        let reply = keyed
            .iter()
            .chain(std::iter::once(&call.method))
            .find_map(|key| state.overrides.get_mut(key).and_then(VecDeque::pop_front));

        match reply {
            Some(Reply::Timeout) => Err(Error::timeout("/webapi/entry.cgi")),
            Some(Reply::Body(body)) => Ok(body.to_string()),
            None => Ok(Self::dispatch(&mut state, &call).to_string()),
        }
    }
}

/// A logged-in client talking to `fake`.
pub fn client(fake: &Arc<FakeDsm>) -> DsmClient<Arc<FakeDsm>> {
    let mut client = DsmClient::new(Arc::clone(fake), "nas:5000");
    client.login("admin", "secret").unwrap();
    client
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}
