//! In-memory container runtime for tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{ClientFactory, ContainerClient, Error, Result, RuntimeKind, SimpleProcess};

#[derive(Default)]
struct FakeState {
    pid: i32,
    procs: Vec<SimpleProcess>,
    paused: HashSet<String>,
    removed: HashSet<String>,
    failing: HashSet<String>,
    calls: Vec<String>,
}

/// Records every call as `"<op> <id> [<extra>]"`. Operations listed with
/// [`FakeClient::fail_on`] return `CommandFailed`.
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self {
        let c = Self::default();
        c.state.lock().unwrap().pid = 1000;
        c
    }

    pub fn set_pid(&self, pid: i32) {
        self.state.lock().unwrap().pid = pid;
    }

    pub fn set_processes(&self, procs: &[(i32, &str)]) {
        self.state.lock().unwrap().procs = procs
            .iter()
            .map(|(pid, cmd)| SimpleProcess {
                pid: *pid,
                cmd: cmd.to_string(),
            })
            .collect();
    }

    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn is_paused(&self, id: &str) -> bool {
        self.state.lock().unwrap().paused.contains(id)
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.state.lock().unwrap().removed.contains(id)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, op: &str, call: String) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(call.clone());
        if st.failing.contains(op) {
            return Err(Error::CommandFailed {
                cmd: call,
                code: 1,
                stderr: format!("{} failed", op),
            });
        }
        Ok(st)
    }
}

#[async_trait]
impl ContainerClient for FakeClient {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn get_pid_by_id(&self, id: &str) -> Result<i32> {
        let st = self.record("get_pid_by_id", format!("get_pid_by_id {}", id))?;
        if st.pid <= 0 || st.removed.contains(id) {
            return Err(Error::NotRunning { id: id.to_string() });
        }
        Ok(st.pid)
    }

    async fn get_all_pid_list(&self, id: &str) -> Result<Vec<SimpleProcess>> {
        let st = self.record("get_all_pid_list", format!("get_all_pid_list {}", id))?;
        Ok(st.procs.clone())
    }

    async fn exec(&self, id: &str, cmd: &str) -> Result<String> {
        self.record("exec", format!("exec {} {}", id, cmd))?;
        Ok(String::new())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.record("kill", format!("kill {}", id)).map(|_| ())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let mut st = self.record("pause", format!("pause {}", id))?;
        st.paused.insert(id.to_string());
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        let mut st = self.record("unpause", format!("unpause {}", id))?;
        if !st.paused.remove(id) {
            return Err(Error::NotPaused { id: id.to_string() });
        }
        Ok(())
    }

    async fn rmf(&self, id: &str) -> Result<()> {
        let mut st = self.record("rmf", format!("rmf {}", id))?;
        st.removed.insert(id.to_string());
        Ok(())
    }

    async fn restart(&self, id: &str, wait_secs: u64) -> Result<()> {
        self.record("restart", format!("restart {} {}", id, wait_secs))
            .map(|_| ())
    }

    async fn cp_file(&self, id: &str, src: &Path, dst: &str) -> Result<()> {
        self.record("cp_file", format!("cp_file {} {} {}", id, src.display(), dst))
            .map(|_| ())
    }

    async fn list_id(&self) -> Result<Vec<String>> {
        self.record("list_id", "list_id".to_string())?;
        Ok(Vec::new())
    }
}

/// Hands out the same `FakeClient` for every runtime kind.
pub struct FakeFactory {
    client: Arc<FakeClient>,
    created: Arc<Mutex<Vec<RuntimeKind>>>,
}

impl FakeFactory {
    pub fn new(client: Arc<FakeClient>) -> Self {
        Self {
            client,
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Kinds built so far, in order.
    pub fn created(&self) -> Arc<Mutex<Vec<RuntimeKind>>> {
        self.created.clone()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create(&self, kind: RuntimeKind) -> Result<Arc<dyn ContainerClient>> {
        self.created.lock().unwrap().push(kind);
        Ok(self.client.clone())
    }
}
