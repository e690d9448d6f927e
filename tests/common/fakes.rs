//! Fake provisioning backend, working-directory preparer and a store
//! backend that fails on demand

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::ResourceExt;
use serde_json::json;
use tokio::sync::watch;

use fleet_operator::provision::{
    ProvisionError, ProvisionOutput, ProvisionRequest, Provisioner, WorkdirPreparer,
};
use fleet_operator::store::{
    DeleteOutcome, MemoryBackend, ObjectBackend, StoreError, StoredObject, WatchEvent,
};
use fleet_operator::worker::LogSink;

/// A call made to the fake provisioner
#[derive(Debug, Clone)]
pub enum Call {
    CreateWorkspace(String),
    DeleteWorkspace(String),
    ForceUnlock(String),
    Apply(ProvisionRequest),
    Destroy(ProvisionRequest),
}

impl Call {
    pub fn workspace(&self) -> &str {
        match self {
            Call::CreateWorkspace(w) | Call::DeleteWorkspace(w) | Call::ForceUnlock(w) => w,
            Call::Apply(r) | Call::Destroy(r) => &r.workspace,
        }
    }
}

/// Records every call; apply and destroy can be held, or made to fail
pub struct FakeProvisioner {
    calls: Mutex<Vec<Call>>,
    state_workspaces: Mutex<BTreeSet<String>>,
    outputs: Mutex<BTreeMap<String, serde_json::Value>>,
    fail_apply: AtomicBool,
    fail_destroy: AtomicBool,
    open: watch::Sender<bool>,
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvisioner {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self {
            calls: Mutex::new(Vec::new()),
            state_workspaces: Mutex::new(BTreeSet::new()),
            outputs: Mutex::new(BTreeMap::from([
                ("vpc_id".to_string(), json!("vpc-new")),
                ("oidc_id".to_string(), json!("oidc-new")),
                ("vpc_public_subnets".to_string(), json!(["subnet-x", "subnet-y"])),
            ])),
            fail_apply: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            open,
        }
    }

    /// Pretend these provisioning-state workspaces already exist
    pub fn with_state_workspaces(self, names: &[&str]) -> Self {
        self.state_workspaces
            .lock()
            .unwrap()
            .extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Block apply and destroy until [`FakeProvisioner::release`]
    pub fn hold(&self) {
        self.open.send_replace(false);
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applies(&self) -> Vec<ProvisionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Apply(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn destroys(&self) -> Vec<ProvisionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Destroy(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn has_state_workspace(&self, name: &str) -> bool {
        self.state_workspaces.lock().unwrap().contains(name)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn create_workspace(&self, workspace: &str) -> Result<(), ProvisionError> {
        self.record(Call::CreateWorkspace(workspace.to_string()));
        if self.state_workspaces.lock().unwrap().insert(workspace.to_string()) {
            Ok(())
        } else {
            Err(ProvisionError::AlreadyExists(workspace.to_string()))
        }
    }

    async fn delete_workspace(&self, workspace: &str) -> Result<(), ProvisionError> {
        self.record(Call::DeleteWorkspace(workspace.to_string()));
        if self.state_workspaces.lock().unwrap().remove(workspace) {
            Ok(())
        } else {
            Err(ProvisionError::NotFound(workspace.to_string()))
        }
    }

    async fn force_unlock(&self, workspace: &str) -> Result<(), ProvisionError> {
        self.record(Call::ForceUnlock(workspace.to_string()));
        Err(ProvisionError::AlreadyUnlocked(workspace.to_string()))
    }

    async fn apply(
        &self,
        request: &ProvisionRequest,
        log: &LogSink,
    ) -> Result<ProvisionOutput, ProvisionError> {
        self.record(Call::Apply(request.clone()));
        log.line(format!("applying {}", request.workspace));
        self.wait_open().await;
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ProvisionError::Failed {
                subject: request.workspace.clone(),
                exit_code: Some(1),
                message: "apply failed".to_string(),
            });
        }
        Ok(ProvisionOutput {
            values: self.outputs.lock().unwrap().clone(),
        })
    }

    async fn destroy(&self, request: &ProvisionRequest, log: &LogSink) -> Result<(), ProvisionError> {
        self.record(Call::Destroy(request.clone()));
        log.line(format!("destroying {}", request.workspace));
        self.wait_open().await;
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(ProvisionError::Failed {
                subject: request.workspace.clone(),
                exit_code: Some(1),
                message: "destroy failed".to_string(),
            });
        }
        Ok(())
    }
}

/// Hands out fake paths; refs listed in `missing_refs` do not exist
#[derive(Default)]
pub struct FakeWorkdir {
    pub missing_refs: Mutex<BTreeSet<String>>,
    prepared: Mutex<Vec<(String, String, String)>>,
    cleaned: Mutex<Vec<String>>,
}

impl FakeWorkdir {
    pub fn remove_ref(&self, git_ref: &str) {
        self.missing_refs.lock().unwrap().insert(git_ref.to_string());
    }

    /// `(name, template, git_ref)` of every successful prepare
    pub fn prepared(&self) -> Vec<(String, String, String)> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkdirPreparer for FakeWorkdir {
    async fn prepare(
        &self,
        name: &str,
        template: &str,
        git_ref: &str,
    ) -> Result<PathBuf, ProvisionError> {
        if self.missing_refs.lock().unwrap().contains(git_ref) {
            return Err(ProvisionError::ReferenceNotFound(git_ref.to_string()));
        }
        self.prepared
            .lock()
            .unwrap()
            .push((name.to_string(), template.to_string(), git_ref.to_string()));
        Ok(PathBuf::from("/work").join(name).join(template))
    }

    async fn cleanup(&self, name: &str) {
        self.cleaned.lock().unwrap().push(name.to_string());
    }
}

/// In-memory backend whose first creates and deletes fail
pub struct FlakyBackend<K> {
    inner: MemoryBackend<K>,
    failing_creates: AtomicUsize,
    failing_deletes: AtomicUsize,
    pub create_attempts: AtomicUsize,
    pub delete_attempts: AtomicUsize,
}

impl<K: StoredObject> FlakyBackend<K> {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            failing_creates: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
            create_attempts: AtomicUsize::new(0),
            delete_attempts: AtomicUsize::new(0),
        }
    }

    /// Reject the next `n` creates as if the object already existed
    pub fn fail_creates(self, n: usize) -> Self {
        self.failing_creates.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` deletes with a backend error
    pub fn fail_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<K: StoredObject> ObjectBackend<K> for FlakyBackend<K> {
    async fn list(&self) -> Result<Vec<K>, StoreError> {
        self.inner.list().await
    }

    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.inner.get(name).await
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_creates) {
            return Err(StoreError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                name: obj.name_any(),
            });
        }
        self.inner.create(obj).await
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, StoreError> {
        self.inner.replace(name, obj).await
    }

    async fn replace_status(&self, name: &str, obj: &K) -> Result<K, StoreError> {
        self.inner.replace_status(name, obj).await
    }

    async fn delete(&self, name: &str) -> Result<DeleteOutcome<K>, StoreError> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_deletes) {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.delete(name).await
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>, StoreError>> {
        self.inner.watch()
    }
}
