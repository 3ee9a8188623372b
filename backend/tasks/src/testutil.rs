//! Shared test doubles for the collaborator seams.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use flowline_core::{
    ContactID, ContactResolver, Exclusions, FlowEngine, FlowID, GroupID, MessageSender, OrgID,
    RunOutcome, SessionHistory, UrnResolution,
};
use flowline_queue::Queue;
use flowline_store::Store;

use crate::context::TaskContext;

/// Resolver that passes explicit contact ids through and resolves everything
/// else to nothing.
pub struct PassthroughResolver;

#[async_trait]
impl ContactResolver for PassthroughResolver {
    async fn resolve_contacts(
        &self,
        _org_id: OrgID,
        contact_ids: &[ContactID],
        _group_ids: &[GroupID],
    ) -> Result<Vec<ContactID>> {
        Ok(contact_ids.to_vec())
    }

    async fn resolve_query(
        &self,
        _org_id: OrgID,
        _query: &str,
        _exclude_group_ids: &[GroupID],
    ) -> Result<Vec<ContactID>> {
        Ok(Vec::new())
    }

    async fn resolve_urns(
        &self,
        _org_id: OrgID,
        _urns: &[String],
        _create_missing: bool,
    ) -> Result<Vec<UrnResolution>> {
        Ok(Vec::new())
    }

    async fn apply_exclusions(
        &self,
        _org_id: OrgID,
        _exclusions: &Exclusions,
        contacts: &[ContactID],
    ) -> Result<Vec<ContactID>> {
        Ok(contacts.to_vec())
    }
}

/// Engine double recording every flow entry and call request, with optional
/// per-contact failures.
#[derive(Default)]
pub struct FakeEngine {
    entered: Mutex<Vec<ContactID>>,
    called: Mutex<Vec<ContactID>>,
    failing: Mutex<Vec<ContactID>>,
}

impl FakeEngine {
    pub fn entered(&self) -> Vec<ContactID> {
        self.entered.lock().unwrap().clone()
    }

    pub fn called(&self) -> Vec<ContactID> {
        self.called.lock().unwrap().clone()
    }

    pub fn fail_contact(&self, contact: ContactID) {
        self.failing.lock().unwrap().push(contact);
    }
}

#[async_trait]
impl FlowEngine for FakeEngine {
    async fn enter_flow(
        &self,
        _org_id: OrgID,
        _flow_id: FlowID,
        contact_id: ContactID,
        _params: Option<&serde_json::Value>,
        _parent_summary: Option<&serde_json::Value>,
        _history: Option<&SessionHistory>,
    ) -> Result<RunOutcome> {
        if self.failing.lock().unwrap().contains(&contact_id) {
            anyhow::bail!("session already active for contact {contact_id}");
        }
        self.entered.lock().unwrap().push(contact_id);
        Ok(RunOutcome::Completed)
    }

    async fn request_call(
        &self,
        _org_id: OrgID,
        _flow_id: FlowID,
        contact_id: ContactID,
    ) -> Result<()> {
        self.called.lock().unwrap().push(contact_id);
        Ok(())
    }
}

/// Sender double recording (contact, text) pairs.
#[derive(Default)]
pub struct FakeSender {
    sent: Mutex<Vec<(ContactID, String)>>,
}

impl FakeSender {
    pub fn sent(&self) -> Vec<(ContactID, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for FakeSender {
    async fn send_message(&self, _org_id: OrgID, contact_id: ContactID, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push((contact_id, text.to_string()));
        Ok(())
    }
}

/// A fresh context over a temp database, plus handles on the doubles.
pub fn test_ctx() -> (TaskContext, Arc<FakeEngine>, Arc<FakeSender>) {
    let path = std::env::temp_dir().join(format!("flowline-tasks-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_str().unwrap().to_string();
    let engine = Arc::new(FakeEngine::default());
    let sender = Arc::new(FakeSender::default());
    let ctx = TaskContext {
        store: Store::open(&path).unwrap(),
        queue: Queue::open(&path).unwrap(),
        resolver: Arc::new(PassthroughResolver),
        engine: engine.clone(),
        sender: sender.clone(),
    };
    (ctx, engine, sender)
}
