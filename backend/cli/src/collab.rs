//! Default collaborator bindings for a standalone deployment.
//!
//! The contact resolver, flow engine and channel sender are external systems
//! consumed through the traits in `flowline-core`. Until wired to real
//! services, these implementations pass explicit contact ids through and log
//! every engine/channel interaction for traceability.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use flowline_core::{
    ContactID, ContactResolver, Exclusions, FlowEngine, FlowID, GroupID, MessageSender, OrgID,
    RunOutcome, SessionHistory, UrnResolution,
};

/// Resolver that honors explicit contact ids and resolves groups, queries and
/// URNs to nothing (with a warning, so misconfiguration is visible).
pub struct LocalResolver;

#[async_trait]
impl ContactResolver for LocalResolver {
    async fn resolve_contacts(
        &self,
        _org_id: OrgID,
        contact_ids: &[ContactID],
        group_ids: &[GroupID],
    ) -> Result<Vec<ContactID>> {
        if !group_ids.is_empty() {
            warn!("no group resolver configured; ignoring {} group(s)", group_ids.len());
        }
        Ok(contact_ids.to_vec())
    }

    async fn resolve_query(
        &self,
        _org_id: OrgID,
        query: &str,
        _exclude_group_ids: &[GroupID],
    ) -> Result<Vec<ContactID>> {
        warn!(query, "no search index configured; query resolves to nothing");
        Ok(Vec::new())
    }

    async fn resolve_urns(
        &self,
        _org_id: OrgID,
        urns: &[String],
        _create_missing: bool,
    ) -> Result<Vec<UrnResolution>> {
        if !urns.is_empty() {
            warn!("no contact store configured; ignoring {} urn(s)", urns.len());
        }
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

/// Engine binding that logs each entry instead of running a real interpreter.
pub struct LoggingEngine;

#[async_trait]
impl FlowEngine for LoggingEngine {
    async fn enter_flow(
        &self,
        org_id: OrgID,
        flow_id: FlowID,
        contact_id: ContactID,
        _params: Option<&serde_json::Value>,
        _parent_summary: Option<&serde_json::Value>,
        _history: Option<&SessionHistory>,
    ) -> Result<RunOutcome> {
        info!(org_id = %org_id, flow_id = %flow_id, contact_id = %contact_id, "enter flow");
        Ok(RunOutcome::Completed)
    }

    async fn request_call(
        &self,
        org_id: OrgID,
        flow_id: FlowID,
        contact_id: ContactID,
    ) -> Result<()> {
        info!(org_id = %org_id, flow_id = %flow_id, contact_id = %contact_id, "request call");
        Ok(())
    }
}

/// Sender binding that logs outbound messages.
pub struct LoggingSender;

#[async_trait]
impl MessageSender for LoggingSender {
    async fn send_message(&self, org_id: OrgID, contact_id: ContactID, text: &str) -> Result<()> {
        info!(org_id = %org_id, contact_id = %contact_id, text, "send message");
        Ok(())
    }
}
