use anyhow::Result;
use async_trait::async_trait;

use crate::ids::{ContactID, FlowID, GroupID, OrgID};
use crate::types::{Exclusions, SessionHistory};

/// One URN resolved to a contact, possibly freshly created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrnResolution {
    pub contact_id: ContactID,
    pub created: bool,
}

/// Outcome of entering a contact into a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The session ran to completion.
    Completed,
    /// The session is waiting for contact input.
    Waiting,
}

/// Resolves recipient specifications to contact identities. Backed by the
/// contact store and search index, both external to this core.
///
/// Implementations must preserve the order of their inputs where one exists:
/// `apply_exclusions` returns the surviving subset of `contacts` in the order
/// given, so batching stays deterministic.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    /// Union of the given contact ids and the members of the given groups.
    async fn resolve_contacts(
        &self,
        org_id: OrgID,
        contact_ids: &[ContactID],
        group_ids: &[GroupID],
    ) -> Result<Vec<ContactID>>;

    /// Contacts matching a free-text query, minus members of the exclude
    /// groups. Unparsable query text or unknown attributes are errors.
    async fn resolve_query(
        &self,
        org_id: OrgID,
        query: &str,
        exclude_group_ids: &[GroupID],
    ) -> Result<Vec<ContactID>>;

    /// Contacts owning the given URNs, creating missing contacts when
    /// `create_missing` is set. URNs with no contact and `create_missing`
    /// unset resolve to nothing.
    async fn resolve_urns(
        &self,
        org_id: OrgID,
        urns: &[String],
        create_missing: bool,
    ) -> Result<Vec<UrnResolution>>;

    /// The subset of `contacts` that survive the exclusion predicates.
    async fn apply_exclusions(
        &self,
        org_id: OrgID,
        exclusions: &Exclusions,
        contacts: &[ContactID],
    ) -> Result<Vec<ContactID>>;
}

/// The external flow-execution engine, consumed as an opaque "run this flow
/// for contact X" operation.
#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn enter_flow(
        &self,
        org_id: OrgID,
        flow_id: FlowID,
        contact_id: ContactID,
        params: Option<&serde_json::Value>,
        parent_summary: Option<&serde_json::Value>,
        history: Option<&SessionHistory>,
    ) -> Result<RunOutcome>;

    /// Request an outbound call for a voice flow; the call session enters the
    /// flow when answered.
    async fn request_call(
        &self,
        org_id: OrgID,
        flow_id: FlowID,
        contact_id: ContactID,
    ) -> Result<()>;
}

/// Outbound message delivery, behind the channel adapters external to this
/// core.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, org_id: OrgID, contact_id: ContactID, text: &str) -> Result<()>;
}
