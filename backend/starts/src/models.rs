use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use flowline_core::{
    ContactID, Exclusions, FlowID, FlowType, FlowlineError, GroupID, OrgID, StartID, StartType,
    UserID,
};

/// Contacts per batch task. Chunk size is independent of recipient count; a
/// start with zero recipients still gets one empty terminal batch.
pub const START_BATCH_SIZE: usize = 100;

/// One logical request to run a flow for a computed set of recipients.
///
/// The recipient specification is immutable once resolved; status and counts
/// live on the store row, not here. `params`, `parent_summary` and
/// `session_history` are opaque caller-supplied JSON passed through to the
/// flow engine verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStart {
    #[serde(rename = "start_id", default)]
    pub id: Option<StartID>,
    pub org_id: OrgID,
    pub start_type: StartType,
    pub flow_id: FlowID,
    pub flow_type: FlowType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact_ids: Vec<ContactID>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<GroupID>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_group_ids: Vec<GroupID>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urns: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub create_contact: bool,
    #[serde(default)]
    pub exclusions: Exclusions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_summary: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_history: Option<Box<RawValue>>,
    #[serde(default)]
    pub created_by_id: Option<UserID>,
}

impl FlowStart {
    pub fn new(org_id: OrgID, start_type: StartType, flow_type: FlowType, flow_id: FlowID) -> Self {
        Self {
            id: None,
            org_id,
            start_type,
            flow_id,
            flow_type,
            contact_ids: Vec::new(),
            group_ids: Vec::new(),
            exclude_group_ids: Vec::new(),
            urns: Vec::new(),
            query: None,
            create_contact: false,
            exclusions: Exclusions::default(),
            params: None,
            parent_summary: None,
            session_history: None,
            created_by_id: None,
        }
    }

    pub fn with_contact_ids(mut self, contact_ids: Vec<ContactID>) -> Self {
        self.contact_ids = contact_ids;
        self
    }

    pub fn with_group_ids(mut self, group_ids: Vec<GroupID>) -> Self {
        self.group_ids = group_ids;
        self
    }

    pub fn with_exclude_group_ids(mut self, group_ids: Vec<GroupID>) -> Self {
        self.exclude_group_ids = group_ids;
        self
    }

    pub fn with_urns(mut self, urns: Vec<String>) -> Self {
        self.urns = urns;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_create_contact(mut self, create: bool) -> Self {
        self.create_contact = create;
        self
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_params(mut self, params: Box<RawValue>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_parent_summary(mut self, summary: Box<RawValue>) -> Self {
        self.parent_summary = Some(summary);
        self
    }

    pub fn with_session_history(mut self, history: Box<RawValue>) -> Self {
        self.session_history = Some(history);
        self
    }

    pub fn with_created_by(mut self, user_id: UserID) -> Self {
        self.created_by_id = Some(user_id);
        self
    }

    /// Whether any recipient-selection mechanism is present at all.
    pub fn has_recipients(&self) -> bool {
        !self.contact_ids.is_empty()
            || !self.group_ids.is_empty()
            || !self.urns.is_empty()
            || self.query.is_some()
    }

    /// Build the batch for one slice of the resolved recipients. Pure
    /// construction, no I/O; immutable fields are copied from the start,
    /// which must have been persisted.
    pub fn create_batch(
        &self,
        contact_ids: Vec<ContactID>,
        is_last: bool,
        total_contacts: usize,
    ) -> Result<FlowStartBatch, FlowlineError> {
        let start_id = self.id.ok_or_else(|| {
            FlowlineError::Validation("cannot batch a start that has not been persisted".into())
        })?;
        Ok(FlowStartBatch {
            start_id,
            start_type: self.start_type,
            org_id: self.org_id,
            flow_id: self.flow_id,
            flow_type: self.flow_type,
            contact_ids,
            exclusions: self.exclusions.clone(),
            create_contact: self.create_contact,
            params: self.params.clone(),
            parent_summary: self.parent_summary.clone(),
            session_history: self.session_history.clone(),
            created_by_id: self.created_by_id,
            is_last,
            total_contacts,
        })
    }
}

/// One bounded unit of work derived from a start. Exists only as a queue
/// task payload, consumed by a batch worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStartBatch {
    pub start_id: StartID,
    pub start_type: StartType,
    pub org_id: OrgID,
    pub flow_id: FlowID,
    pub flow_type: FlowType,
    pub contact_ids: Vec<ContactID>,
    #[serde(default)]
    pub exclusions: Exclusions,
    #[serde(default)]
    pub create_contact: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_summary: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_history: Option<Box<RawValue>>,
    #[serde(default)]
    pub created_by_id: Option<UserID>,
    pub is_last: bool,
    pub total_contacts: usize,
}

/// Split a recipient sequence into enqueue-order slices of at most `size`.
pub fn chunk_contacts(contacts: &[ContactID], size: usize) -> Vec<Vec<ContactID>> {
    contacts.chunks(size).map(|c| c.to_vec()).collect()
}
