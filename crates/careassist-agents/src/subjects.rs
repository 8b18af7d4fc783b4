use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use careassist_common::{ChatContext, Result};
use careassist_config::SubjectGrant;
use serde_json::{Map, Value};

/// Answers "may this user talk about this subject's records?" and supplies
/// the identifiers the assistant needs for a subject.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn owns_subject(&self, user_id: &str, subject_id: &str) -> Result<bool>;

    /// Data folded into a session's context when it starts.
    async fn context_data(
        &self,
        user_id: &str,
        subject_id: &str,
        context: &ChatContext,
    ) -> Result<Map<String, Value>>;
}

/// Directory backed by static grants. A user always owns their own id.
#[derive(Debug, Default, Clone)]
pub struct InMemorySubjectDirectory {
    grants: HashMap<String, HashSet<String>>,
    subject_data: HashMap<String, Map<String, Value>>,
}

impl InMemorySubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_grants(grants: &[SubjectGrant]) -> Self {
        let mut directory = Self::new();
        for grant in grants {
            directory.grant(&grant.user_id, &grant.subject_id);
        }
        directory
    }

    pub fn grant(&mut self, user_id: &str, subject_id: &str) {
        self.grants
            .entry(user_id.to_string())
            .or_default()
            .insert(subject_id.to_string());
    }

    pub fn with_subject_data(mut self, subject_id: &str, data: Map<String, Value>) -> Self {
        self.subject_data.insert(subject_id.to_string(), data);
        self
    }
}

#[async_trait]
impl SubjectDirectory for InMemorySubjectDirectory {
    async fn owns_subject(&self, user_id: &str, subject_id: &str) -> Result<bool> {
        Ok(user_id == subject_id
            || self
                .grants
                .get(user_id)
                .is_some_and(|subjects| subjects.contains(subject_id)))
    }

    async fn context_data(
        &self,
        _user_id: &str,
        subject_id: &str,
        _context: &ChatContext,
    ) -> Result<Map<String, Value>> {
        let mut data = self.subject_data.get(subject_id).cloned().unwrap_or_default();
        data.entry("patient_id")
            .or_insert_with(|| Value::String(subject_id.to_string()));
        Ok(data)
    }
}
