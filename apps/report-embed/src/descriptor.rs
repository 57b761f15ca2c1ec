use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token::TokenKey;

/// What to embed. Built once when a dashboard is selected and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardDescriptor {
    pub id: String,
    pub title: String,
    pub report_identity: String,
    pub dataset_identity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DescriptorDiagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DescriptorDiagnostics {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl DashboardDescriptor {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        report_identity: impl Into<String>,
        dataset_identity: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            report_identity: report_identity.into(),
            dataset_identity: dataset_identity.into(),
        }
    }

    pub fn token_key(&self) -> TokenKey {
        TokenKey::new(&self.report_identity, &self.dataset_identity)
    }

    pub fn diagnose(&self) -> DescriptorDiagnostics {
        let mut report = DescriptorDiagnostics::default();
        if self.id.trim().is_empty() {
            report.errors.push("missing id".into());
        }
        if self.title.trim().is_empty() {
            report.errors.push("missing title".into());
        }
        if self.report_identity.trim().is_empty() {
            report.errors.push("missing report identity".into());
        } else if !is_hyphenated_uuid(&self.report_identity) {
            report.warnings.push(format!(
                "report identity {} is not a GUID",
                self.report_identity
            ));
        }
        if !self.dataset_identity.trim().is_empty() && !is_hyphenated_uuid(&self.dataset_identity) {
            report.warnings.push(format!(
                "dataset identity {} is not a GUID",
                self.dataset_identity
            ));
        }
        report
    }
}

fn is_hyphenated_uuid(value: &str) -> bool {
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}
