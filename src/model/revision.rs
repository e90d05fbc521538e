use super::workload::Template;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Immutable, content-addressed snapshot of a workload template
///
/// The snapshot fields never change after creation. `status` is controller
/// bookkeeping (how many instances currently run this revision, and the most
/// it ever ran) and is rewritten as instances are scaled.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub id: String,
    pub workload: String,
    /// Monotonically increasing per workload
    pub sequence: u64,
    pub template: Template,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: RevisionStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    /// Instances currently running this revision
    #[serde(default)]
    pub replicas: u32,
    /// Highest instance count ever observed for this revision
    #[serde(default)]
    pub peak_replicas: u32,
}

impl Revision {
    pub fn template_hash(&self) -> &str {
        &self.template.hash
    }
}

/// Revision id for a template hash: `{workload}-{hash}`
pub fn revision_id(workload: &str, template_hash: &str) -> String {
    format!("{}-{}", workload, template_hash)
}

/// Target of a rollback request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevisionRef {
    /// Most recent revision other than the live one that ever ran instances
    Previous,
    /// Revision by id
    Id(String),
    /// Revision by sequence number
    Sequence(u64),
}

impl FromStr for RevisionRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("previous") {
            return Ok(RevisionRef::Previous);
        }
        match s.parse::<u64>() {
            Ok(seq) => Ok(RevisionRef::Sequence(seq)),
            Err(_) => Ok(RevisionRef::Id(s.to_string())),
        }
    }
}

impl fmt::Display for RevisionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionRef::Previous => f.write_str("previous"),
            RevisionRef::Id(id) => f.write_str(id),
            RevisionRef::Sequence(seq) => write!(f, "{}", seq),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_ref_parse() {
        assert_eq!("previous".parse::<RevisionRef>().unwrap(), RevisionRef::Previous);
        assert_eq!("".parse::<RevisionRef>().unwrap(), RevisionRef::Previous);
        assert_eq!("3".parse::<RevisionRef>().unwrap(), RevisionRef::Sequence(3));
        assert_eq!(
            "web-abc123".parse::<RevisionRef>().unwrap(),
            RevisionRef::Id("web-abc123".to_string())
        );
    }

    #[test]
    fn test_revision_id_format() {
        assert_eq!(revision_id("web", "abc123"), "web-abc123");
    }
}
