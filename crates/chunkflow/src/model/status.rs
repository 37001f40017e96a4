//! Closed status vocabularies stored as TEXT columns.

use thiserror::Error;

/// A stored text value that does not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares an enum whose variants round-trip through fixed strings in
/// serde, `Display`/`FromStr`, and rusqlite.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

pub(crate) use text_enum;

text_enum! {
    /// Lifecycle of one video's processing.
    pub enum JobStatus {
        Queued => "queued",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Purged => "purged",
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Purged)
    }
}

text_enum! {
    pub enum ChunkStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Merged => "merged",
    }
}

text_enum! {
    /// Status of one queued step attempt.
    pub enum WorkUnitStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

impl WorkUnitStatus {
    /// Pending and processing units are "live" and covered by the queue's
    /// uniqueness guarantee.
    pub fn is_live(&self) -> bool {
        matches!(self, WorkUnitStatus::Pending | WorkUnitStatus::Processing)
    }
}

text_enum! {
    pub enum ConstraintStatus {
        Valid => "valid",
        Violated => "violated",
    }
}

text_enum! {
    pub enum FrameType {
        AiExecution => "ai_execution",
        HumanApproval => "human_approval",
        Recovery => "recovery",
    }
}

text_enum! {
    pub enum ApprovalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Expired => "expired",
    }
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

text_enum! {
    /// A human decision on a pending frame.
    pub enum Decision {
        Approved => "approved",
        Rejected => "rejected",
    }
}

text_enum! {
    pub enum Severity {
        Critical => "critical",
        Error => "error",
        Warn => "warn",
    }
}

text_enum! {
    /// Processing steps a unit of work can run.
    pub enum PipelineStep {
        Probe => "probe",
        Transcription => "transcription",
        FrameExtraction => "frame_extraction",
        Rendering => "rendering",
        Merge => "merge",
    }
}
