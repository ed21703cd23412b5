//! Compatibility matching between cache records and live accelerators.
//!
//! A record is satisfied by an accelerator when backend, architecture and
//! warp size are equal, and, for CUDA-family accelerators with a record that
//! declares one, the PTX version is equal too. How per-record verdicts
//! combine is the caller's [`MatchPolicy`].

use kcache_core::accelerator::AcceleratorDescriptor;
use kcache_core::config::MatchPolicy;
use kcache_core::descriptor::CacheSummary;
use kcache_core::error::{CacheError, Result};
use serde::Serialize;

/// A compared field other than the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchField {
    Arch,
    WarpSize,
    PtxVersion,
}

impl std::fmt::Display for MismatchField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MismatchField::Arch => "arch",
            MismatchField::WarpSize => "warp size",
            MismatchField::PtxVersion => "ptx version",
        })
    }
}

/// Why a record found no accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Unsatisfied {
    /// The accelerator list was empty
    NoAccelerators,
    /// No accelerator shares the record's backend
    BackendMismatch,
    /// The backend was seen; these fields differ on the closest accelerator
    FieldMismatch { fields: Vec<MismatchField> },
}

impl std::fmt::Display for Unsatisfied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unsatisfied::NoAccelerators => f.write_str("no accelerators found"),
            Unsatisfied::BackendMismatch => f.write_str("no accelerator with a matching backend"),
            Unsatisfied::FieldMismatch { fields } => {
                let names: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
                write!(f, "backend matches but {} differ", names.join(", "))
            }
        }
    }
}

/// Outcome for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordVerdict {
    /// Index of the first accelerator that satisfies the record
    Satisfied { accelerator: usize },
    Unsatisfied { diagnostic: Unsatisfied },
}

impl RecordVerdict {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, RecordVerdict::Satisfied { .. })
    }
}

/// One record with its verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordReport {
    pub record: CacheSummary,
    pub verdict: RecordVerdict,
}

/// Aggregate verdict under a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchVerdict {
    #[serde(skip)]
    pub policy: MatchPolicy,
    pub compatible: bool,
    pub records: Vec<RecordReport>,
}

impl MatchVerdict {
    /// Turn an incompatible verdict into [`CacheError::Incompatible`].
    pub fn into_result(self) -> Result<Self> {
        if self.compatible {
            return Ok(self);
        }
        let reasons: Vec<String> = self
            .records
            .iter()
            .filter_map(|r| match &r.verdict {
                RecordVerdict::Unsatisfied { diagnostic } => {
                    Some(format!("{}: {}", r.record.hash, diagnostic))
                }
                RecordVerdict::Satisfied { .. } => None,
            })
            .collect();
        Err(CacheError::Incompatible(reasons.join("; ")))
    }

    pub fn satisfied_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.verdict.is_satisfied())
            .count()
    }
}

/// Check one record against every accelerator.
pub fn check_record(record: &CacheSummary, accelerators: &[AcceleratorDescriptor]) -> RecordVerdict {
    if accelerators.is_empty() {
        return RecordVerdict::Unsatisfied {
            diagnostic: Unsatisfied::NoAccelerators,
        };
    }

    let mut closest: Option<Vec<MismatchField>> = None;
    for (index, accelerator) in accelerators.iter().enumerate() {
        if accelerator.backend != record.backend {
            continue;
        }
        let fields = mismatched_fields(record, accelerator);
        if fields.is_empty() {
            return RecordVerdict::Satisfied { accelerator: index };
        }
        if closest.as_ref().map_or(true, |c| fields.len() < c.len()) {
            closest = Some(fields);
        }
    }

    let diagnostic = match closest {
        Some(fields) => Unsatisfied::FieldMismatch { fields },
        None => Unsatisfied::BackendMismatch,
    };
    RecordVerdict::Unsatisfied { diagnostic }
}

fn mismatched_fields(record: &CacheSummary, accelerator: &AcceleratorDescriptor) -> Vec<MismatchField> {
    let mut fields = Vec::new();
    if record.arch != accelerator.arch {
        fields.push(MismatchField::Arch);
    }
    if record.warp_size != accelerator.warp_size {
        fields.push(MismatchField::WarpSize);
    }
    if accelerator.is_cuda() {
        if let Some(ptx) = record.ptx_version {
            if accelerator.ptx_version != Some(ptx) {
                fields.push(MismatchField::PtxVersion);
            }
        }
    }
    fields
}

/// Check every record and combine the verdicts under `policy`.
///
/// `accelerators` is `None` when no probe could run at all, which is an
/// invalid argument rather than "nothing matches".
pub fn matches(
    records: &[CacheSummary],
    accelerators: Option<&[AcceleratorDescriptor]>,
    policy: MatchPolicy,
) -> Result<MatchVerdict> {
    if records.is_empty() {
        return Err(CacheError::InvalidArgument(
            "no cache records to match".to_string(),
        ));
    }
    let accelerators = accelerators.ok_or_else(|| {
        CacheError::InvalidArgument("no accelerator snapshot available".to_string())
    })?;

    let reports: Vec<RecordReport> = records
        .iter()
        .map(|record| RecordReport {
            record: record.clone(),
            verdict: check_record(record, accelerators),
        })
        .collect();

    let compatible = match policy {
        MatchPolicy::AnyRecord => reports.iter().any(|r| r.verdict.is_satisfied()),
        MatchPolicy::AllRecords => reports.iter().all(|r| r.verdict.is_satisfied()),
    };

    tracing::debug!(
        records = reports.len(),
        accelerators = accelerators.len(),
        policy = ?policy,
        compatible,
        "Matched cache against accelerators"
    );

    Ok(MatchVerdict {
        policy,
        compatible,
        records: reports,
    })
}
