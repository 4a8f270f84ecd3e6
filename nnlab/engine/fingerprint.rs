//! Dataset fingerprints and the model/dataset compatibility check.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    dataset::{DatasetStats, DatasetType, LabelFormat},
    error::{EngineError, EngineResult, FieldMismatch, Purpose},
    model::ModelRecord,
};

/// Current fingerprint layout version.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Hex characters kept from the SHA-256 digest.
const DIGEST_LEN: usize = 16;

/// Row counts per split.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SplitSizes {
    /// Training rows.
    pub train_size: usize,
    /// Test rows.
    pub test_size: usize,
    /// Validation rows.
    pub val_size: usize,
}

/// Immutable structural summary of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DatasetFingerprint {
    /// Layout version.
    pub version: u32,
    /// Structural family.
    pub dataset_type: DatasetType,
    /// Feature count.
    pub feature_count: usize,
    /// Class count.
    pub class_count: usize,
    /// Label encoding.
    pub label_format: LabelFormat,
    /// Per-sample input shape.
    pub input_shape: Vec<usize>,
    /// Split sizes.
    pub split: SplitSizes,
    /// Short SHA-256 key over the canonical JSON of the fields above.
    pub digest: String,
}

/// Canonical body hashed into the digest; field order is the serialization order.
#[derive(Serialize)]
struct CanonicalBody<'a> {
    version: u32,
    dataset_type: DatasetType,
    feature_count: usize,
    class_count: usize,
    label_format: LabelFormat,
    input_shape: &'a [usize],
    split: SplitSizes,
}

impl DatasetFingerprint {
    /// Cheap equality on the digest.
    #[must_use]
    pub fn matches_digest(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

/// Derives the fingerprint for a dataset's stats.
#[must_use]
pub fn build_fingerprint(stats: &DatasetStats) -> DatasetFingerprint {
    let split = SplitSizes {
        train_size: stats.train_size,
        test_size: stats.test_size,
        val_size: stats.val_size,
    };
    let body = CanonicalBody {
        version: FINGERPRINT_VERSION,
        dataset_type: stats.dataset_type,
        feature_count: stats.features,
        class_count: stats.classes,
        label_format: stats.label_format,
        input_shape: &stats.input_shape,
        split,
    };
    // Serializing plain structs and enums cannot fail.
    let canonical = serde_json::to_vec(&body).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(DIGEST_LEN);
    DatasetFingerprint {
        version: FINGERPRINT_VERSION,
        dataset_type: stats.dataset_type,
        feature_count: stats.features,
        class_count: stats.classes,
        label_format: stats.label_format,
        input_shape: stats.input_shape.clone(),
        split,
        digest,
    }
}

/// How strictly a model's dataset expectations are checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", content = "fingerprint", rename_all = "snake_case")]
pub enum FingerprintPolicy {
    /// Dataset must match the captured fingerprint.
    Enforced(DatasetFingerprint),
    /// Legacy model without a captured fingerprint: every dataset is accepted.
    Unchecked,
}

impl FingerprintPolicy {
    /// Whether compatibility is actually checked.
    #[must_use]
    pub const fn is_enforced(&self) -> bool {
        matches!(self, Self::Enforced(_))
    }
}

/// Lists every declared field of `expected` that differs from `actual`.
#[must_use]
pub fn diff(expected: &DatasetFingerprint, actual: &DatasetFingerprint) -> Vec<FieldMismatch> {
    let mut mismatches = Vec::new();
    let mut push = |field: &str, expected: String, actual: String| {
        mismatches.push(FieldMismatch {
            field: field.into(),
            expected,
            actual,
        });
    };
    if expected.dataset_type != actual.dataset_type {
        push(
            "dataset_type",
            expected.dataset_type.to_string(),
            actual.dataset_type.to_string(),
        );
    }
    if expected.feature_count > 0 && expected.feature_count != actual.feature_count {
        push(
            "feature_count",
            expected.feature_count.to_string(),
            actual.feature_count.to_string(),
        );
    }
    if expected.class_count > 0 && expected.class_count != actual.class_count {
        push(
            "class_count",
            expected.class_count.to_string(),
            actual.class_count.to_string(),
        );
    }
    if expected.label_format != LabelFormat::Unknown && expected.label_format != actual.label_format
    {
        push(
            "label_format",
            expected.label_format.to_string(),
            actual.label_format.to_string(),
        );
    }
    mismatches
}

/// Fails with every mismatched field when the dataset does not fit the model.
pub fn assert_compatible(
    record: &ModelRecord,
    fingerprint: &DatasetFingerprint,
    purpose: Purpose,
) -> EngineResult<()> {
    let FingerprintPolicy::Enforced(expected) = &record.expected_fingerprint else {
        return Ok(());
    };
    let mismatches = diff(expected, fingerprint);
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(EngineError::IncompatibleDataset {
            model_id: record.model_id.clone(),
            purpose,
            mismatches,
        })
    }
}
