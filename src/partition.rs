use std::collections::BTreeMap;

use crate::error::{CopacError, Result};

/// Points sharing one local correlation dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// The shared `λ`.
    pub correlation_dimension: usize,
    /// Point indices, ascending.
    pub members: Vec<usize>,
}

impl Partition {
    /// Number of member points.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the partition has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Groups point indices by correlation dimension.
///
/// `dimensions[i]` is the correlation dimension of point `i` and must lie in
/// `[1, n_features]`. Partitions come back in ascending dimension order, which is the order the
/// merge step consumes them in; dimensions nobody has are skipped.
pub fn partition_by_dimension(dimensions: &[usize], n_features: usize) -> Result<Vec<Partition>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (point, &dimension) in dimensions.iter().enumerate() {
        if dimension < 1 || dimension > n_features {
            return Err(CopacError::InvariantViolation(format!(
                "point {} has correlation dimension {} outside [1, {}]",
                point, dimension, n_features
            )));
        }
        groups.entry(dimension).or_default().push(point);
    }
    Ok(groups
        .into_iter()
        .map(|(correlation_dimension, members)| Partition {
            correlation_dimension,
            members,
        })
        .collect())
}
