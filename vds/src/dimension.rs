use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{Error, Result};

/// One axis of an array. `size` is the authoritative post-aggregation
/// cardinality, not any single member's.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub size: u32,
    pub shared: bool,
    pub size_constant: bool,
}

impl Dimension {
    pub fn new<S: Into<String>>(name: S, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            shared: true,
            size_constant: true,
        }
    }

    /// A dimension whose cardinality varies across member datasets.
    pub fn varying<S: Into<String>>(name: S, size: u32) -> Self {
        Self {
            size_constant: false,
            ..Self::new(name, size)
        }
    }
}

/// What to do when two sources declare the same dimension name with
/// different sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Fail,
    Warn,
}

/// Union `from` into `into` by name. The first writer wins; a same-name,
/// different-size pair is a `DimensionConflict` under `ConflictPolicy::Fail`
/// and a warning (keeping the existing entry) under `ConflictPolicy::Warn`.
/// `skip` names a dimension excluded from the merge entirely.
pub fn merge_dimensions(
    into: &mut Vec<Dimension>,
    from: &[Dimension],
    policy: ConflictPolicy,
    skip: Option<&str>,
) -> Result<()> {
    for dim in from {
        if skip == Some(dim.name.as_str()) {
            continue;
        }
        match into.iter().find(|d| d.name == dim.name) {
            None => into.push(dim.clone()),
            Some(existing) if existing.size == dim.size => {}
            Some(existing) => match policy {
                ConflictPolicy::Fail => {
                    return Err(Error::DimensionConflict {
                        name: dim.name.clone(),
                        existing: existing.size,
                        conflicting: dim.size,
                    });
                }
                ConflictPolicy::Warn => {
                    warn!(
                        dimension = %dim.name,
                        existing = existing.size,
                        conflicting = dim.size,
                        "keeping first declared size for conflicting dimension",
                    );
                }
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(pairs: &[(&str, u32)]) -> Vec<Dimension> {
        pairs.iter().map(|(n, s)| Dimension::new(*n, *s)).collect()
    }

    #[test]
    fn test_merge_disjoint() -> Result<()> {
        let mut into = dims(&[("time", 10)]);
        merge_dimensions(&mut into, &dims(&[("lat", 4), ("lon", 8)]), ConflictPolicy::Fail, None)?;

        assert_eq!(into.len(), 3);
        assert_eq!(into[1].name, "lat");
        assert_eq!(into[2].size, 8);

        Ok(())
    }

    #[test]
    fn test_merge_same_size_is_noop() -> Result<()> {
        let mut into = dims(&[("time", 10)]);
        merge_dimensions(&mut into, &dims(&[("time", 10)]), ConflictPolicy::Fail, None)?;

        assert_eq!(into.len(), 1);

        Ok(())
    }

    #[test]
    fn test_merge_conflict_fails() {
        let mut into = dims(&[("time", 10)]);
        let result = merge_dimensions(&mut into, &dims(&[("time", 12)]), ConflictPolicy::Fail, None);

        match result {
            Err(Error::DimensionConflict {
                name,
                existing,
                conflicting,
            }) => {
                assert_eq!(name, "time");
                assert_eq!(existing, 10);
                assert_eq!(conflicting, 12);
            }
            other => panic!("expected DimensionConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_conflict_warn_keeps_first() -> Result<()> {
        let mut into = dims(&[("time", 10)]);
        merge_dimensions(&mut into, &dims(&[("time", 12)]), ConflictPolicy::Warn, None)?;

        assert_eq!(into.len(), 1);
        assert_eq!(into[0].size, 10);

        Ok(())
    }

    #[test]
    fn test_merge_skips_named_dimension() -> Result<()> {
        let mut into = vec![];
        merge_dimensions(
            &mut into,
            &dims(&[("time", 10), ("lat", 4)]),
            ConflictPolicy::Fail,
            Some("time"),
        )?;

        assert_eq!(into.len(), 1);
        assert_eq!(into[0].name, "lat");

        Ok(())
    }
}
