//! Damage reports produced by the thin tree walkers.

use pd_btree::NodeDamage;
use pd_types::RunSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device ids whose records, or whole mapping trees, could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDevices {
    pub desc: String,
    pub keys: RunSet,
}

/// Virtual blocks of one thin device whose mappings could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingMappings {
    pub desc: String,
    pub thin_dev: u64,
    pub keys: RunSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Damage {
    MissingDevices(MissingDevices),
    MissingMappings(MissingMappings),
}

impl Damage {
    /// Device-level damage covering the keys of a damaged node.
    pub(crate) fn devices(node: NodeDamage) -> Self {
        Self::MissingDevices(MissingDevices {
            desc: node.desc,
            keys: RunSet::from(node.keys),
        })
    }

    /// Mapping-level damage below `thin_dev`.
    pub(crate) fn mappings(thin_dev: u64, node: NodeDamage) -> Self {
        Self::MissingMappings(MissingMappings {
            desc: node.desc,
            thin_dev,
            keys: RunSet::from(node.keys),
        })
    }

    #[must_use]
    pub fn desc(&self) -> &str {
        match self {
            Self::MissingDevices(d) => &d.desc,
            Self::MissingMappings(d) => &d.desc,
        }
    }

    #[must_use]
    pub fn keys(&self) -> &RunSet {
        match self {
            Self::MissingDevices(d) => &d.keys,
            Self::MissingMappings(d) => &d.keys,
        }
    }
}

impl fmt::Display for Damage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDevices(d) => write!(f, "missing devices {}: {}", d.keys, d.desc),
            Self::MissingMappings(d) => write!(
                f,
                "missing mappings for thin device {} at {}: {}",
                d.thin_dev, d.keys, d.desc
            ),
        }
    }
}

/// Receives damage as a walk finds it, one method per kind.
pub trait DamageVisitor {
    fn visit_missing_devices(&mut self, damage: MissingDevices);

    fn visit_missing_mappings(&mut self, damage: MissingMappings);

    fn visit(&mut self, damage: Damage) {
        match damage {
            Damage::MissingDevices(d) => self.visit_missing_devices(d),
            Damage::MissingMappings(d) => self.visit_missing_mappings(d),
        }
    }
}

/// Collects every report in the order found.
impl DamageVisitor for Vec<Damage> {
    fn visit_missing_devices(&mut self, damage: MissingDevices) {
        self.push(Damage::MissingDevices(damage));
    }

    fn visit_missing_mappings(&mut self, damage: MissingMappings) {
        self.push(Damage::MissingMappings(damage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_types::Run;

    fn node(keys: Run) -> NodeDamage {
        NodeDamage {
            level: 1,
            path: vec![4],
            keys,
            block: 99,
            subtree_root: false,
            desc: "checksum mismatch".to_owned(),
        }
    }

    #[test]
    fn display_names_scope() {
        let d = Damage::mappings(4, node(Run::new(16, 31)));
        assert_eq!(
            d.to_string(),
            "missing mappings for thin device 4 at {[16..=31]}: checksum mismatch"
        );
        let d = Damage::devices(node(Run::single(7)));
        assert_eq!(d.to_string(), "missing devices {[7]}: checksum mismatch");
    }

    #[test]
    fn collector_dispatches_by_kind() {
        let mut found = Vec::new();
        found.visit(Damage::devices(node(Run::single(1))));
        found.visit_missing_mappings(MissingMappings {
            desc: "bad".to_owned(),
            thin_dev: 2,
            keys: RunSet::from(Run::new(0, 9)),
        });
        assert_eq!(found.len(), 2);
        assert!(matches!(found[0], Damage::MissingDevices(_)));
        assert!(matches!(&found[1], Damage::MissingMappings(m) if m.thin_dev == 2));
        assert_eq!(found[1].keys().key_count(), 10);
        assert_eq!(found[1].desc(), "bad");
    }
}
