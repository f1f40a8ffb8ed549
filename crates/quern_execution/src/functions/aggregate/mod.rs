//! Aggregate function catalog.

pub mod builtin;

use std::collections::HashSet;

use once_cell::sync::Lazy;
use quern_error::{QuernError, Result};

use super::{AggregateFn, FunctionId};
use crate::arrays::datum::{DataType, Datum};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Normal,
    /// Ordered-set aggregate: direct arguments evaluated once per group,
    /// aggregated arguments fed through the per-aggregate sort.
    OrderedSet,
}

/// Catalog entry for one aggregate function.
#[derive(Debug, Clone)]
pub struct AggregateDesc {
    pub name: &'static str,
    pub kind: AggKind,

    pub trans_fn: AggregateFn,
    pub trans_fn_strict: bool,

    pub final_fn: Option<AggregateFn>,
    pub final_fn_strict: bool,
    /// When set, the finalfn receives the aggregate's direct arguments after
    /// the transition value.
    pub final_fn_extra_args: bool,

    pub combine_fn: Option<AggregateFn>,
    pub combine_fn_strict: bool,

    pub serialize_fn: Option<AggregateFn>,
    pub deserialize_fn: Option<AggregateFn>,

    pub arg_types: Vec<DataType>,
    pub trans_type: DataType,
    pub result_type: DataType,
    /// None represents a null initial transition value.
    pub init_value: Option<Datum>,
}

impl AggregateDesc {
    /// Whether this aggregate can participate in hybrid (spilling) hash
    /// aggregation: it must be combinable, and an internal transition state
    /// must be serializable in both directions.
    pub fn supports_hybrid(&self) -> bool {
        if self.combine_fn.is_none() {
            return false;
        }
        if self.trans_type == DataType::Internal {
            return self.serialize_fn.is_some() && self.deserialize_fn.is_some();
        }
        true
    }
}

/// Lookup of aggregate descriptors by function id.
#[derive(Debug)]
pub struct AggregateCatalog {
    entries: Vec<AggregateDesc>,
    /// Functions the current role may not execute. Permission denial is fatal
    /// at operator construction.
    denied: HashSet<FunctionId>,
}

static SYSTEM_CATALOG: Lazy<AggregateCatalog> = Lazy::new(|| AggregateCatalog {
    entries: builtin::builtin_aggregates(),
    denied: HashSet::new(),
});

impl AggregateCatalog {
    pub fn system() -> &'static AggregateCatalog {
        &SYSTEM_CATALOG
    }

    /// Catalog with some functions denied. Test seam for the permission
    /// failure path.
    pub fn with_denied(denied: impl IntoIterator<Item = FunctionId>) -> AggregateCatalog {
        AggregateCatalog {
            entries: builtin::builtin_aggregates(),
            denied: denied.into_iter().collect(),
        }
    }

    pub fn lookup(&self, id: FunctionId) -> Result<&AggregateDesc> {
        self.entries
            .get(id.0 as usize)
            .ok_or_else(|| QuernError::new(format!("No aggregate function with id {}", id.0)))
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<FunctionId> {
        self.entries
            .iter()
            .position(|desc| desc.name == name)
            .map(|idx| FunctionId(idx as u32))
            .ok_or_else(|| QuernError::new(format!("No aggregate function named '{name}'")))
    }

    pub fn check_permission(&self, id: FunctionId) -> Result<()> {
        if self.denied.contains(&id) {
            let name = self.lookup(id).map(|d| d.name).unwrap_or("?");
            return Err(QuernError::new(format!(
                "Permission denied for aggregate function {name}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_roundtrips() {
        let catalog = AggregateCatalog::system();
        let id = catalog.lookup_by_name("sum_int64").unwrap();
        assert_eq!("sum_int64", catalog.lookup(id).unwrap().name);
    }

    #[test]
    fn missing_function_is_an_error() {
        let catalog = AggregateCatalog::system();
        assert!(catalog.lookup(FunctionId(u32::MAX)).is_err());
        assert!(catalog.lookup_by_name("no_such_aggregate").is_err());
    }

    #[test]
    fn denied_function_fails_permission_check() {
        let catalog = AggregateCatalog::system();
        let id = catalog.lookup_by_name("count_star").unwrap();
        let restricted = AggregateCatalog::with_denied([id]);
        assert!(restricted.check_permission(id).is_err());
        assert!(catalog.check_permission(id).is_ok());
    }

    #[test]
    fn hybrid_support_requires_combine_and_serial() {
        let catalog = AggregateCatalog::system();
        let sum = catalog
            .lookup(catalog.lookup_by_name("sum_int64").unwrap())
            .unwrap();
        assert!(sum.supports_hybrid());

        let avg = catalog
            .lookup(catalog.lookup_by_name("avg_float64").unwrap())
            .unwrap();
        assert_eq!(DataType::Internal, avg.trans_type);
        assert!(avg.supports_hybrid());

        let array_agg = catalog
            .lookup(catalog.lookup_by_name("array_agg").unwrap())
            .unwrap();
        assert!(!array_agg.supports_hybrid());
    }
}
