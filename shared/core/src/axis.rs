use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named semantic tensor dimension, independent of physical device
/// placement. Axis names are unique within any single shape declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalAxis {
    pub name: String,
    pub size: usize,
}

impl LogicalAxis {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    pub fn resized(&self, size: usize) -> Self {
        Self {
            name: self.name.clone(),
            size,
        }
    }
}

impl fmt::Display for LogicalAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.size)
    }
}

/// Assignment of logical axis names to physical mesh axes. An axis absent
/// from the mapping is replicated; resolution never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMapping {
    entries: BTreeMap<String, String>,
}

impl AxisMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, logical: impl Into<String>, mesh: impl Into<String>) -> Self {
        self.entries.insert(logical.into(), mesh.into());
        self
    }

    /// Resolve a logical axis to zero or one physical mesh axis.
    /// `None` means replicated.
    pub fn resolve(&self, logical: &str) -> Option<&str> {
        self.entries.get(logical).map(|s| s.as_str())
    }

    /// A new mapping with `other`'s entries layered on top of this one.
    pub fn merged(&self, other: &AxisMapping) -> AxisMapping {
        let mut entries = self.entries.clone();
        for (k, v) in &other.entries {
            entries.insert(k.clone(), v.clone());
        }
        AxisMapping { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The physical device mesh and the two sharding layouts used during a
/// run: one for parameter/optimizer-state storage, one for compute.
/// Built once before the loop starts and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub data_parallel_width: usize,
    pub model_parallel_width: usize,
    pub parameter_axis_mapping: AxisMapping,
    pub compute_axis_mapping: AxisMapping,
}

impl MeshConfig {
    pub fn single_device() -> Self {
        Self {
            data_parallel_width: 1,
            model_parallel_width: 1,
            parameter_axis_mapping: AxisMapping::new(),
            compute_axis_mapping: AxisMapping::new(),
        }
    }

    pub fn num_devices(&self) -> usize {
        self.data_parallel_width * self.model_parallel_width
    }
}

/// Holder for the mapping active at a given point of a computation.
///
/// Overrides are scoped: `scoped` swaps in a new mapping and returns a
/// guard that restores the previous one when dropped, including on
/// unwind. This is an explicit value threaded through the computation,
/// not ambient context state.
#[derive(Debug)]
pub struct AxisContext {
    stack: Vec<AxisMapping>,
}

impl AxisContext {
    pub fn new(base: AxisMapping) -> Self {
        Self { stack: vec![base] }
    }

    pub fn active(&self) -> &AxisMapping {
        self.stack.last().expect("axis context stack is never empty")
    }

    /// Resolve under the active mapping. Unmapped axes are replicated.
    pub fn resolve(&self, logical: &str) -> Option<&str> {
        self.active().resolve(logical)
    }

    /// Push `mapping` as the active mapping for the lifetime of the
    /// returned guard. With `merge`, layer it over the current mapping
    /// instead of replacing it.
    pub fn scoped(&mut self, mapping: &AxisMapping, merge: bool) -> MappingGuard<'_> {
        let next = if merge {
            self.active().merged(mapping)
        } else {
            mapping.clone()
        };
        self.stack.push(next);
        MappingGuard { ctx: self }
    }
}

pub struct MappingGuard<'a> {
    ctx: &'a mut AxisContext,
}

impl MappingGuard<'_> {
    pub fn resolve(&self, logical: &str) -> Option<&str> {
        self.ctx.resolve(logical)
    }

    pub fn active(&self) -> &AxisMapping {
        self.ctx.active()
    }
}

impl Drop for MappingGuard<'_> {
    fn drop(&mut self) {
        self.ctx.stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_axis_is_replicated() {
        let mapping = AxisMapping::new().with("batch", "data");
        assert_eq!(mapping.resolve("batch"), Some("data"));
        assert_eq!(mapping.resolve("embed"), None);
    }

    #[test]
    fn scoped_override_restores_on_drop() {
        let base = AxisMapping::new().with("embed", "model");
        let mut ctx = AxisContext::new(base);

        {
            let compute = AxisMapping::new().with("batch", "data");
            let guard = ctx.scoped(&compute, true);
            assert_eq!(guard.resolve("batch"), Some("data"));
            assert_eq!(guard.resolve("embed"), Some("model"));
        }
        assert_eq!(ctx.resolve("batch"), None);
        assert_eq!(ctx.resolve("embed"), Some("model"));
    }

    #[test]
    fn scoped_override_restores_on_unwind() {
        let mut ctx = AxisContext::new(AxisMapping::new());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mapping = AxisMapping::new().with("batch", "data");
            let _guard = ctx.scoped(&mapping, false);
            panic!("mid-scope failure");
        }));
        assert!(result.is_err());
        assert_eq!(ctx.resolve("batch"), None);
    }

    #[test]
    fn replace_scope_drops_base_entries() {
        let mut ctx = AxisContext::new(AxisMapping::new().with("embed", "model"));
        let guard = ctx.scoped(&AxisMapping::new().with("batch", "data"), false);
        assert_eq!(guard.resolve("embed"), None);
    }
}
