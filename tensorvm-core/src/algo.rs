use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use log::debug;
use once_cell::sync::Lazy;

use crate::{CompNode, Error, ExecutionPolicy, Kernel, OpDef, Result, TensorLayout};

static ALGO_CHOOSER: Lazy<AlgoChooser> = Lazy::new(AlgoChooser::new);

/// One execution strategy of an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgoInfo {
    pub name: &'static str,
    pub workspace_bytes: usize,
    pub feasible: bool,
}

impl AlgoInfo {
    pub fn new(name: &'static str, workspace_bytes: usize) -> Self {
        Self {
            name,
            workspace_bytes,
            feasible: true,
        }
    }

    pub fn infeasible(name: &'static str) -> Self {
        Self {
            name,
            workspace_bytes: 0,
            feasible: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kernel: String,
    op: String,
    device: CompNode,
    layouts: String,
    policy: ExecutionPolicy,
}

/// Process-wide algorithm selection cache.
///
/// Entries are never invalidated; callers wanting a fresh selection pass a
/// different [`ExecutionPolicy`] or call [`AlgoChooser::reset`].
pub struct AlgoChooser {
    cache: Mutex<HashMap<CacheKey, AlgoInfo>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl AlgoChooser {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn inst() -> &'static AlgoChooser {
        &ALGO_CHOOSER
    }

    /// Pick the algorithm and workspace size for `op` on the given layouts.
    pub fn select(
        &self,
        kernel: &dyn Kernel,
        op: &OpDef,
        inputs: &[TensorLayout],
        outputs: &[TensorLayout],
    ) -> Result<AlgoInfo> {
        let device = inputs
            .first()
            .or(outputs.first())
            .map(|l| l.device)
            .unwrap_or_default();
        let layouts = inputs
            .iter()
            .chain(outputs)
            .map(TensorLayout::signature)
            .collect::<Vec<_>>()
            .join(",");
        let key = CacheKey {
            kernel: kernel.name().to_string(),
            op: op.param_key(),
            device,
            layouts,
            policy: op.policy.clone(),
        };
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let candidates = kernel.algorithms(op, inputs, outputs);
        let chosen = choose(&candidates, &op.policy).ok_or_else(|| Error::Kernel {
            kernel: op.name().to_string(),
            msg: format!("no feasible algorithm among {candidates:?}"),
        })?;
        debug!(
            "algo cache miss for {} on {device} [{}]: chose {} ({} bytes workspace)",
            op, key.layouts, chosen.name, chosen.workspace_bytes
        );
        cache.insert(key, chosen.clone());
        Ok(chosen)
    }

    /// Drop all cached selections.
    pub fn reset(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for AlgoChooser {
    fn default() -> Self {
        Self::new()
    }
}

/// The preferred algorithm if usable, then the first feasible one within the
/// workspace budget, else the feasible one with the smallest workspace.
fn choose(candidates: &[AlgoInfo], policy: &ExecutionPolicy) -> Option<AlgoInfo> {
    let limit = policy.workspace_limit.unwrap_or(usize::MAX);
    let fits = |a: &&AlgoInfo| a.feasible && a.workspace_bytes <= limit;
    if let Some(name) = &policy.algo {
        if let Some(a) = candidates.iter().filter(fits).find(|a| a.name == name.as_str()) {
            return Some(a.clone());
        }
    }
    candidates
        .iter()
        .find(fits)
        .or_else(|| {
            candidates
                .iter()
                .filter(|a| a.feasible)
                .min_by_key(|a| a.workspace_bytes)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<AlgoInfo> {
        vec![
            AlgoInfo::infeasible("FAST"),
            AlgoInfo::new("IM2COL", 4096),
            AlgoInfo::new("DIRECT", 0),
        ]
    }

    #[test]
    fn first_feasible_in_priority_order() {
        let a = choose(&candidates(), &ExecutionPolicy::default()).unwrap();
        assert_eq!(a.name, "IM2COL");
    }

    #[test]
    fn workspace_limit_and_preference() {
        let limited = ExecutionPolicy {
            algo: None,
            workspace_limit: Some(1024),
        };
        assert_eq!(choose(&candidates(), &limited).unwrap().name, "DIRECT");
        let preferred = ExecutionPolicy {
            algo: Some("DIRECT".to_string()),
            workspace_limit: None,
        };
        assert_eq!(choose(&candidates(), &preferred).unwrap().name, "DIRECT");
        let tight = ExecutionPolicy {
            algo: None,
            workspace_limit: Some(0),
        };
        let only_big = vec![AlgoInfo::new("A", 64), AlgoInfo::new("B", 32)];
        assert_eq!(choose(&only_big, &tight).unwrap().name, "B");
    }
}
