//! C8 — the diff planner: a BFS-like relaxation over the edge DAG that
//! picks one minimum-cost incoming diff per required volume.
//!
//! Ported from `BestDiffs.py`'s `analyze`/`_cost`/`_prune`/`_wouldLoop`,
//! using the spec's resolved later-revision constants (`h-6` corruption
//! exponent, `size/16` storage term) rather than this file's earlier
//! `h-8`/full-size values (see `DESIGN.md`'s Open Question resolutions).
//! Recursion in the original's `_height`/`_total_size` is replaced by the
//! iterative height-layered relaxation below, capped at [`MAX_HEIGHT`].

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use uuid::Uuid;

use crate::model::{Diff, SinkId};
use crate::store::{Store, StoreError};

/// Cap on chain depth before a cycle is assumed (design note: replace
/// unbounded recursion with an iteration bound).
pub const MAX_HEIGHT: u32 = 256;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("cannot reach required volume {0}")]
    CannotReach(Uuid),
    #[error("relaxation exceeded the maximum chain depth ({MAX_HEIGHT}); a cycle is likely")]
    CycleLimitExceeded,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
struct Node {
    diff: Option<Diff>,
    /// Cost of `diff`, cached at the time it was accepted so later
    /// candidates compare against it directly instead of recomputing it
    /// from the (possibly since-pruned) predecessor chain.
    cost: f64,
    height: u32,
    intermediate: bool,
    /// Accumulated adjusted size of the chain ending at this node; feeds
    /// the `total_size(prev_node)` terms of the cost function for any
    /// edge originating here.
    total_size: f64,
    prev: Option<Uuid>,
}

/// A fully-resolved sync plan.
///
/// `diffs` are in the order they must be applied (ascending height,
/// parents before children) and each needs an actual transfer. `kept`
/// holds edges whose best incoming diff already lives at the
/// destination (the destination store itself won the relaxation for
/// that node) — nothing to send, the caller should call `Store::keep`
/// on each instead (spec §9's `--delete`-mode resolution: such edges are
/// always retained, never re-transferred or deleted).
#[derive(Debug, Clone)]
pub struct Plan {
    pub diffs: Vec<Diff>,
    pub kept: Vec<Diff>,
}

/// Runs the relaxation once: seeds the root sentinel, expands height by
/// height, and prunes unreferenced intermediate nodes. Does not perform
/// the measurement loop (see [`plan_with_measurement`]).
pub fn plan(required: &[Uuid], stores: &[Box<dyn Store>], will_measure: bool, delete_mode: bool) -> Result<Plan, PlannerError> {
    if stores.is_empty() {
        return Ok(Plan { diffs: Vec::new(), kept: Vec::new() });
    }
    let dest_index = stores.len() - 1;
    let required_set: HashSet<Uuid> = required.iter().copied().collect();

    let mut nodes: HashMap<Uuid, Node> = HashMap::new();
    let mut frontier: Vec<Option<Uuid>> = vec![None];
    let mut height: u32 = 1;

    while !frontier.is_empty() {
        if height > MAX_HEIGHT {
            return Err(PlannerError::CycleLimitExceeded);
        }

        frontier.sort_by(|a, b| {
            let (ia, sa) = sort_key(*a, &nodes);
            let (ib, sb) = sort_key(*b, &nodes);
            ia.cmp(&ib).then(sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut updated: HashSet<Uuid> = HashSet::new();

        for from_opt in frontier.iter().copied() {
            let (from_total, from_intermediate, from_sink_is_dest) = predecessor_info(from_opt, &nodes, dest_index);

            for store_idx in (0..stores.len()).rev() {
                let is_dest = store_idx == dest_index;
                let edges = stores[store_idx].get_edges(from_opt)?;
                for mut edge in edges {
                    edge.sink = store_idx as SinkId;
                    let to = edge.to;

                    if !is_dest && stores[dest_index].has_edge(&edge)? {
                        continue;
                    }
                    if would_loop(from_opt, to, &nodes) {
                        continue;
                    }

                    let edge_size = edge.adjusted_size(will_measure);
                    let new_cost = cost(is_dest, edge_size, from_total, from_intermediate, from_sink_is_dest, height, delete_mode);
                    let old_cost = nodes.get(&to).map(|n| n.cost).unwrap_or(f64::INFINITY);
                    if old_cost <= new_cost {
                        continue;
                    }

                    nodes.insert(
                        to,
                        Node {
                            diff: Some(edge),
                            cost: new_cost,
                            height,
                            intermediate: !required_set.contains(&to),
                            total_size: from_total + edge_size,
                            prev: from_opt,
                        },
                    );
                    updated.insert(to);
                }
            }
        }

        frontier = updated.into_iter().map(Some).collect();
        height += 1;
    }

    prune(&mut nodes);

    for &req in &required_set {
        match nodes.get(&req) {
            Some(n) if n.diff.is_some() => {}
            _ => return Err(PlannerError::CannotReach(req)),
        }
    }

    let mut ordered: Vec<(&Uuid, &Node)> = nodes.iter().collect();
    ordered.sort_by_key(|(_, n)| n.height);

    let mut diffs = Vec::new();
    let mut kept = Vec::new();
    for (_, n) in ordered {
        let Some(d) = n.diff.clone() else { continue };
        if d.sink == dest_index {
            kept.push(d);
        } else {
            diffs.push(d);
        }
    }
    Ok(Plan { diffs, kept })
}

/// Runs [`plan`], then asks each chosen edge whose size is still
/// estimated to measure exactly (when its store supports it), and reruns
/// the relaxation if the measured total exceeds 1.2x the estimated total.
/// Bounded to two rerelaxation passes so a store that never converges
/// cannot loop forever.
pub fn plan_with_measurement(
    required: &[Uuid],
    stores: &[Box<dyn Store>],
    chunk_size: usize,
    delete_mode: bool,
) -> Result<Plan, PlannerError> {
    let any_remote = stores.iter().any(|s| s.is_remote());
    let mut plan_result = plan(required, stores, any_remote, delete_mode)?;
    if !any_remote {
        return Ok(plan_result);
    }

    for _ in 0..2 {
        let estimated_total: f64 = plan_result.diffs.iter().map(|d| d.adjusted_size(true)).sum();
        let mut measured_diffs = Vec::with_capacity(plan_result.diffs.len());
        let mut measured_total = 0.0f64;
        let mut any_measured = false;

        for mut diff in plan_result.diffs {
            if diff.size_is_estimated {
                if let Some(store) = stores.get(diff.sink) {
                    if store.measure_size(&mut diff, chunk_size).is_ok() {
                        any_measured = true;
                    }
                }
            }
            measured_total += diff.size as f64;
            measured_diffs.push(diff);
        }

        if !any_measured || estimated_total <= 0.0 || measured_total <= estimated_total * 1.2 {
            return Ok(Plan {
                diffs: measured_diffs,
                kept: plan_result.kept,
            });
        }

        plan_result = plan(required, stores, false, delete_mode)?;
    }

    Ok(plan_result)
}

fn sort_key(from_opt: Option<Uuid>, nodes: &HashMap<Uuid, Node>) -> (bool, f64) {
    match from_opt {
        None => (false, 0.0),
        Some(u) => nodes.get(&u).map(|n| (n.intermediate, n.total_size)).unwrap_or((false, 0.0)),
    }
}

fn predecessor_info(from_opt: Option<Uuid>, nodes: &HashMap<Uuid, Node>, dest_index: usize) -> (f64, bool, bool) {
    match from_opt {
        None => (0.0, false, false),
        Some(u) => match nodes.get(&u) {
            Some(n) => {
                let sink_is_dest = n.diff.as_ref().map(|d| d.sink == dest_index).unwrap_or(false);
                (n.total_size, n.intermediate, sink_is_dest)
            }
            None => (0.0, false, false),
        },
    }
}

/// Walks `from_opt`'s chain of predecessors back toward the root; true if
/// `to` already appears in it (accepting the edge would create a cycle).
/// Bounded by [`MAX_HEIGHT`] so a corrupt `prev` chain cannot spin forever.
fn would_loop(from_opt: Option<Uuid>, to: Uuid, nodes: &HashMap<Uuid, Node>) -> bool {
    let mut current = from_opt;
    let mut steps = 0u32;
    while let Some(u) = current {
        if u == to {
            return true;
        }
        steps += 1;
        if steps > MAX_HEIGHT {
            return false;
        }
        current = nodes.get(&u).and_then(|n| n.prev);
    }
    false
}

/// Repeatedly removes intermediate nodes no other retained node depends
/// on, until the graph is stable.
fn prune(nodes: &mut HashMap<Uuid, Node>) {
    loop {
        let depended_on: HashSet<Uuid> = nodes
            .values()
            .filter_map(|n| n.diff.as_ref().and_then(|d| d.from))
            .collect();
        let to_remove: Vec<Uuid> = nodes
            .iter()
            .filter(|(uuid, n)| n.intermediate && !depended_on.contains(*uuid))
            .map(|(uuid, _)| *uuid)
            .collect();
        if to_remove.is_empty() {
            break;
        }
        for uuid in to_remove {
            nodes.remove(&uuid);
        }
    }
}

/// `transfer + storage + corruption`, per spec §4.8: the corruption term
/// exponentially penalizes deep chains (`h - 6` exponent, not the earlier
/// `h - 8` revision).
fn cost(is_dest: bool, size: f64, prev_total_size: f64, prev_intermediate: bool, prev_sink_is_dest: bool, height: u32, delete_mode: bool) -> f64 {
    let mut transfer = if is_dest { 0.0 } else { size };
    if !is_dest && prev_intermediate && !prev_sink_is_dest {
        transfer += prev_total_size;
    }
    let storage = if !is_dest || delete_mode { size / 16.0 } else { 0.0 };
    let corruption = (prev_total_size + size) * 2f64.powi(height as i32 - 6);
    transfer + storage + corruption
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ShowProgress;
    use std::cell::RefCell;
    use std::io::{Read, Write};

    /// An in-memory mock store: edges are supplied up front, `has_edge`
    /// answers from a fixed set, nothing is ever sent/received.
    struct MockStore {
        edges: Vec<Diff>,
        existing: HashSet<(Uuid, Option<Uuid>)>,
        measured: RefCell<HashSet<(Uuid, Option<Uuid>)>>,
    }

    impl MockStore {
        fn new(edges: Vec<Diff>) -> Self {
            MockStore {
                edges,
                existing: HashSet::new(),
                measured: RefCell::new(HashSet::new()),
            }
        }

        fn with_existing(mut self, to: Uuid, from: Option<Uuid>) -> Self {
            self.existing.insert((to, from));
            self
        }
    }

    impl Store for MockStore {
        fn open(&mut self) -> crate::store::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> crate::store::Result<()> {
            Ok(())
        }
        fn list_volumes(&self) -> crate::store::Result<Vec<crate::model::Volume>> {
            Ok(Vec::new())
        }
        fn list_contents(&self) -> crate::store::Result<Vec<crate::store::ContentLine>> {
            Ok(Vec::new())
        }
        fn get_paths(&self, _vol: Uuid) -> crate::store::Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn get_edges(&self, from_vol: Option<Uuid>) -> crate::store::Result<Vec<Diff>> {
            Ok(self.edges.iter().filter(|e| e.from == from_vol).cloned().collect())
        }
        fn has_edge(&self, diff: &Diff) -> crate::store::Result<bool> {
            Ok(self.existing.contains(&(diff.to, diff.from)))
        }
        fn measure_size(&self, diff: &mut Diff, _chunk_size: usize) -> crate::store::Result<()> {
            self.measured.borrow_mut().insert((diff.to, diff.from));
            diff.size_is_estimated = false;
            Ok(())
        }
        fn send(&mut self, _diff: &Diff) -> crate::store::Result<Option<Box<dyn Read>>> {
            Ok(None)
        }
        fn receive(&mut self, _diff: &Diff, _paths: &[String]) -> crate::store::Result<Option<Box<dyn Write>>> {
            Ok(None)
        }
        fn receive_volume_info(&mut self, _paths: &[String]) -> crate::store::Result<Option<Box<dyn Write>>> {
            Ok(None)
        }
        fn keep(&mut self, _diff: &Diff) -> crate::store::Result<()> {
            Ok(())
        }
        fn delete_unused(&mut self, _dry_run: bool) -> crate::store::Result<()> {
            Ok(())
        }
        fn delete_partials(&mut self, _dry_run: bool) -> crate::store::Result<()> {
            Ok(())
        }
        fn show_progress(&self) -> ShowProgress {
            ShowProgress::Never
        }
        fn is_remote(&self) -> bool {
            false
        }
    }

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn exact(to: Uuid, from: Option<Uuid>, size: u64, sink: SinkId) -> Diff {
        Diff::new(to, from, size, false, sink)
    }

    /// S1 — trivial plan: A from root (100), B from A (10); destination empty.
    #[test]
    fn s1_trivial_plan_sums_direct_chain() {
        let a = uuid(1);
        let b = uuid(2);
        let source = MockStore::new(vec![exact(a, None, 100, 0), exact(b, Some(a), 10, 0)]);
        let dest = MockStore::new(vec![]);
        let stores: Vec<Box<dyn Store>> = vec![Box::new(source), Box::new(dest)];

        let plan = plan(&[a, b], &stores, false, false).unwrap();
        let total: u64 = plan.diffs.iter().map(|d| d.size).sum();
        assert_eq!(total, 110);
        assert_eq!(plan.diffs[0].to, a);
        assert_eq!(plan.diffs[1].to, b);
    }

    /// S2 — destination already has `root->A`; only `A->B` should transfer,
    /// and `root->A` surfaces as `kept` rather than a diff to transfer.
    #[test]
    fn s2_skips_edge_already_at_destination() {
        let a = uuid(1);
        let b = uuid(2);
        let source = MockStore::new(vec![exact(a, None, 100, 0), exact(b, Some(a), 10, 0)]);
        let dest = MockStore::new(vec![exact(a, None, 100, 1)]).with_existing(a, None);
        let stores: Vec<Box<dyn Store>> = vec![Box::new(source), Box::new(dest)];

        let plan = plan(&[a, b], &stores, false, false).unwrap();
        assert_eq!(plan.diffs.len(), 1);
        assert_eq!(plan.diffs[0].to, b);
        assert_eq!(plan.diffs[0].from, Some(a));
        assert_eq!(plan.kept.len(), 1);
        assert_eq!(plan.kept[0].to, a);
    }

    /// S3 — cheaper via intermediate B (not required): root->C direct is
    /// 1000; root->B (200) + B->C (50) = 250 is cheaper and must win.
    #[test]
    fn s3_prefers_cheaper_intermediate_chain() {
        let b = uuid(2);
        let c = uuid(3);
        let source = MockStore::new(vec![
            exact(c, None, 1000, 0),
            exact(b, None, 200, 0),
            exact(c, Some(b), 50, 0),
        ]);
        let dest = MockStore::new(vec![]);
        let stores: Vec<Box<dyn Store>> = vec![Box::new(source), Box::new(dest)];

        let plan = plan(&[c], &stores, false, false).unwrap();
        assert_eq!(plan.diffs.len(), 2);
        assert!(plan.diffs.iter().any(|d| d.to == b && d.from.is_none()));
        assert!(plan.diffs.iter().any(|d| d.to == c && d.from == Some(b)));
    }

    /// S4 — loop avoidance: edges A->B and B->A both exist; the planner
    /// must pick exactly one direction and never chain through a volume
    /// twice.
    #[test]
    fn s4_avoids_loops_between_mutual_edges() {
        let a = uuid(1);
        let b = uuid(2);
        let source = MockStore::new(vec![
            exact(a, None, 50, 0),
            exact(b, Some(a), 10, 0),
            exact(a, Some(b), 10, 0),
        ]);
        let dest = MockStore::new(vec![]);
        let stores: Vec<Box<dyn Store>> = vec![Box::new(source), Box::new(dest)];

        let plan = plan(&[a, b], &stores, false, false).unwrap();
        // A's only accepted diff must be the root edge: a reciprocal B->A
        // edge would require A to already have a diff, which would be a
        // self-referential cycle through A.
        let a_diff = plan.diffs.iter().find(|d| d.to == a).unwrap();
        assert_eq!(a_diff.from, None);
    }

    #[test]
    fn cannot_reach_is_surfaced_for_missing_volume() {
        let missing = uuid(9);
        let stores: Vec<Box<dyn Store>> = vec![Box::new(MockStore::new(vec![])), Box::new(MockStore::new(vec![]))];
        let err = plan(&[missing], &stores, false, false).unwrap_err();
        assert!(matches!(err, PlannerError::CannotReach(u) if u == missing));
    }

    /// Invariant 9: a single-edge chain at height >= 8 costs strictly more
    /// than a same-size direct edge, per the `h-6` exponent.
    #[test]
    fn invariant_corruption_grows_with_height() {
        let direct = cost(false, 1000.0, 0.0, false, false, 1, false);
        let deep = cost(false, 1000.0, 0.0, false, false, 8, false);
        assert!(deep > direct);
    }

    /// Invariant 10: a `from = None` edge is a valid root edge.
    #[test]
    fn invariant_root_edge_has_no_parent() {
        let a = uuid(1);
        let source = MockStore::new(vec![exact(a, None, 10, 0)]);
        let dest = MockStore::new(vec![]);
        let stores: Vec<Box<dyn Store>> = vec![Box::new(source), Box::new(dest)];
        let plan = plan(&[a], &stores, false, false).unwrap();
        assert_eq!(plan.diffs[0].from, None);
    }

    /// Pruning: an intermediate node nobody depends on is dropped.
    #[test]
    fn prune_drops_unreferenced_intermediate() {
        let b = uuid(2);
        let mut nodes: HashMap<Uuid, Node> = HashMap::new();
        nodes.insert(
            b,
            Node {
                diff: Some(exact(b, None, 10, 0)),
                cost: 1.0,
                height: 1,
                intermediate: true,
                total_size: 10.0,
                prev: None,
            },
        );
        prune(&mut nodes);
        assert!(nodes.is_empty());
    }
}
