//! Proof node sets over chunk trees.
//!
//! A prover selects the inner nodes whose subtrees reach every claimed
//! `(id, size)` pair; a verifier replays a breadth-first walk from the trusted
//! roots through that set and reports every claim it could not confirm.
//!
//! Set entries are shallow (see [`DedupNode::shallow`]): an inner child without
//! children is expanded through the set's entry for the same identifier. The
//! verifier only descends into a node whose hash and size follow from its
//! children, so an entry cannot vouch for content its identifier does not
//! commit to.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, instrument};

use crate::dedup::DedupNode;
use crate::error::{DedupError, DedupResult};
use crate::identifier::{DedupIdentifier, NodeDedupIdentifier};

/// Inner nodes keyed by their identifier
pub type NodeSet = HashMap<NodeDedupIdentifier, DedupNode>;

/// Claimed content sizes keyed by identifier
pub type TargetSizes = HashMap<DedupIdentifier, u64>;

/// Every inner node under `root`, including `root`, in shallow form
pub fn collect_node_set(root: &DedupNode) -> DedupResult<NodeSet> {
    root.enumerate_inner_nodes_depth_first()
        .into_iter()
        .map(|node| Ok((node.node_id()?, node.shallow())))
        .collect()
}

/// Map every child identifier to the node listing it. When a child appears
/// under several nodes the last one visited wins.
pub fn build_parent_lookup(nodes: &NodeSet) -> HashMap<DedupIdentifier, NodeDedupIdentifier> {
    let mut parents = HashMap::new();
    for (id, node) in nodes {
        for child in node.children() {
            parents.insert(child.dedup_id(), *id);
        }
    }
    parents
}

/// Collect the ancestors of every target, walking parent links up to a root
/// or to a node already collected. A target without a parent must itself be a
/// node in `all_nodes`.
#[instrument(skip_all, fields(nodes = all_nodes.len()))]
pub fn build_proof_nodes<'a, I>(all_nodes: &NodeSet, target_ids: I) -> DedupResult<NodeSet>
where
    I: IntoIterator<Item = &'a DedupIdentifier>,
{
    let parents = build_parent_lookup(all_nodes);
    let mut proof = NodeSet::new();
    for target in target_ids {
        let Some(&first_parent) = parents.get(target) else {
            let node_id = target
                .as_node()
                .ok()
                .filter(|id| all_nodes.contains_key(id))
                .ok_or(DedupError::ProofTargetNotFound(*target))?;
            if let Some(node) = all_nodes.get(&node_id) {
                proof.entry(node_id).or_insert_with(|| node.shallow());
            }
            continue;
        };
        let mut current = first_parent;
        while !proof.contains_key(&current) {
            let node = all_nodes
                .get(&current)
                .ok_or(DedupError::ProofTargetNotFound(current.into()))?;
            proof.insert(current, node.shallow());
            match parents.get(&DedupIdentifier::from(current)) {
                Some(&parent) => current = parent,
                None => break,
            }
        }
    }
    debug!(proof_nodes = proof.len(), "proof nodes collected");
    Ok(proof)
}

/// The entry for `id`, if it carries children that its identifier commits to
fn trusted_entry<'a>(proof: &'a NodeSet, id: &DedupIdentifier) -> Option<&'a DedupNode> {
    let node = proof.get(&id.as_node().ok()?)?;
    let sound = node.dedup_id() == *id
        && !node.children().is_empty()
        && node.has_consistent_children();
    sound.then_some(node)
}

/// Node whose children stand for `node`'s: `node` itself when it carries
/// them, else the set entry with the same identifier and size. `None` for
/// leaves and for anything that fails its checks.
fn expand<'a>(proof: &'a NodeSet, node: &'a DedupNode) -> Option<&'a DedupNode> {
    if !node.is_inner() {
        return None;
    }
    if !node.children().is_empty() {
        return node.has_consistent_children().then_some(node);
    }
    trusted_entry(proof, &node.dedup_id())
        .filter(|entry| entry.transitive_content_bytes() == node.transitive_content_bytes())
}

/// What one candidate contributes to a cover
struct Reach {
    /// Targets reachable from the candidate, itself included
    covers: HashSet<DedupIdentifier>,
    /// Set entries the walk passed through, which a verifier needs as well
    needs: Vec<NodeDedupIdentifier>,
}

/// Walk from `candidate` through `proof`, checking every reached target's
/// claimed size.
fn reach_of(proof: &NodeSet, candidate: &DedupNode, targets: &TargetSizes) -> DedupResult<Reach> {
    let mut covers = HashSet::new();
    let mut needs = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![candidate];
    while let Some(node) = stack.pop() {
        let id = node.dedup_id();
        if !seen.insert(id) {
            continue;
        }
        if let Some(&claimed) = targets.get(&id) {
            let actual = node.transitive_content_bytes();
            if claimed != actual {
                return Err(DedupError::SizeMismatch {
                    id,
                    claimed,
                    actual,
                });
            }
            covers.insert(id);
        }
        if let Some(expanded) = expand(proof, node) {
            if let Ok(node_id) = expanded.node_id() {
                if proof.contains_key(&node_id) {
                    needs.push(node_id);
                }
            }
            stack.extend(expanded.children());
        }
    }
    Ok(Reach { covers, needs })
}

/// Greedy set cover: repeatedly keep the proof node reaching the most
/// still-uncovered targets, together with the entries its walk expands
/// through and its ancestors in `proof_nodes`, so that the result is
/// reachable from the roots. The result is within a logarithmic factor of the
/// minimum, not necessarily minimal.
#[instrument(skip_all, fields(proof_nodes = proof_nodes.len(), targets = targets.len()))]
pub fn approximate_min_coverage(proof_nodes: &NodeSet, targets: &TargetSizes) -> DedupResult<NodeSet> {
    let mut candidates = proof_nodes
        .iter()
        .map(|(id, node)| Ok((*id, reach_of(proof_nodes, node, targets)?)))
        .collect::<DedupResult<Vec<_>>>()?;
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let parents = build_parent_lookup(proof_nodes);
    let mut uncovered: HashSet<DedupIdentifier> = targets.keys().copied().collect();
    let mut chosen = NodeSet::new();
    while !uncovered.is_empty() {
        let best = candidates
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, usize)>, (index, (_, reach))| {
                match best {
                    Some((_, count)) if count >= reach.covers.len() => best,
                    _ => Some((index, reach.covers.len())),
                }
            });
        let index = match best {
            Some((index, count)) if count > 0 => index,
            _ => {
                let mut uncovered: Vec<_> = uncovered.into_iter().collect();
                uncovered.sort();
                return Err(DedupError::IncompleteCoverage { uncovered });
            }
        };
        let (picked_id, picked) = candidates.remove(index);
        for covered in &picked.covers {
            uncovered.remove(covered);
        }
        for (_, reach) in candidates.iter_mut() {
            reach.covers.retain(|target| !picked.covers.contains(target));
        }
        let mut keep = vec![picked_id];
        keep.extend(picked.needs);
        let mut current = picked_id;
        while let Some(&parent) = parents.get(&DedupIdentifier::from(current)) {
            if chosen.contains_key(&parent) || keep.contains(&parent) {
                break;
            }
            keep.push(parent);
            current = parent;
        }
        for id in keep {
            if let Some(node) = proof_nodes.get(&id) {
                chosen.entry(id).or_insert_with(|| node.clone());
            }
        }
    }
    debug!(chosen = chosen.len(), "coverage selected");
    Ok(chosen)
}

/// Sizes of everything reachable from `roots` through `proof`, descending
/// only into nodes that match their identifiers
fn reachable_sizes(proof: &NodeSet, roots: &[DedupIdentifier]) -> HashMap<DedupIdentifier, u64> {
    let mut visited = HashMap::new();
    let mut queue = VecDeque::new();
    for root in roots {
        let Some(node) = trusted_entry(proof, root) else {
            continue;
        };
        if visited.insert(*root, node.transitive_content_bytes()).is_none() {
            queue.push_back(node);
        }
    }
    while let Some(node) = queue.pop_front() {
        for child in node.children() {
            let id = child.dedup_id();
            if visited.contains_key(&id) {
                continue;
            }
            visited.insert(id, child.transitive_content_bytes());
            if let Some(expanded) = expand(proof, child) {
                queue.push_back(expanded);
            }
        }
    }
    visited
}

/// Outcome of one verification walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofReport {
    /// Targets not reached from the roots, or reached with a different size,
    /// in identifier order
    pub unvalidated: Vec<DedupIdentifier>,
    mismatch: Option<(DedupIdentifier, u64, u64)>,
}

impl ProofReport {
    /// Whether every target was confirmed
    pub fn is_valid(&self) -> bool {
        self.unvalidated.is_empty()
    }

    /// `SizeMismatch` for the first mismatched target in identifier order,
    /// else `IncompleteCoverage` when anything is unvalidated
    pub fn into_result(self) -> DedupResult<()> {
        if let Some((id, claimed, actual)) = self.mismatch {
            return Err(DedupError::SizeMismatch {
                id,
                claimed,
                actual,
            });
        }
        if self.unvalidated.is_empty() {
            Ok(())
        } else {
            Err(DedupError::IncompleteCoverage {
                uncovered: self.unvalidated,
            })
        }
    }
}

/// Walk `proof` from `roots` once and compare every target against it
pub fn check_proof(proof: &NodeSet, roots: &[DedupIdentifier], targets: &TargetSizes) -> ProofReport {
    let visited = reachable_sizes(proof, roots);
    let mut ids: Vec<_> = targets.iter().collect();
    ids.sort();
    let mut unvalidated = Vec::new();
    let mut mismatch = None;
    for (id, &claimed) in ids {
        match visited.get(id) {
            Some(&actual) if actual == claimed => {}
            Some(&actual) => {
                mismatch.get_or_insert((*id, claimed, actual));
                unvalidated.push(*id);
            }
            None => unvalidated.push(*id),
        }
    }
    ProofReport {
        unvalidated,
        mismatch,
    }
}

/// Targets not reached from `roots`, or reached with a different size,
/// in identifier order.
pub fn determine_unvalidated_ids(
    proof_nodes: &NodeSet,
    roots: &[DedupIdentifier],
    targets: &TargetSizes,
) -> Vec<DedupIdentifier> {
    check_proof(proof_nodes, roots, targets).unvalidated
}

/// Proof for `targets` drawn from `all_nodes`: ancestors of every target,
/// reduced to a greedy coverage set.
pub fn build_proof(all_nodes: &NodeSet, targets: &TargetSizes) -> DedupResult<NodeSet> {
    let proof_nodes = build_proof_nodes(all_nodes, targets.keys())?;
    approximate_min_coverage(&proof_nodes, targets)
}

/// Check that every target is reachable from `roots` with its claimed size.
pub fn verify_proof(proof: &NodeSet, roots: &[DedupIdentifier], targets: &TargetSizes) -> DedupResult<()> {
    check_proof(proof, roots, targets).into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::node::unchecked_node;
    use crate::dedup::NodeKind;

    /// Depth-3 binary tree: root, 2 inner, 4 inner, 8 chunks
    fn binary_tree() -> DedupNode {
        let mut level: Vec<DedupNode> = (0..8u8)
            .map(|i| DedupNode::chunk_of(&vec![i; 100 + i as usize]))
            .collect();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| DedupNode::inner(pair.to_vec()).unwrap())
                .collect();
        }
        level.pop().unwrap()
    }

    fn sizes_of<'a>(nodes: impl IntoIterator<Item = &'a DedupNode>) -> TargetSizes {
        nodes
            .into_iter()
            .map(|n| (n.dedup_id(), n.transitive_content_bytes()))
            .collect()
    }

    #[test]
    fn parent_lookup_maps_children() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        assert_eq!(nodes.len(), 7);
        let parents = build_parent_lookup(&nodes);
        assert_eq!(parents.len(), 14);
        assert!(!parents.contains_key(&root.dedup_id()));
        let left = &root.children()[0];
        assert_eq!(parents[&left.dedup_id()], root.node_id().unwrap());
    }

    #[test]
    fn collected_nodes_are_shallow() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        for (id, node) in &nodes {
            assert_eq!(node.node_id().unwrap(), *id);
            assert!(node.children().iter().all(|c| c.children().is_empty()));
        }
    }

    #[test]
    fn proof_of_all_leaves_validates_against_root() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let targets = sizes_of(root.enumerate_chunk_leaves());
        let proof = build_proof(&nodes, &targets).unwrap();
        assert_eq!(proof.len(), 7);
        assert!(proof.contains_key(&root.node_id().unwrap()));
        let roots = [root.dedup_id()];
        assert!(determine_unvalidated_ids(&proof, &roots, &targets).is_empty());
        verify_proof(&proof, &roots, &targets).unwrap();
    }

    #[test]
    fn proof_for_one_leaf_walks_its_ancestors() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let leaf = root.enumerate_chunk_leaves()[5];
        let target_ids = [leaf.dedup_id()];
        let proof_nodes = build_proof_nodes(&nodes, &target_ids).unwrap();
        assert_eq!(proof_nodes.len(), 3);
        let targets = sizes_of([leaf]);
        let proof = approximate_min_coverage(&proof_nodes, &targets).unwrap();
        assert_eq!(proof, proof_nodes);
        let roots = [root.dedup_id()];
        assert!(determine_unvalidated_ids(&proof, &roots, &targets).is_empty());

        for missing in proof.keys() {
            let mut partial = proof.clone();
            partial.remove(missing);
            assert_eq!(
                determine_unvalidated_ids(&partial, &roots, &targets),
                vec![leaf.dedup_id()]
            );
        }
    }

    #[test]
    fn tampered_leaf_size_is_unvalidated() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let targets = sizes_of(root.enumerate_chunk_leaves());
        let proof = build_proof(&nodes, &targets).unwrap();

        let tampered_leaf = root.enumerate_chunk_leaves()[3].dedup_id();
        let mut tampered = targets.clone();
        *tampered.get_mut(&tampered_leaf).unwrap() += 1;
        let roots = [root.dedup_id()];
        assert_eq!(
            determine_unvalidated_ids(&proof, &roots, &tampered),
            vec![tampered_leaf]
        );
        assert!(matches!(
            verify_proof(&proof, &roots, &tampered),
            Err(DedupError::SizeMismatch { id, .. }) if id == tampered_leaf
        ));
        assert!(matches!(
            build_proof(&nodes, &tampered),
            Err(DedupError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn root_target_is_added_directly() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let targets = sizes_of([&root]);
        let proof = build_proof(&nodes, &targets).unwrap();
        assert_eq!(proof.len(), 1);
        verify_proof(&proof, &[root.dedup_id()], &targets).unwrap();
    }

    #[test]
    fn unknown_target_is_rejected() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let stranger = DedupNode::chunk_of(b"not in the tree").dedup_id();
        assert!(matches!(
            build_proof_nodes(&nodes, &[stranger]),
            Err(DedupError::ProofTargetNotFound(id)) if id == stranger
        ));
    }

    #[test]
    fn uncovered_targets_are_reported() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let left = &root.children()[0];
        let left_only: NodeSet = collect_node_set(left).unwrap();
        let targets = sizes_of(root.enumerate_chunk_leaves());
        assert!(matches!(
            approximate_min_coverage(&left_only, &targets),
            Err(DedupError::IncompleteCoverage { uncovered }) if uncovered.len() == 4
        ));
        let missing = determine_unvalidated_ids(&left_only, &[left.dedup_id()], &targets);
        assert_eq!(missing.len(), 4);
        assert!(build_proof(&nodes, &targets).is_ok());
    }

    #[test]
    fn wrong_root_validates_nothing() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let targets = sizes_of(root.enumerate_chunk_leaves());
        let proof = build_proof(&nodes, &targets).unwrap();
        let other = DedupNode::inner(vec![DedupNode::chunk_of(b"other")]).unwrap();
        let unvalidated = determine_unvalidated_ids(&proof, &[other.dedup_id()], &targets);
        assert_eq!(unvalidated.len(), targets.len());
        assert!(matches!(
            verify_proof(&proof, &[other.dedup_id()], &targets),
            Err(DedupError::IncompleteCoverage { .. })
        ));
    }

    #[test]
    fn forged_entry_under_a_trusted_root_is_ignored() {
        let root = binary_tree();
        let root_id = root.node_id().unwrap();
        let fake_leaf = DedupNode::chunk([7; 32], 999_999);
        let forged = unchecked_node(NodeKind::InnerNode, *root.hash(), 999_999, vec![fake_leaf.clone()]);
        let proof: NodeSet = [(root_id, forged)].into_iter().collect();
        let targets = sizes_of([&fake_leaf]);
        let roots = [root.dedup_id()];
        assert_eq!(
            determine_unvalidated_ids(&proof, &roots, &targets),
            vec![fake_leaf.dedup_id()]
        );
        assert!(matches!(
            verify_proof(&proof, &roots, &targets),
            Err(DedupError::IncompleteCoverage { uncovered }) if uncovered == vec![fake_leaf.dedup_id()]
        ));
    }

    #[test]
    fn entry_stored_under_another_id_is_ignored() {
        let root = binary_tree();
        let other = DedupNode::inner(vec![DedupNode::chunk_of(b"x"), DedupNode::chunk_of(b"y")]).unwrap();
        let targets = sizes_of(other.enumerate_chunk_leaves());
        let roots = [root.dedup_id()];

        let swapped_root: NodeSet = [(root.node_id().unwrap(), other.shallow())].into_iter().collect();
        assert!(verify_proof(&swapped_root, &roots, &targets).is_err());

        let left = &root.children()[0];
        let mut swapped_child = collect_node_set(&root).unwrap();
        swapped_child.insert(left.node_id().unwrap(), other.shallow());
        let mut claimed = targets.clone();
        claimed.extend(sizes_of(left.enumerate_chunk_leaves()));
        assert_eq!(
            determine_unvalidated_ids(&swapped_child, &roots, &claimed).len(),
            claimed.len()
        );
    }

    #[test]
    fn expansion_must_agree_with_the_listed_size() {
        let root = binary_tree();
        let left = &root.children()[0];
        let mut proof = collect_node_set(&root).unwrap();
        let honest = proof[&left.node_id().unwrap()].clone();
        let inflated = unchecked_node(
            NodeKind::InnerNode,
            *left.hash(),
            left.transitive_content_bytes() + 1,
            honest.children().to_vec(),
        );
        proof.insert(left.node_id().unwrap(), inflated);
        let targets = sizes_of(left.enumerate_chunk_leaves());
        let unvalidated = determine_unvalidated_ids(&proof, &[root.dedup_id()], &targets);
        assert_eq!(unvalidated.len(), targets.len());
    }

    #[test]
    fn report_lists_mismatches_and_gaps_together() {
        let root = binary_tree();
        let nodes = collect_node_set(&root).unwrap();
        let leaves = root.enumerate_chunk_leaves();
        let mut targets = sizes_of(leaves.iter().copied());
        let proof = build_proof(&nodes, &targets).unwrap();
        let stranger = DedupNode::chunk_of(b"stranger");
        targets.insert(stranger.dedup_id(), 8);
        *targets.get_mut(&leaves[0].dedup_id()).unwrap() += 1;

        let report = check_proof(&proof, &[root.dedup_id()], &targets);
        assert!(!report.is_valid());
        assert_eq!(report.unvalidated.len(), 2);
        assert!(matches!(
            report.into_result(),
            Err(DedupError::SizeMismatch { id, .. }) if id == leaves[0].dedup_id()
        ));
    }
}
