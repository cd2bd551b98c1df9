//! Graph Index
//!
//! Adjacency maps derived from the tabular store's relationship tables,
//! rebuilt on load and incrementally maintained on every mutation. The index
//! answers exactly three queries, all in sublinear time over live edges:
//!
//! 1. `can(subject, capability, object)` - bounded breadth-first search
//! 2. `accessible_objects(subject, capability)` - group-closure union
//! 3. `accessors(object, capability)` - reverse traversal with provenance
//!
//! Revoked edges are removed from the maps eagerly, and every hop re-checks
//! liveness against the ledger anyway, so a tombstone that is still indexed
//! is never traversed. Self-loops and cycles are pruned by the visited set.

use crate::models::compiled::CompiledSchema;
use crate::models::edge::{Capability, EdgeId, EdgeRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// One traversable hop in the group/containment closure
#[derive(Debug, Clone)]
struct TraversalHop {
    /// The node on the far side of the edge
    node: String,
    /// The edge carrying the hop
    edge_id: EdgeId,
    /// Whether this hop is plain group membership (`member_of`); anything
    /// else reached transitively counts as inherited access
    direct_membership: bool,
}

/// Where an accessor's access comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessSource {
    /// The subject holds the permission edge itself
    Direct,
    /// The subject is a member of the granted group
    Group,
    /// Access arrives through inheritance or containment
    Inherited,
}

/// One entry in an accessor enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessorEntry {
    pub subject: String,
    pub source: AccessSource,
}

/// Derived adjacency structures for one tenant
#[derive(Debug, Default)]
pub struct GraphIndex {
    /// relation -> source -> (target, edge) pairs, live edges only
    forward: HashMap<String, HashMap<String, Vec<(String, EdgeId)>>>,

    /// relation -> target -> (source, edge) pairs, live edges only
    reverse: HashMap<String, HashMap<String, Vec<(String, EdgeId)>>>,

    /// Merged traversal adjacency: node -> outgoing hops over member_of,
    /// inherits_from, and propagating contains relationships
    traverse_out: HashMap<String, Vec<TraversalHop>>,

    /// Merged reverse traversal adjacency: node -> incoming hops
    traverse_in: HashMap<String, Vec<TraversalHop>>,

    /// (subject, capability) -> object -> permission edge
    subject_permissions: HashMap<(String, Capability), BTreeMap<String, EdgeId>>,

    /// (object, capability) -> grantee -> permission edge
    object_grantees: HashMap<(String, Capability), BTreeMap<String, EdgeId>>,
}

impl GraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from scratch over all live edges
    pub fn rebuild<'a>(
        schema: &CompiledSchema,
        edges: impl Iterator<Item = &'a EdgeRecord>,
    ) -> Self {
        let mut index = Self::new();
        for edge in edges.filter(|e| e.is_live()) {
            index.apply_grant(schema, edge);
        }
        index
    }

    /// Index a newly granted edge
    pub fn apply_grant(&mut self, schema: &CompiledSchema, edge: &EdgeRecord) {
        self.forward
            .entry(edge.relation.clone())
            .or_default()
            .entry(edge.source.clone())
            .or_default()
            .push((edge.target.clone(), edge.id));
        self.reverse
            .entry(edge.relation.clone())
            .or_default()
            .entry(edge.target.clone())
            .or_default()
            .push((edge.source.clone(), edge.id));

        let relation = schema.relation(&edge.relation);
        let traversable = relation.map(|r| r.is_traversable()).unwrap_or(false);
        if traversable {
            let direct_membership =
                edge.kind == crate::models::schema::RelationKind::MemberOf;
            self.traverse_out
                .entry(edge.source.clone())
                .or_default()
                .push(TraversalHop {
                    node: edge.target.clone(),
                    edge_id: edge.id,
                    direct_membership,
                });
            self.traverse_in
                .entry(edge.target.clone())
                .or_default()
                .push(TraversalHop {
                    node: edge.source.clone(),
                    edge_id: edge.id,
                    direct_membership,
                });
        }

        if let Some(capability) = &edge.capability {
            if relation.map(|r| r.is_permission()).unwrap_or(false) {
                self.subject_permissions
                    .entry((edge.source.clone(), capability.clone()))
                    .or_default()
                    .insert(edge.target.clone(), edge.id);
                self.object_grantees
                    .entry((edge.target.clone(), capability.clone()))
                    .or_default()
                    .insert(edge.source.clone(), edge.id);
            }
        }
    }

    /// Drop a revoked edge from every map
    pub fn apply_revoke(&mut self, edge: &EdgeRecord) {
        if let Some(sources) = self.forward.get_mut(&edge.relation) {
            if let Some(targets) = sources.get_mut(&edge.source) {
                targets.retain(|(_, id)| *id != edge.id);
            }
        }
        if let Some(targets) = self.reverse.get_mut(&edge.relation) {
            if let Some(sources) = targets.get_mut(&edge.target) {
                sources.retain(|(_, id)| *id != edge.id);
            }
        }
        if let Some(hops) = self.traverse_out.get_mut(&edge.source) {
            hops.retain(|hop| hop.edge_id != edge.id);
        }
        if let Some(hops) = self.traverse_in.get_mut(&edge.target) {
            hops.retain(|hop| hop.edge_id != edge.id);
        }
        if let Some(capability) = &edge.capability {
            let subject_key = (edge.source.clone(), capability.clone());
            if let Some(objects) = self.subject_permissions.get_mut(&subject_key) {
                objects.retain(|_, id| *id != edge.id);
            }
            let object_key = (edge.target.clone(), capability.clone());
            if let Some(grantees) = self.object_grantees.get_mut(&object_key) {
                grantees.retain(|_, id| *id != edge.id);
            }
        }
    }

    /// Live targets of a node under one relation
    pub fn targets(&self, relation: &str, source: &str) -> Vec<(String, EdgeId)> {
        self.forward
            .get(relation)
            .and_then(|sources| sources.get(source))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a path `subject -> (traversal)* -> x -> permission[capability]
    /// -> object` of length at most `max_traversal` exists
    ///
    /// Returns the witness path (edge ids in order) on success, which doubles
    /// as a server-minted edge-path proof. `is_live` re-checks each candidate
    /// edge against the ledger so stale index entries are never trusted.
    pub fn can(
        &self,
        subject: &str,
        capability: &Capability,
        object: &str,
        max_traversal: usize,
        is_live: impl Fn(EdgeId) -> bool,
    ) -> Option<Vec<EdgeId>> {
        if max_traversal == 0 {
            return None;
        }

        // Direct permission: path length 1
        if let Some(edge_id) = self
            .subject_permissions
            .get(&(subject.to_string(), capability.clone()))
            .and_then(|objects| objects.get(object))
        {
            if is_live(*edge_id) {
                return Some(vec![*edge_id]);
            }
        }

        // Bounded BFS over the group closure; each frontier entry carries its
        // path so the first hit yields a witness. The visited set is keyed by
        // node (the capability is fixed for the whole query).
        let mut visited: HashSet<&str> = HashSet::from([subject]);
        let mut frontier: VecDeque<(&str, Vec<EdgeId>)> =
            VecDeque::from([(subject, Vec::new())]);

        while let Some((node, path)) = frontier.pop_front() {
            if path.len() + 1 >= max_traversal {
                continue;
            }
            let Some(hops) = self.traverse_out.get(node) else {
                continue;
            };
            for hop in hops {
                if visited.contains(hop.node.as_str()) || !is_live(hop.edge_id) {
                    continue;
                }
                let mut next_path = path.clone();
                next_path.push(hop.edge_id);

                if let Some(edge_id) = self
                    .subject_permissions
                    .get(&(hop.node.clone(), capability.clone()))
                    .and_then(|objects| objects.get(object))
                {
                    if is_live(*edge_id) {
                        next_path.push(*edge_id);
                        return Some(next_path);
                    }
                }

                visited.insert(hop.node.as_str());
                frontier.push_back((hop.node.as_str(), next_path));
            }
        }

        None
    }

    /// Union of direct permissions and permissions reachable through the
    /// subject's group closure
    pub fn accessible_objects(
        &self,
        subject: &str,
        capability: &Capability,
        max_traversal: usize,
        is_live: impl Fn(EdgeId) -> bool,
    ) -> BTreeSet<String> {
        let mut objects = BTreeSet::new();
        if max_traversal == 0 {
            return objects;
        }

        let mut add_permissions = |node: &str, objects: &mut BTreeSet<String>| {
            if let Some(direct) = self
                .subject_permissions
                .get(&(node.to_string(), capability.clone()))
            {
                for (object, edge_id) in direct {
                    if is_live(*edge_id) {
                        objects.insert(object.clone());
                    }
                }
            }
        };

        add_permissions(subject, &mut objects);

        let mut visited: HashSet<&str> = HashSet::from([subject]);
        let mut frontier: VecDeque<(&str, usize)> = VecDeque::from([(subject, 0)]);
        while let Some((node, depth)) = frontier.pop_front() {
            if depth + 1 >= max_traversal {
                continue;
            }
            let Some(hops) = self.traverse_out.get(node) else {
                continue;
            };
            for hop in hops {
                if visited.contains(hop.node.as_str()) || !is_live(hop.edge_id) {
                    continue;
                }
                add_permissions(&hop.node, &mut objects);
                visited.insert(hop.node.as_str());
                frontier.push_back((hop.node.as_str(), depth + 1));
            }
        }

        objects
    }

    /// Every subject with access to `object` under `capability`, with the
    /// provenance of each subject's access
    ///
    /// A subject reachable several ways keeps its strongest source:
    /// direct, then group, then inherited.
    pub fn accessors(
        &self,
        object: &str,
        capability: &Capability,
        max_traversal: usize,
        is_live: impl Fn(EdgeId) -> bool,
    ) -> Vec<AccessorEntry> {
        let mut best: BTreeMap<String, AccessSource> = BTreeMap::new();
        if max_traversal == 0 {
            return Vec::new();
        }

        let Some(grantees) = self
            .object_grantees
            .get(&(object.to_string(), capability.clone()))
        else {
            return Vec::new();
        };

        for (grantee, edge_id) in grantees {
            if !is_live(*edge_id) {
                continue;
            }
            merge_source(&mut best, grantee, AccessSource::Direct);

            // Reverse closure: everyone who reaches the grantee through the
            // traversal relations also has access
            let mut visited: HashSet<&str> = HashSet::from([grantee.as_str()]);
            let mut frontier: VecDeque<(&str, usize, bool)> =
                VecDeque::from([(grantee.as_str(), 0, true)]);
            while let Some((node, depth, membership_only)) = frontier.pop_front() {
                if depth + 1 >= max_traversal {
                    continue;
                }
                let Some(hops) = self.traverse_in.get(node) else {
                    continue;
                };
                for hop in hops {
                    if visited.contains(hop.node.as_str()) || !is_live(hop.edge_id) {
                        continue;
                    }
                    let still_membership_only =
                        membership_only && hop.direct_membership && depth == 0;
                    let source = if still_membership_only {
                        AccessSource::Group
                    } else {
                        AccessSource::Inherited
                    };
                    merge_source(&mut best, &hop.node, source);
                    visited.insert(hop.node.as_str());
                    frontier.push_back((hop.node.as_str(), depth + 1, still_membership_only));
                }
            }
        }

        best.into_iter()
            .map(|(subject, source)| AccessorEntry { subject, source })
            .collect()
    }
}

fn merge_source(best: &mut BTreeMap<String, AccessSource>, subject: &str, source: AccessSource) {
    match best.get(subject) {
        Some(existing) if *existing <= source => {}
        _ => {
            best.insert(subject.to_string(), source);
        }
    }
}
