use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    arg::{for_each_node_ref, Argument},
    module::GraphModule,
    node::{NodeId, OpKind},
};

#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
    /// Match the pattern's Output node itself instead of anchoring on the
    /// nodes feeding it.
    pub match_output: bool,
    /// Require pattern placeholders to bind graph placeholders rather than
    /// acting as wildcards.
    pub match_placeholder: bool,
    /// Greedily drop matches whose interior overlaps an earlier match.
    pub remove_overlapping_matches: bool,
    /// Treat literal arguments as wildcards instead of comparing by value.
    pub ignore_literals: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            match_output: false,
            match_placeholder: false,
            remove_overlapping_matches: true,
            ignore_literals: false,
        }
    }
}

/// One discovered occurrence of a pattern: an injective map from pattern
/// nodes to graph nodes plus the resolved placeholder bindings and
/// returning nodes, in pattern order.
#[derive(Debug, Clone, Default)]
pub struct InternalMatch {
    /// Graph nodes the pattern anchors were bound to.
    pub anchors: Vec<NodeId>,
    /// pattern node -> graph node.
    pub nodes_map: FxHashMap<NodeId, NodeId>,
    /// graph node -> first pattern node that claimed it.
    owners: FxHashMap<NodeId, NodeId>,
    /// pattern placeholder -> bound literal, for placeholders matched
    /// against literal arguments.
    lit_bindings: FxHashMap<NodeId, Argument>,
    /// What each pattern placeholder bound, in pattern placeholder order.
    pub placeholder_bindings: Vec<Argument>,
    /// Graph nodes matched by the pattern's returning nodes, in order.
    pub returning_nodes: Vec<NodeId>,
}

impl InternalMatch {
    pub fn claimed(&self, gn: NodeId) -> bool {
        self.owners.contains_key(&gn)
    }
}

/// Backtracking subgraph matcher built from a pattern graph.
pub struct SubgraphMatcher<'a> {
    pattern: &'a GraphModule,
    config: MatchConfig,
    pattern_placeholders: Vec<NodeId>,
    pattern_returning_nodes: Vec<NodeId>,
    pattern_anchors: Vec<NodeId>,
}

impl<'a> SubgraphMatcher<'a> {
    /// Panics on an empty pattern, a pattern without an Output node, or a
    /// pattern containing dead code; those are authoring bugs.
    pub fn new(pattern: &'a GraphModule, config: MatchConfig) -> Self {
        let g = &pattern.graph;
        assert!(!g.is_empty(), "cannot match an empty pattern");
        let output = g.output_node().expect("pattern has no Output node");
        for id in g.nodes_in_order() {
            let n = &g[id];
            if n.op() != OpKind::Output {
                assert!(
                    !n.users().is_empty(),
                    "pattern contains dead code ('{}')",
                    n.name()
                );
            }
        }
        let pattern_placeholders = g.find_nodes(OpKind::Placeholder, None, true);
        let mut pattern_returning_nodes = vec![];
        for arg in g[output].args() {
            for_each_node_ref(arg, &mut |id| pattern_returning_nodes.push(id));
        }
        let pattern_anchors = if config.match_output {
            vec![output]
        } else {
            // Only feeders of Output with exactly one user can seed a
            // self-contained match; a multi-user interior node cannot.
            g[output]
                .input_nodes()
                .iter()
                .copied()
                .filter(|&n| g[n].users().len() == 1)
                .collect()
        };
        assert!(!pattern_anchors.is_empty(), "pattern has no viable anchors");
        Self {
            pattern,
            config,
            pattern_placeholders,
            pattern_returning_nodes,
            pattern_anchors,
        }
    }

    pub fn pattern_placeholders(&self) -> &[NodeId] {
        &self.pattern_placeholders
    }

    fn nodes_are_equal(&self, pn: NodeId, gn: NodeId, target: &GraphModule) -> bool {
        let p = &self.pattern.graph[pn];
        let g = &target.graph[gn];
        match p.op() {
            OpKind::Placeholder => !self.config.match_placeholder || g.op() == OpKind::Placeholder,
            OpKind::Output => g.op() == OpKind::Output,
            OpKind::GetAttr => {
                if g.op() != OpKind::GetAttr {
                    return false;
                }
                match (self.pattern.small_constant(pn), target.small_constant(gn)) {
                    (Some(a), Some(b)) => a.allclose_tensor(b),
                    _ => match (self.pattern.constant(pn), target.constant(gn)) {
                        // Not value-comparable; equal-typed attribute
                        // storage is the best we can require.
                        (Some(a), Some(b)) => {
                            a.elem_ty() == b.elem_ty() && a.dims() == b.dims()
                        }
                        _ => false,
                    },
                }
            }
            _ => p.op() == g.op() && p.target() == g.target(),
        }
    }

    fn match_args(
        &self,
        pa: &Argument,
        ga: &Argument,
        m: &mut InternalMatch,
        target: &GraphModule,
    ) -> bool {
        match (pa, ga) {
            (Argument::Node(p), Argument::Node(g)) => self.match_nodes(*p, *g, m, target),
            (Argument::List(ps), Argument::List(gs)) => {
                ps.len() == gs.len()
                    && ps
                        .iter()
                        .zip(gs)
                        .all(|(p, g)| self.match_args(p, g, m, target))
            }
            (Argument::Node(p), lit)
                if self.pattern.graph[*p].op() == OpKind::Placeholder =>
            {
                if m.nodes_map.contains_key(p) {
                    return false;
                }
                if let Some(prev) = m.lit_bindings.get(p) {
                    return prev == lit;
                }
                m.lit_bindings.insert(*p, lit.clone());
                true
            }
            (a, b) if a.is_literal() && b.is_literal() => self.config.ignore_literals || a == b,
            _ => false,
        }
    }

    fn match_nodes(
        &self,
        pn: NodeId,
        gn: NodeId,
        m: &mut InternalMatch,
        target: &GraphModule,
    ) -> bool {
        if let Some(&mapped) = m.nodes_map.get(&pn) {
            return mapped == gn;
        }
        if m.lit_bindings.contains_key(&pn) {
            return false;
        }
        if !self.nodes_are_equal(pn, gn, target) {
            return false;
        }
        // A graph node already consumed by a different pattern node fails
        // the match; small constants and placeholders may legitimately be
        // shared across independent bindings.
        if let Some(&owner) = m.owners.get(&gn) {
            if owner != pn {
                let both_placeholders = self.pattern.graph[pn].op() == OpKind::Placeholder
                    && self.pattern.graph[owner].op() == OpKind::Placeholder;
                if !both_placeholders && target.small_constant(gn).is_none() {
                    return false;
                }
            }
        }
        let saved = m.clone();
        m.nodes_map.insert(pn, gn);
        m.owners.entry(gn).or_insert(pn);
        if self.pattern.graph[pn].op() == OpKind::Placeholder {
            return true;
        }
        let p_args = self.pattern.graph[pn].args();
        let g_args = target.graph[gn].args();
        let ok = p_args.len() == g_args.len()
            && p_args
                .iter()
                .zip(g_args)
                .all(|(pa, ga)| self.match_args(pa, ga, m, target));
        if !ok {
            *m = saved;
            return false;
        }
        true
    }

    /// Fills the resolved views of a completed assignment. Fails when a
    /// pattern placeholder was never bound or a returning node ended up on
    /// a literal.
    fn resolve(&self, m: &mut InternalMatch) -> bool {
        m.placeholder_bindings.clear();
        for p in &self.pattern_placeholders {
            if let Some(&gn) = m.nodes_map.get(p) {
                m.placeholder_bindings.push(Argument::Node(gn));
            } else if let Some(lit) = m.lit_bindings.get(p) {
                m.placeholder_bindings.push(lit.clone());
            } else {
                return false;
            }
        }
        m.returning_nodes.clear();
        for p in &self.pattern_returning_nodes {
            match m.nodes_map.get(p) {
                Some(&gn) => m.returning_nodes.push(gn),
                None => return false,
            }
        }
        m.anchors = self
            .pattern_anchors
            .iter()
            .map(|a| m.nodes_map[a])
            .collect();
        true
    }

    /// Rejects a match whose interior values leak: every user of a matched
    /// interior node must itself be matched. Returning nodes, placeholders
    /// and shared small constants are exempt.
    fn is_contained(&self, m: &InternalMatch, target: &GraphModule) -> bool {
        for (&pn, &gn) in &m.nodes_map {
            let p = &self.pattern.graph[pn];
            if matches!(p.op(), OpKind::Placeholder | OpKind::Output) {
                continue;
            }
            if self.pattern_returning_nodes.contains(&pn) {
                continue;
            }
            if target.small_constant(gn).is_some() {
                continue;
            }
            for &user in target.graph[gn].users() {
                if !m.owners.contains_key(&user) {
                    return false;
                }
            }
        }
        true
    }

    fn remove_overlapping(
        &self,
        matches: Vec<InternalMatch>,
        target: &GraphModule,
    ) -> Vec<InternalMatch> {
        let mut claimed: FxHashSet<NodeId> = FxHashSet::default();
        let mut out = vec![];
        for m in matches {
            let interior: Vec<NodeId> = m
                .nodes_map
                .iter()
                .filter_map(|(&pn, &gn)| {
                    let op = self.pattern.graph[pn].op();
                    (!matches!(op, OpKind::Placeholder | OpKind::Output)
                        && target.small_constant(gn).is_none())
                    .then_some(gn)
                })
                .collect();
            if interior.iter().any(|gn| claimed.contains(gn)) {
                continue;
            }
            claimed.extend(interior);
            out.push(m);
        }
        out
    }

    fn backtrack(
        &self,
        i: usize,
        candidates: &[Vec<NodeId>],
        m: &mut InternalMatch,
        out: &mut Vec<InternalMatch>,
        target: &GraphModule,
    ) {
        if i == self.pattern_anchors.len() {
            out.push(m.clone());
            return;
        }
        for &gn in &candidates[i] {
            let saved = m.clone();
            if self.match_nodes(self.pattern_anchors[i], gn, m, target) {
                self.backtrack(i + 1, candidates, m, out, target);
            }
            *m = saved;
        }
    }

    /// All accepted matches of the pattern against `target`, in discovery
    /// (graph list) order.
    pub fn find_matches(&self, target: &GraphModule) -> Vec<InternalMatch> {
        let start = Instant::now();
        let graph_nodes = target.graph.nodes_in_order();
        let candidates: Vec<Vec<NodeId>> = self
            .pattern_anchors
            .iter()
            .map(|&anchor| {
                graph_nodes
                    .iter()
                    .copied()
                    .filter(|&gn| self.nodes_are_equal(anchor, gn, target))
                    .collect()
            })
            .collect();
        let mut raw = vec![];
        let mut m = InternalMatch::default();
        self.backtrack(0, &candidates, &mut m, &mut raw, target);

        let mut accepted = vec![];
        for mut m in raw {
            if !self.resolve(&mut m) {
                continue;
            }
            if !self.is_contained(&m, target) {
                continue;
            }
            accepted.push(m);
        }
        let accepted = if self.config.remove_overlapping_matches {
            self.remove_overlapping(accepted, target)
        } else {
            accepted
        };
        log::info!(
            "subgraph match: {} match(es), {:?}",
            accepted.len(),
            start.elapsed()
        );
        accepted
    }
}
