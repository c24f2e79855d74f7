use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::{
    arg::Argument,
    module::GraphModule,
    node::{NodeId, OpKind},
    optimize::matcher::{InternalMatch, MatchConfig, SubgraphMatcher},
};

/// What one accepted match was rewritten into.
#[derive(Debug, Clone)]
pub struct ReplacedPatterns {
    /// Graph node the first pattern anchor was bound to.
    pub anchor: NodeId,
    /// pattern node -> (pre-rewrite) graph node.
    pub nodes_map: FxHashMap<NodeId, NodeId>,
    /// The copies of the replacement's returning nodes, in order.
    pub replacements: Vec<NodeId>,
}

/// Per-match acceptance filter: (match, target module, pattern module).
pub type MatchFilter = dyn Fn(&InternalMatch, &GraphModule, &GraphModule) -> bool;

/// Replaces every non-overlapping occurrence of `pattern` in `gm` with a
/// copy of `replacement`.
pub fn replace_pattern(
    gm: &mut GraphModule,
    pattern: &GraphModule,
    replacement: &GraphModule,
) -> Vec<ReplacedPatterns> {
    replace_pattern_with_filters(gm, pattern, replacement, &[], false)
}

pub fn replace_pattern_with_filters(
    gm: &mut GraphModule,
    pattern: &GraphModule,
    replacement: &GraphModule,
    filters: &[&MatchFilter],
    ignore_literals: bool,
) -> Vec<ReplacedPatterns> {
    replace_pattern_impl(
        gm,
        pattern,
        &mut |_| replacement.clone(),
        filters,
        ignore_literals,
    )
}

/// Variant producing the replacement per match, for rewrites whose body
/// depends on what was matched.
pub fn replace_pattern_with_callback(
    gm: &mut GraphModule,
    pattern: &GraphModule,
    make_replacement: &mut dyn FnMut(&InternalMatch) -> GraphModule,
    filters: &[&MatchFilter],
    ignore_literals: bool,
) -> Vec<ReplacedPatterns> {
    replace_pattern_impl(gm, pattern, make_replacement, filters, ignore_literals)
}

fn replace_pattern_impl(
    gm: &mut GraphModule,
    pattern: &GraphModule,
    make_replacement: &mut dyn FnMut(&InternalMatch) -> GraphModule,
    filters: &[&MatchFilter],
    ignore_literals: bool,
) -> Vec<ReplacedPatterns> {
    let start = Instant::now();
    let config = MatchConfig {
        ignore_literals,
        ..Default::default()
    };
    let matcher = SubgraphMatcher::new(pattern, config);
    let placeholder_count = matcher.pattern_placeholders().len();
    let matches: Vec<InternalMatch> = matcher
        .find_matches(gm)
        .into_iter()
        .filter(|m| filters.iter().all(|f| f(m, gm, pattern)))
        .collect();

    // Returning nodes already substituted by an earlier match in this
    // batch, so later matches bind the substitute instead of a tombstone.
    let mut match_changed_node: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    let mut results = vec![];

    for m in matches {
        let replacement = make_replacement(&m);
        let repl_placeholders = replacement
            .graph
            .find_nodes(OpKind::Placeholder, None, true);
        assert_eq!(
            repl_placeholders.len(),
            placeholder_count,
            "pattern and replacement must declare the same number of placeholders"
        );

        let mut value_map: FxHashMap<NodeId, Argument> = FxHashMap::default();
        for (&rp, binding) in repl_placeholders.iter().zip(&m.placeholder_bindings) {
            let arg = match binding {
                Argument::Node(gn) => {
                    Argument::Node(*match_changed_node.get(gn).unwrap_or(gn))
                }
                lit => lit.clone(),
            };
            value_map.insert(rp, arg);
        }

        let returning: Vec<NodeId> = m
            .returning_nodes
            .iter()
            .map(|gn| *match_changed_node.get(gn).unwrap_or(gn))
            .collect();

        // Insertion point: the single common user of the returning nodes
        // if unique, else the first such user in graph order. A match
        // nothing consumes gets spliced after its last node; any
        // topologically legal point would do.
        let mut users: Vec<NodeId> = vec![];
        for &r in &returning {
            for &u in gm.graph[r].users() {
                if !users.contains(&u) {
                    users.push(u);
                }
            }
        }
        let out_arg = if users.is_empty() {
            let last = m
                .nodes_map
                .values()
                .copied()
                .filter(|&gn| !gm.graph[gn].is_erased())
                .max_by(|&a, &b| gm.graph[a].sort_key().cmp(gm.graph[b].sort_key()))
                .expect("match has no live nodes");
            gm.graph
                .inserting_after(Some(last), |g| g.graph_copy(&replacement.graph, &mut value_map))
        } else {
            let first = users
                .iter()
                .copied()
                .min_by(|&a, &b| gm.graph[a].sort_key().cmp(gm.graph[b].sort_key()))
                .unwrap();
            gm.graph
                .inserting_before(Some(first), |g| g.graph_copy(&replacement.graph, &mut value_map))
        }
        .expect("replacement graph has no Output node");

        // Carry the replacement's attribute tensors over for every copied
        // GetAttr node; a clashing name holding a different tensor gets a
        // fresh one.
        for rid in replacement.graph.nodes_in_order() {
            if replacement.graph[rid].op() != OpKind::GetAttr {
                continue;
            }
            let Some(Argument::Node(copied)) = value_map.get(&rid) else {
                continue;
            };
            let copied = *copied;
            let attr_name = gm.graph[copied].target().to_string();
            let tensor = replacement
                .attr(replacement.graph[rid].target())
                .expect("replacement GetAttr points at a missing attribute")
                .clone();
            match gm.attr(&attr_name) {
                None => gm.set_attr(&attr_name, tensor),
                Some(existing) if existing.allclose_tensor(&tensor) => {}
                Some(_) => {
                    let fresh = gm.add_attr(&attr_name, tensor);
                    gm.graph[copied].target = fresh;
                }
            }
        }

        let returning_args: Vec<Argument> = match out_arg {
            Argument::List(xs) => xs,
            single => vec![single],
        };
        assert_eq!(
            returning_args.len(),
            returning.len(),
            "pattern and replacement must return the same number of values"
        );

        let mut replacements = vec![];
        for (i, (orig, new_arg)) in returning.iter().zip(returning_args).enumerate() {
            let Argument::Node(new_gn) = new_arg else {
                panic!("replacement returns a non-node value")
            };
            gm.graph
                .replace_all_uses_with(*orig, new_gn, None, false, true);
            match_changed_node.insert(m.returning_nodes[i], new_gn);
            match_changed_node.insert(*orig, new_gn);
            replacements.push(new_gn);
        }

        // Erase the matched nodes in reverse list order: consumers go
        // before their producers. Placeholders, Output and small constants
        // (possibly shared with other matches) stay; dead constants fall
        // to the next dead-code elimination.
        for pid in pattern.graph.nodes_in_order().into_iter().rev() {
            if matches!(
                pattern.graph[pid].op(),
                OpKind::Placeholder | OpKind::Output
            ) {
                continue;
            }
            let Some(&gn) = m.nodes_map.get(&pid) else {
                continue;
            };
            if gm.graph[gn].is_erased() {
                continue;
            }
            if gm.small_constant(gn).is_some() {
                continue;
            }
            assert!(
                gm.graph[gn].users().is_empty(),
                "matched interior node '{}' still has users",
                gm.graph[gn].name()
            );
            gm.graph.erase_node(gn);
        }

        results.push(ReplacedPatterns {
            anchor: m.anchors[0],
            nodes_map: m.nodes_map.clone(),
            replacements,
        });
    }

    log::info!(
        "replace_pattern: {} rewrite(s), {:?}",
        results.len(),
        start.elapsed()
    );
    results
}
