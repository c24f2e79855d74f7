use std::{
    fmt,
    ops::{Index, IndexMut},
    time::Instant,
};

use id_arena::Arena;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    arg::{for_each_node_ref, map_node_refs, Argument},
    node::{Node, NodeId, NodeSet, OpKind},
    sort_key::SortKey,
};

/// Allocates names unique within one graph. A colliding candidate gets a
/// numeric suffix continuing from any suffix already present on the
/// candidate, so `add_3` collides into `add_4` rather than `add_3_1`.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    used: FxHashSet<String>,
    counts: FxHashMap<String, u64>,
}

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push_str("node");
    }
    if out.as_bytes()[0].is_ascii_digit() {
        out.insert(0, '_');
    }
    out
}

fn split_suffix(name: &str) -> (&str, Option<u64>) {
    if let Some(pos) = name.rfind('_') {
        let digits = &name[pos + 1..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = digits.parse() {
                return (&name[..pos], Some(n));
            }
        }
    }
    (name, None)
}

impl Namespace {
    pub fn create_name(&mut self, candidate: &str) -> String {
        let candidate = sanitize(candidate);
        if self.used.insert(candidate.clone()) {
            return candidate;
        }
        let (base, suffix) = split_suffix(&candidate);
        let mut i = self
            .counts
            .get(base)
            .copied()
            .unwrap_or(0)
            .max(suffix.unwrap_or(0))
            + 1;
        loop {
            let name = format!("{base}_{i}");
            if self.used.insert(name.clone()) {
                self.counts.insert(base.to_string(), i);
                return name;
            }
            i += 1;
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.used.contains(name)
    }
}

/// Where newly created nodes land in the node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Insert right before the given node.
    Prepend(NodeId),
    /// Insert right after the given node.
    Append(NodeId),
}

type LookupKey = (OpKind, Option<String>);

fn lookup_key(op: OpKind, target: &str) -> LookupKey {
    match op {
        OpKind::CallFunction => (op, Some(target.to_string())),
        _ => (op, None),
    }
}

/// An ordered, mutable node graph with use-def tracking. The node list is
/// circular through a `Root` sentinel; every mutation keeps `input_nodes`
/// and `users` mutually consistent.
#[derive(Clone)]
pub struct Graph {
    nodes: Arena<Node>,
    root: NodeId,
    insert_point: InsertPoint,
    namespace: Namespace,
    lookup: FxHashMap<LookupKey, NodeSet>,
    len: usize,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut nodes = Arena::new();
        let root = nodes.alloc_with_id(Node::sentinel);
        Self {
            nodes,
            root,
            insert_point: InsertPoint::Prepend(root),
            namespace: Namespace::default(),
            lookup: FxHashMap::default(),
            len: 0,
        }
    }

    /// Number of live (non-erased) nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Live nodes in list order.
    pub fn nodes_in_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.nodes[self.root].next;
        while cur != self.root {
            out.push(cur);
            cur = self.nodes[cur].next;
        }
        out
    }

    pub fn output_node(&self) -> Option<NodeId> {
        self.find_nodes(OpKind::Output, None, true).first().copied()
    }

    /// Creates a node at the current insertion point and registers its
    /// use-def edges. `name` is a naming hint; collisions get a numeric
    /// suffix. Panics if an argument references an erased node.
    pub fn create_node(
        &mut self,
        op: OpKind,
        target: impl Into<String>,
        args: Vec<Argument>,
        name: Option<&str>,
        ty: Option<String>,
    ) -> NodeId {
        assert!(op != OpKind::Root, "Root is reserved for the list sentinel");
        let target = target.into();
        let candidate = match (name, op) {
            (Some(n), _) => n.to_string(),
            (None, OpKind::Output) => "output".to_string(),
            (None, _) => target.to_lowercase(),
        };
        let unique = self.namespace.create_name(&candidate);
        let id = self.nodes.alloc_with_id(|id| {
            let mut n = Node::sentinel(id);
            n.name = unique;
            n.op = op;
            n.target = target;
            n.ty = ty;
            n
        });
        match self.insert_point {
            InsertPoint::Prepend(at) => self.prepend(at, id),
            InsertPoint::Append(at) => self.append(at, id),
        }
        let key = lookup_key(self.nodes[id].op, &self.nodes[id].target);
        self.lookup.entry(key).or_default().insert(id);
        self.len += 1;
        self.update_args(id, args);
        id
    }

    pub fn placeholder(&mut self, name: &str) -> NodeId {
        self.create_node(OpKind::Placeholder, name, vec![], Some(name), None)
    }

    pub fn call_function(&mut self, target: &str, args: Vec<Argument>) -> NodeId {
        self.create_node(OpKind::CallFunction, target, args, None, None)
    }

    pub fn get_attr(&mut self, target: &str) -> NodeId {
        self.create_node(OpKind::GetAttr, target, vec![], None, None)
    }

    pub fn output(&mut self, arg: Argument) -> NodeId {
        self.create_node(OpKind::Output, "output", vec![arg], None, None)
    }

    fn unlink(&mut self, x: NodeId) {
        let (p, n) = (self.nodes[x].prev, self.nodes[x].next);
        self.nodes[p].next = n;
        self.nodes[n].prev = p;
        self.nodes[x].prev = x;
        self.nodes[x].next = x;
    }

    /// Moves `x` directly before `this` in O(1) and gives it a sort key
    /// strictly between its new neighbors. Prepending a node before itself
    /// is a no-op.
    pub fn prepend(&mut self, this: NodeId, x: NodeId) {
        if this == x {
            return;
        }
        assert!(!self.nodes[x].erased, "cannot relocate an erased node");
        self.unlink(x);
        let p = self.nodes[this].prev;
        self.nodes[p].next = x;
        self.nodes[x].prev = p;
        self.nodes[x].next = this;
        self.nodes[this].prev = x;
        self.nodes[x].sort_key =
            SortKey::between(&self.nodes[p].sort_key, &self.nodes[this].sort_key);
    }

    /// Moves `x` directly after `this`; the mirror of `prepend`.
    pub fn append(&mut self, this: NodeId, x: NodeId) {
        if this == x {
            return;
        }
        let next = self.nodes[this].next;
        self.prepend(next, x);
    }

    /// Replaces `n`'s arguments, atomically recomputing both sides of the
    /// use-def relation over the (possibly nested) argument tree.
    pub fn update_args(&mut self, n: NodeId, new_args: Vec<Argument>) {
        let old_inputs = std::mem::take(&mut self.nodes[n].input_nodes);
        for &input in &old_inputs {
            self.nodes[input].users.remove(n);
        }
        let mut inputs = NodeSet::default();
        for arg in &new_args {
            for_each_node_ref(arg, &mut |id| {
                assert!(
                    !self.nodes[id].erased,
                    "node argument references an erased node"
                );
                inputs.insert(id);
            });
        }
        for &input in &inputs {
            self.nodes[input].users.insert(n);
        }
        self.nodes[n].input_nodes = inputs;
        self.nodes[n].args = new_args;
    }

    /// Rewrites every occurrence of `n` inside its users' arguments to
    /// `replacement`. `should_process` can exclude users; everyone else
    /// must end up rewritten, which is asserted. Returns the users that
    /// were processed.
    pub fn replace_all_uses_with(
        &mut self,
        n: NodeId,
        replacement: NodeId,
        should_process: Option<&dyn Fn(&Node) -> bool>,
        propagate_meta: bool,
        propagate_partial: bool,
    ) -> Vec<NodeId> {
        if n == replacement {
            return vec![];
        }
        let users: Vec<NodeId> = self.nodes[n].users.iter().copied().collect();
        let mut processed = vec![];
        for user in users {
            if let Some(f) = should_process {
                if !f(&self.nodes[user]) {
                    continue;
                }
            }
            let new_args = self.nodes[user]
                .args
                .iter()
                .map(|a| {
                    map_node_refs(a, &mut |id| {
                        Argument::Node(if id == n { replacement } else { id })
                    })
                })
                .collect();
            self.update_args(user, new_args);
            processed.push(user);
        }
        match should_process {
            None => assert!(
                self.nodes[n].users.is_empty(),
                "some users of '{}' were left unprocessed",
                self.nodes[n].name
            ),
            Some(f) => assert!(
                self.nodes[n].users.iter().all(|&u| !f(&self.nodes[u])),
                "some users of '{}' were left unprocessed",
                self.nodes[n].name
            ),
        }
        if propagate_meta {
            let meta = self.nodes[n].meta.clone();
            for (k, v) in meta {
                self.nodes[replacement].meta.entry(k).or_insert(v);
            }
        }
        if propagate_partial {
            let from = self.nodes[n].partial.clone();
            match (from, self.nodes[replacement].partial.clone()) {
                (Some(p), None) => self.nodes[replacement].partial = Some(p),
                (Some(p), Some(q)) => {
                    // Both sides describe the same value; keep whichever is
                    // more concrete per element. A conflict means the caller
                    // attached inconsistent values; keep the replacement's.
                    if let Ok(merged) = q.merge(&p) {
                        self.nodes[replacement].partial = Some(merged);
                    }
                }
                _ => {}
            }
        }
        processed
    }

    /// Erases a node with no remaining users. The node is unlinked,
    /// un-indexed and tombstoned; its arguments are cleared so it drops
    /// out of its inputs' user sets, since translation maps may retain the
    /// tombstoned id long after erasure.
    pub fn erase_node(&mut self, n: NodeId) {
        assert!(n != self.root, "cannot erase the list sentinel");
        assert!(!self.nodes[n].erased, "node erased twice");
        assert!(
            self.nodes[n].users.is_empty(),
            "cannot erase '{}': it still has users",
            self.nodes[n].name
        );
        let key = lookup_key(self.nodes[n].op, &self.nodes[n].target);
        if let Some(set) = self.lookup.get_mut(&key) {
            set.remove(n);
        }
        self.unlink(n);
        self.len -= 1;
        self.update_args(n, vec![]);
        self.nodes[n].erased = true;
    }

    /// Swaps the insertion point, returning the previous one so callers
    /// can restore it.
    pub fn set_insertion_point(&mut self, ip: InsertPoint) -> InsertPoint {
        std::mem::replace(&mut self.insert_point, ip)
    }

    /// Runs `f` with nodes inserted right before `n` (before the Root
    /// boundary, i.e. at the end of the list, when `n` is `None`), then
    /// restores the previous insertion point. Nestable.
    pub fn inserting_before<R>(
        &mut self,
        n: Option<NodeId>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let prev = self.set_insertion_point(InsertPoint::Prepend(n.unwrap_or(self.root)));
        let r = f(self);
        self.insert_point = prev;
        r
    }

    /// Runs `f` with nodes inserted right after `n` (at the head of the
    /// list when `n` is `None`), then restores the previous insertion
    /// point. Nestable.
    pub fn inserting_after<R>(&mut self, n: Option<NodeId>, f: impl FnOnce(&mut Self) -> R) -> R {
        let prev = self.set_insertion_point(InsertPoint::Append(n.unwrap_or(self.root)));
        let r = f(self);
        self.insert_point = prev;
        r
    }

    /// Nodes with the given op (and, for `CallFunction`, target), in sort
    /// key order when `sorted` is set. Sort key order is the canonical
    /// semantic order and is independent of physical construction history.
    pub fn find_nodes(&self, op: OpKind, target: Option<&str>, sorted: bool) -> Vec<NodeId> {
        let key = (op, target.map(|t| t.to_string()));
        let mut out: Vec<NodeId> = self
            .lookup
            .get(&key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if sorted {
            out.sort_by(|&a, &b| self.nodes[a].sort_key.cmp(&self.nodes[b].sort_key));
        }
        out
    }

    /// Clones `src`'s nodes into this graph at the current insertion
    /// point, in list order, remapping arguments through `value_map`.
    /// Nodes already present in the (pre-seeded) map are skipped. When the
    /// Output node is reached its remapped argument is returned without
    /// copying the Output itself.
    pub fn graph_copy(
        &mut self,
        src: &Graph,
        value_map: &mut FxHashMap<NodeId, Argument>,
    ) -> Option<Argument> {
        for sid in src.nodes_in_order() {
            if value_map.contains_key(&sid) {
                continue;
            }
            let snode = &src[sid];
            if snode.op == OpKind::Output {
                let arg = snode.args.first().cloned().unwrap_or(Argument::List(vec![]));
                return Some(map_node_refs(&arg, &mut |id| {
                    value_map
                        .get(&id)
                        .cloned()
                        .expect("output references a node that was never copied")
                }));
            }
            let args = snode
                .args
                .iter()
                .map(|a| {
                    map_node_refs(a, &mut |id| {
                        value_map
                            .get(&id)
                            .cloned()
                            .expect("source argument references a node that was never copied")
                    })
                })
                .collect();
            let meta = snode.meta.clone();
            let partial = snode.partial.clone();
            let name = snode.name.clone();
            let op = snode.op;
            let target = snode.target.clone();
            let ty = snode.ty.clone();
            let new = self.create_node(op, target, args, Some(&name), ty);
            self.nodes[new].meta = meta;
            self.nodes[new].partial = partial;
            value_map.insert(sid, Argument::Node(new));
        }
        None
    }

    /// One reverse-order sweep erasing nodes without users. Reverse order
    /// suffices because a node can only become dead after all its users
    /// are erased, and the sweep visits users before their producers.
    /// Placeholder and Output nodes are always kept, as is anything
    /// `is_impure` flags. Returns whether the graph changed.
    pub fn eliminate_dead_code(&mut self, is_impure: Option<&dyn Fn(&Node) -> bool>) -> bool {
        let start = Instant::now();
        let mut changed = false;
        for id in self.nodes_in_order().into_iter().rev() {
            let node = &self.nodes[id];
            if !node.users.is_empty() {
                continue;
            }
            if matches!(node.op, OpKind::Placeholder | OpKind::Output) {
                continue;
            }
            if is_impure.is_some_and(|f| f(node)) {
                continue;
            }
            self.erase_node(id);
            changed = true;
        }
        log::info!("eliminate_dead_code: {:?}", start.elapsed());
        changed
    }

    /// Structural well-formedness check: unique names, lookup-table
    /// membership, symmetric use-def edges and no forward-referencing
    /// inputs. Panics on the first violation; a broken graph is a caller
    /// bug, not a recoverable state.
    pub fn lint(&self) {
        let mut names = FxHashSet::default();
        let order = self.nodes_in_order();
        assert!(
            order.len() == self.len,
            "length counter out of sync with the node list"
        );
        for &id in &order {
            let node = &self.nodes[id];
            assert!(!node.erased, "erased node '{}' still linked", node.name);
            assert!(names.insert(&node.name), "duplicate name '{}'", node.name);
            let key = lookup_key(node.op, &node.target);
            assert!(
                self.lookup.get(&key).is_some_and(|s| s.contains(id)),
                "node '{}' missing from the lookup table",
                node.name
            );
            for &input in &node.input_nodes {
                let producer = &self.nodes[input];
                assert!(
                    !producer.erased,
                    "node '{}' consumes erased node '{}'",
                    node.name, producer.name
                );
                assert!(
                    producer.sort_key < node.sort_key,
                    "node '{}' references '{}' defined after it",
                    node.name,
                    producer.name
                );
                assert!(
                    producer.users.contains(id),
                    "use-def asymmetry between '{}' and '{}'",
                    node.name,
                    producer.name
                );
            }
            for &user in &node.users {
                assert!(
                    self.nodes[user].input_nodes.contains(id),
                    "use-def asymmetry between '{}' and '{}'",
                    node.name,
                    self.nodes[user].name
                );
            }
        }
    }

    fn fmt_arg(&self, arg: &Argument, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match arg {
            Argument::Node(id) => write!(f, "%{}", self.nodes[*id].name),
            Argument::List(xs) => {
                write!(f, "[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_arg(x, f)?;
                }
                write!(f, "]")
            }
            Argument::Str(s) => write!(f, "{s:?}"),
            Argument::Int(i) => write!(f, "{i}"),
            Argument::Float(x) => write!(f, "{x:?}"),
            Argument::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.nodes_in_order() {
            let node = &self.nodes[id];
            write!(f, "%{} = {}[{}](", node.name, node.op.as_str(), node.target)?;
            for (i, arg) in node.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                self.fmt_arg(arg, f)?;
            }
            writeln!(f, ")")?;
        }
        Ok(())
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, index: NodeId) -> &Self::Output {
        &self.nodes[index]
    }
}

impl IndexMut<NodeId> for Graph {
    fn index_mut(&mut self, index: NodeId) -> &mut Self::Output {
        &mut self.nodes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_graph() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let x = g.placeholder("x");
        let y = g.placeholder("y");
        let add = g.call_function("Add", vec![x.into(), y.into()]);
        g.output(add.into());
        (g, x, y, add)
    }

    #[test]
    fn use_def_edges_are_symmetric() {
        let (g, x, y, add) = add_graph();
        assert!(g[add].input_nodes().contains(x));
        assert!(g[add].input_nodes().contains(y));
        assert!(g[x].users().contains(add));
        assert!(g[y].users().contains(add));
        g.lint();
    }

    #[test]
    fn update_args_rewires_edges() {
        let (mut g, x, y, add) = add_graph();
        g.update_args(add, vec![x.into(), x.into()]);
        assert!(g[y].users().is_empty());
        assert_eq!(g[add].input_nodes().len(), 1);
        g.lint();
    }

    #[test]
    fn nested_list_args_register_edges() {
        let mut g = Graph::new();
        let a = g.placeholder("a");
        let b = g.placeholder("b");
        let cat = g.call_function(
            "Concat",
            vec![Argument::List(vec![a.into(), b.into()]), 0i64.into()],
        );
        assert_eq!(g[cat].input_nodes().as_slice(), &[a, b]);
        g.lint();
    }

    #[test]
    fn replace_all_uses_rewires_users() {
        let (mut g, x, _y, add) = add_graph();
        let relu = g.call_function("Relu", vec![add.into()]);
        let processed = g.replace_all_uses_with(add, x, None, false, false);
        assert!(processed.contains(&relu));
        assert!(g[add].users().is_empty());
        assert!(g[x].users().contains(relu));
    }

    #[test]
    #[should_panic(expected = "still has users")]
    fn erase_with_users_panics() {
        let (mut g, x, _y, _add) = add_graph();
        g.erase_node(x);
    }

    #[test]
    fn erase_clears_user_registrations() {
        let (mut g, x, y, add) = add_graph();
        let out = g.output_node().unwrap();
        g.erase_node(out);
        g.erase_node(add);
        assert!(g[x].users().is_empty());
        assert!(g[y].users().is_empty());
        assert!(g[add].is_erased());
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn names_get_continuing_suffixes() {
        let mut ns = Namespace::default();
        assert_eq!(ns.create_name("add"), "add");
        assert_eq!(ns.create_name("add"), "add_1");
        assert_eq!(ns.create_name("add_1"), "add_2");
        assert_eq!(ns.create_name("add"), "add_3");
        assert_eq!(ns.create_name("1bad name"), "_1bad_name");
    }

    #[test]
    fn insertion_points_nest_and_restore() {
        let (mut g, _x, _y, add) = add_graph();
        let relu = g.inserting_after(Some(add), |g| g.call_function("Relu", vec![add.into()]));
        // Cursor restored: the next node lands at the end of the list.
        let last = g.call_function("Relu", vec![relu.into()]);
        let order = g.nodes_in_order();
        let pos = |id| order.iter().position(|&n| n == id).unwrap();
        assert_eq!(pos(relu), pos(add) + 1);
        assert_eq!(pos(last), order.len() - 1);
        g.lint();
    }

    #[test]
    fn sort_keys_follow_relocation() {
        let (mut g, x, y, add) = add_graph();
        // y currently precedes add; move it to the front.
        g.append(x, y);
        g.prepend(x, y);
        let sorted = g.find_nodes(OpKind::Placeholder, None, true);
        assert_eq!(sorted, vec![y, x]);
        assert!(g[y].sort_key() < g[x].sort_key());
        assert!(g[x].sort_key() < g[add].sort_key());
        // Self-prepend must not move anything.
        g.prepend(y, y);
        assert_eq!(g.find_nodes(OpKind::Placeholder, None, true), vec![y, x]);
    }

    #[test]
    fn dead_code_elimination_is_idempotent() {
        let (mut g, x, _y, _add) = add_graph();
        g.call_function("Relu", vec![x.into()]); // dead
        let before = g.len();
        assert!(g.eliminate_dead_code(None));
        assert_eq!(g.len(), before - 1);
        assert!(!g.eliminate_dead_code(None));
        g.lint();
    }

    #[test]
    fn dead_chain_dies_in_one_pass() {
        let (mut g, x, _y, _add) = add_graph();
        let a = g.call_function("Relu", vec![x.into()]);
        let b = g.call_function("Relu", vec![a.into()]);
        g.call_function("Relu", vec![b.into()]);
        let before = g.len();
        assert!(g.eliminate_dead_code(None));
        assert_eq!(g.len(), before - 3);
    }

    #[test]
    fn impure_nodes_survive_dce() {
        let (mut g, x, _y, _add) = add_graph();
        g.call_function("Print", vec![x.into()]);
        let changed = g.eliminate_dead_code(Some(&|n: &Node| n.target() == "Print"));
        assert!(!changed);
    }

    #[test]
    fn graph_copy_remaps_and_returns_output() {
        let (src, x, y, add) = add_graph();
        let mut dst = Graph::new();
        let nx = dst.placeholder("nx");
        let ny = dst.placeholder("ny");
        let mut value_map = FxHashMap::default();
        value_map.insert(x, Argument::Node(nx));
        value_map.insert(y, Argument::Node(ny));
        let out = dst.graph_copy(&src, &mut value_map).unwrap();
        let Argument::Node(copied_add) = out else {
            panic!("expected a node argument")
        };
        assert_eq!(dst[copied_add].target(), "Add");
        assert_eq!(dst[copied_add].input_nodes().as_slice(), &[nx, ny]);
        assert_ne!(copied_add, add);
        dst.lint();
    }

    #[test]
    fn debug_dump() {
        let (g, ..) = add_graph();
        insta::assert_snapshot!(format!("{g:?}").trim_end(), @r###"
        %x = placeholder[x]()
        %y = placeholder[y]()
        %add = call_function[Add](%x, %y)
        %output = output[output](%add)
        "###);
    }
}
