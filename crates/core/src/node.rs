use id_arena::Id;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{analysis::partial::PartialTensor, arg::Argument, sort_key::SortKey};

pub type NodeId = Id<Node>;

/// The category of a node. `Root` is reserved for the list sentinel that
/// bounds a graph's node list and never appears as a user-created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Placeholder,
    CallFunction,
    GetAttr,
    Output,
    Root,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Placeholder => "placeholder",
            OpKind::CallFunction => "call_function",
            OpKind::GetAttr => "get_attr",
            OpKind::Output => "output",
            OpKind::Root => "root",
        }
    }
}

/// An insertion-ordered set of node ids, used for use-def edges where both
/// deterministic iteration and O(1) membership are needed.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    order: Vec<NodeId>,
    index: FxHashSet<NodeId>,
}

impl NodeSet {
    pub fn insert(&mut self, id: NodeId) -> bool {
        if self.index.insert(id) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        if self.index.remove(&id) {
            self.order.retain(|&x| x != id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeId> {
        self.order.iter()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        self.order.as_slice()
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a NodeId;
    type IntoIter = std::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<T: IntoIterator<Item = NodeId>>(iter: T) -> Self {
        let mut set = NodeSet::default();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

/// A node of the graph. Nodes live in their graph's arena and double as
/// list elements (via `prev`/`next`/`sort_key`) and use-def vertices (via
/// `input_nodes`/`users`, both derived from `args`).
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) op: OpKind,
    pub(crate) target: String,
    pub(crate) args: Vec<Argument>,
    pub ty: Option<String>,
    /// Best-effort abstract value, attached by whoever constructs the node.
    pub partial: Option<PartialTensor>,
    /// Free-form side table carried across rewrites.
    pub meta: FxHashMap<String, Argument>,
    pub(crate) prev: NodeId,
    pub(crate) next: NodeId,
    pub(crate) sort_key: SortKey,
    pub(crate) input_nodes: NodeSet,
    pub(crate) users: NodeSet,
    pub(crate) erased: bool,
}

impl Node {
    pub(crate) fn sentinel(id: NodeId) -> Self {
        Node {
            name: String::new(),
            op: OpKind::Root,
            target: String::new(),
            args: vec![],
            ty: None,
            partial: None,
            meta: FxHashMap::default(),
            prev: id,
            next: id,
            sort_key: SortKey::origin(),
            input_nodes: NodeSet::default(),
            users: NodeSet::default(),
            erased: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Nodes whose values this node consumes, in first-occurrence order
    /// over the argument tree.
    pub fn input_nodes(&self) -> &NodeSet {
        &self.input_nodes
    }

    /// Nodes consuming this node's value.
    pub fn users(&self) -> &NodeSet {
        &self.users
    }

    pub fn sort_key(&self) -> &SortKey {
        &self.sort_key
    }

    pub fn is_erased(&self) -> bool {
        self.erased
    }
}
