use crate::node::NodeId;

/// A value held by a node parameter. Closed over the kinds of data an
/// operator invocation may carry: literals, (possibly nested) lists for
/// variadic inputs, and references to other nodes.
///
/// Equality is structural except for `Node`, which compares by arena
/// identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Str(String),
    Int(i64),
    Float(f32),
    Bool(bool),
    List(Vec<Argument>),
    Node(NodeId),
}

impl Argument {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Argument::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Argument::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Argument::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Argument]> {
        match self {
            Argument::List(xs) => Some(xs),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        !matches!(self, Argument::Node(_) | Argument::List(_))
    }
}

impl From<&str> for Argument {
    fn from(s: &str) -> Self {
        Argument::Str(s.to_string())
    }
}

impl From<String> for Argument {
    fn from(s: String) -> Self {
        Argument::Str(s)
    }
}

impl From<i64> for Argument {
    fn from(i: i64) -> Self {
        Argument::Int(i)
    }
}

impl From<f32> for Argument {
    fn from(f: f32) -> Self {
        Argument::Float(f)
    }
}

impl From<bool> for Argument {
    fn from(b: bool) -> Self {
        Argument::Bool(b)
    }
}

impl From<NodeId> for Argument {
    fn from(id: NodeId) -> Self {
        Argument::Node(id)
    }
}

impl From<Vec<Argument>> for Argument {
    fn from(xs: Vec<Argument>) -> Self {
        Argument::List(xs)
    }
}

/// Visits every node reference in an argument tree, recursing through
/// nested lists in order.
pub fn for_each_node_ref(arg: &Argument, f: &mut impl FnMut(NodeId)) {
    match arg {
        Argument::Node(id) => f(*id),
        Argument::List(xs) => {
            for x in xs {
                for_each_node_ref(x, f);
            }
        }
        _ => {}
    }
}

/// Rebuilds an argument tree, substituting every node reference through
/// `f`. The substitution may produce an arbitrary argument, not just
/// another node reference.
pub fn map_node_refs(arg: &Argument, f: &mut impl FnMut(NodeId) -> Argument) -> Argument {
    match arg {
        Argument::Node(id) => f(*id),
        Argument::List(xs) => Argument::List(xs.iter().map(|x| map_node_refs(x, f)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use id_arena::Arena;

    fn dummy_ids(n: usize) -> Vec<NodeId> {
        let mut arena: Arena<crate::node::Node> = Arena::new();
        (0..n)
            .map(|_| {
                arena.alloc_with_id(|id| crate::node::Node::sentinel(id))
            })
            .collect()
    }

    #[test]
    fn visits_nested_lists_in_order() {
        let ids = dummy_ids(3);
        let arg = Argument::List(vec![
            Argument::Node(ids[0]),
            Argument::Int(5),
            Argument::List(vec![Argument::Node(ids[1]), Argument::Node(ids[2])]),
        ]);
        let mut seen = vec![];
        for_each_node_ref(&arg, &mut |id| seen.push(id));
        assert_eq!(seen, ids);
    }

    #[test]
    fn map_substitutes_whole_subtrees() {
        let ids = dummy_ids(2);
        let arg = Argument::List(vec![Argument::Node(ids[0]), Argument::Bool(true)]);
        let mapped = map_node_refs(&arg, &mut |id| {
            assert_eq!(id, ids[0]);
            Argument::Node(ids[1])
        });
        assert_eq!(
            mapped,
            Argument::List(vec![Argument::Node(ids[1]), Argument::Bool(true)])
        );
    }
}
