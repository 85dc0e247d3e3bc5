//! Index-based intrusive LRU list.
//!
//! Nodes are identified by their position in the cache's flat matrix array,
//! so linking never allocates. The front is the most recently used entry.

const NIL: usize = usize::MAX;

#[derive(Debug)]
pub struct Lru {
    prev: Vec<usize>,
    next: Vec<usize>,
    linked: Vec<bool>,
    head: usize,
    tail: usize,
    len: usize,
}

impl Lru {
    /// List over node ids `0..n_nodes`, all unlinked.
    pub fn new(n_nodes: usize) -> Self {
        Lru {
            prev: vec![NIL; n_nodes],
            next: vec![NIL; n_nodes],
            linked: vec![false; n_nodes],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, node: usize) -> bool {
        self.linked[node]
    }

    pub fn push_front(&mut self, node: usize) {
        assert!(!self.linked[node], "LRU node {node} is already linked");
        self.prev[node] = NIL;
        self.next[node] = self.head;
        if self.head != NIL {
            self.prev[self.head] = node;
        } else {
            self.tail = node;
        }
        self.head = node;
        self.linked[node] = true;
        self.len += 1;
    }

    pub fn unlink(&mut self, node: usize) {
        assert!(self.linked[node], "LRU node {node} is not linked");
        let (p, n) = (self.prev[node], self.next[node]);
        if p != NIL {
            self.next[p] = n;
        } else {
            self.head = n;
        }
        if n != NIL {
            self.prev[n] = p;
        } else {
            self.tail = p;
        }
        self.prev[node] = NIL;
        self.next[node] = NIL;
        self.linked[node] = false;
        self.len -= 1;
    }

    /// Move a linked node to the front. Unlinked nodes are left alone.
    pub fn promote(&mut self, node: usize) {
        if !self.linked[node] || self.head == node {
            return;
        }
        self.unlink(node);
        self.push_front(node);
    }

    /// Least recently used node.
    pub fn back(&self) -> Option<usize> {
        (self.tail != NIL).then_some(self.tail)
    }

    /// Neighbour of `node` towards the front.
    pub fn prev_of(&self, node: usize) -> Option<usize> {
        let p = self.prev[node];
        (p != NIL).then_some(p)
    }

    /// Nodes from least to most recently used.
    pub fn iter_from_back(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.back(), move |&n| self.prev_of(n))
    }
}
