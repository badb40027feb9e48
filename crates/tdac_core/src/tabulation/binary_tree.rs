use super::chem_point::ChemPoint;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// A child slot of an internal node, addressing either arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Node(usize),
    Leaf(usize),
}

/// Internal node: the separating hyperplane v . phi = a and two children.
#[derive(Debug)]
pub struct Node {
    v: DVector<f64>,
    a: f64,
    left: Child,
    right: Child,
    parent: Option<usize>,
}

impl Node {
    fn side(&self, phi: &[f64]) -> Child {
        let dot: f64 = self.v.iter().zip(phi).map(|(v, p)| v * p).sum();
        if dot <= self.a {
            self.left
        } else {
            self.right
        }
    }
}

/// Binary search tree over tabulated records.
///
/// Nodes and leaves live in two slab arenas addressed by stable indices; all
/// links, including the leaf back-references, are indices, so rebuilding the
/// node structure never moves a leaf. Hyperplane geometry only guides the
/// search; correctness rests on the ellipsoid test performed by the caller.
pub struct BinaryTree {
    nodes: Vec<Option<Node>>,
    node_free: Vec<usize>,
    leaves: Vec<Option<ChemPoint>>,
    leaf_free: Vec<usize>,
    root: Option<Child>,
    size: usize,
}

impl BinaryTree {
    pub fn with_capacity(max_elements: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(max_elements),
            node_free: Vec::new(),
            leaves: Vec::with_capacity(max_elements),
            leaf_free: Vec::new(),
            root: None,
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn leaf(&self, id: usize) -> &ChemPoint {
        self.leaves[id].as_ref().expect("stale leaf index")
    }

    pub fn leaf_mut(&mut self, id: usize) -> &mut ChemPoint {
        self.leaves[id].as_mut().expect("stale leaf index")
    }

    fn node(&self, id: usize) -> &Node {
        self.nodes[id].as_ref().expect("stale node index")
    }

    fn node_mut(&mut self, id: usize) -> &mut Node {
        self.nodes[id].as_mut().expect("stale node index")
    }

    pub fn leaf_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.leaves
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
    }

    /// Deepest leaf level; 0 for an empty tree.
    pub fn depth(&self) -> usize {
        self.leaf_ids().map(|id| self.leaf(id).depth).max().unwrap_or(0)
    }

    pub fn avg_depth(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        let total: usize = self.leaf_ids().map(|id| self.leaf(id).depth).sum();
        total as f64 / self.size as f64
    }

    /// Least-recently-used leaf.
    pub fn lru(&self) -> Option<usize> {
        self.leaf_ids().min_by_key(|&id| self.leaf(id).last_used)
    }

    /// Primary search: descend the hyperplanes from the root.
    pub fn traverse(&self, phi: &[f64]) -> Option<usize> {
        let mut cur = self.root?;
        loop {
            match cur {
                Child::Leaf(id) => return Some(id),
                Child::Node(id) => cur = self.node(id).side(phi),
            }
        }
    }

    fn alloc_leaf(&mut self, point: ChemPoint) -> usize {
        self.size += 1;
        match self.leaf_free.pop() {
            Some(id) => {
                self.leaves[id] = Some(point);
                id
            }
            None => {
                self.leaves.push(Some(point));
                self.leaves.len() - 1
            }
        }
    }

    fn alloc_node(&mut self, node: Node) -> usize {
        match self.node_free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn replace_child(&mut self, parent: usize, was: Child, now: Child) {
        let node = self.node_mut(parent);
        if node.left == was {
            node.left = now;
        } else {
            node.right = now;
        }
    }

    fn set_parent(&mut self, child: Child, parent: Option<usize>) {
        match child {
            Child::Node(id) => self.node_mut(id).parent = parent,
            Child::Leaf(id) => self.leaf_mut(id).node = parent,
        }
    }

    /// Split the position of `old` with a new internal node holding `old` and
    /// `new`, separated by the perpendicular bisector of their tabulation
    /// points in scaled coordinates. Returns the node index; when `old` was a
    /// subtree root the caller re-roots with the returned node.
    fn split(&mut self, old: usize, new: usize, weights: &DVector<f64>) -> usize {
        let dim = weights.len();
        let mut v = DVector::zeros(dim);
        let mut a = 0.0;
        {
            let phi_old = self.leaf(old).phi();
            let phi_new = self.leaf(new).phi();
            for i in 0..dim {
                v[i] = weights[i] * weights[i] * (phi_new[i] - phi_old[i]);
                a += v[i] * 0.5 * (phi_new[i] + phi_old[i]);
            }
        }

        let parent = self.leaf(old).node;
        let old_side: f64 = v
            .iter()
            .zip(self.leaf(old).phi().iter())
            .map(|(v, p)| v * p)
            .sum();
        // degenerate hyperplane (coincident points): old left, new right
        let (left, right) = if old_side <= a {
            (Child::Leaf(old), Child::Leaf(new))
        } else {
            (Child::Leaf(new), Child::Leaf(old))
        };

        let nid = self.alloc_node(Node {
            v,
            a,
            left,
            right,
            parent,
        });
        if let Some(p) = parent {
            self.replace_child(p, Child::Leaf(old), Child::Node(nid));
        }
        let depth = self.leaf(old).depth + 1;
        {
            let leaf = self.leaf_mut(old);
            leaf.node = Some(nid);
            leaf.depth = depth;
        }
        {
            let leaf = self.leaf_mut(new);
            leaf.node = Some(nid);
            leaf.depth = depth;
        }
        nid
    }

    /// Insert a record, splitting `candidate` (or the leaf found by primary
    /// search) into a new internal node. Returns the new leaf index.
    pub fn insert(
        &mut self,
        candidate: Option<usize>,
        point: ChemPoint,
        weights: &DVector<f64>,
    ) -> usize {
        let candidate = candidate.or_else(|| {
            let phi: Vec<f64> = point.phi().iter().copied().collect();
            self.traverse(&phi)
        });
        match candidate {
            None => {
                let id = self.alloc_leaf(point);
                {
                    let leaf = self.leaf_mut(id);
                    leaf.node = None;
                    leaf.depth = 1;
                }
                self.root = Some(Child::Leaf(id));
                id
            }
            Some(old) => {
                let id = self.alloc_leaf(point);
                let was_root = self.leaf(old).node.is_none();
                let nid = self.split(old, id, weights);
                if was_root {
                    self.root = Some(Child::Node(nid));
                }
                id
            }
        }
    }

    /// Remove a leaf; its sibling takes the parent node's place and the
    /// depths on that branch decrease by one.
    pub fn delete_leaf(&mut self, id: usize) {
        let parent = self.leaf(id).node;
        self.leaves[id] = None;
        self.leaf_free.push(id);
        self.size -= 1;

        let Some(p) = parent else {
            self.root = None;
            return;
        };
        let node = self.nodes[p].take().expect("stale node index");
        self.node_free.push(p);
        let sibling = if node.left == Child::Leaf(id) {
            node.right
        } else {
            node.left
        };
        match node.parent {
            None => {
                self.root = Some(sibling);
                self.set_parent(sibling, None);
            }
            Some(grand) => {
                self.replace_child(grand, Child::Node(p), sibling);
                self.set_parent(sibling, Some(grand));
            }
        }

        let mut stack = vec![sibling];
        while let Some(child) = stack.pop() {
            match child {
                Child::Leaf(l) => self.leaf_mut(l).depth -= 1,
                Child::Node(n) => {
                    stack.push(self.node(n).left);
                    stack.push(self.node(n).right);
                }
            }
        }
    }

    /// Collect up to `max` leaves neighboring `start`, walking outwards
    /// through the sibling subtrees of its ancestors.
    pub fn neighbors(&self, start: usize, max: usize, out: &mut Vec<usize>) {
        out.clear();
        let mut prev = Child::Leaf(start);
        let mut up = self.leaf(start).node;
        while let Some(p) = up {
            if out.len() >= max {
                break;
            }
            let node = self.node(p);
            let other = if node.left == prev {
                node.right
            } else {
                node.left
            };
            let mut stack = vec![other];
            while let Some(child) = stack.pop() {
                if out.len() >= max {
                    break;
                }
                match child {
                    Child::Leaf(l) => out.push(l),
                    Child::Node(n) => {
                        stack.push(self.node(n).left);
                        stack.push(self.node(n).right);
                    }
                }
            }
            prev = Child::Node(p);
            up = node.parent;
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.node_free.clear();
        self.leaves.clear();
        self.leaf_free.clear();
        self.root = None;
        self.size = 0;
    }

    fn detach_structure(&mut self) {
        self.nodes.clear();
        self.node_free.clear();
        self.root = None;
        for id in 0..self.leaves.len() {
            if let Some(leaf) = self.leaves[id].as_mut() {
                leaf.node = None;
            }
        }
    }

    /// Insert an already-stored leaf beneath `sub_root` without touching the
    /// arenas.
    fn reattach(&mut self, sub_root: &mut Child, id: usize, weights: &DVector<f64>) {
        let mut cur = *sub_root;
        let old = loop {
            match cur {
                Child::Leaf(l) => break l,
                Child::Node(n) => {
                    let phi: Vec<f64> = self.leaf(id).phi().iter().copied().collect();
                    cur = self.node(n).side(&phi);
                }
            }
        };
        let was_sub_root = self.leaf(old).node.is_none();
        let nid = self.split(old, id, weights);
        if was_sub_root {
            *sub_root = Child::Node(nid);
        }
    }

    fn assign_depths(&mut self) {
        let Some(root) = self.root else { return };
        let mut stack = vec![(root, 1usize)];
        while let Some((child, level)) = stack.pop() {
            match child {
                Child::Leaf(l) => self.leaf_mut(l).depth = level,
                Child::Node(n) => {
                    let (left, right) = {
                        let node = self.node(n);
                        (node.left, node.right)
                    };
                    stack.push((left, level + 1));
                    stack.push((right, level + 1));
                }
            }
        }
    }

    /// Cheap heuristic rebalance: root the tree at the median of the axis of
    /// maximum variance of the stored tabulation points, then reinsert the
    /// leaves in shuffled order. Leaf payloads and usage counters survive.
    pub fn balance(&mut self, rng: &mut StdRng, weights: &DVector<f64>) {
        if self.size < 3 {
            return;
        }
        let dim = weights.len();
        let ids: Vec<usize> = self.leaf_ids().collect();
        let count = ids.len() as f64;

        let mut mean = vec![0.0; dim];
        for &id in &ids {
            for (i, m) in mean.iter_mut().enumerate() {
                *m += self.leaf(id).phi()[i];
            }
        }
        for m in mean.iter_mut() {
            *m /= count;
        }
        let mut axis = 0;
        let mut best = -1.0;
        for i in 0..dim {
            let var: f64 = ids
                .iter()
                .map(|&id| {
                    let d = self.leaf(id).phi()[i] - mean[i];
                    d * d
                })
                .sum();
            if var > best {
                best = var;
                axis = i;
            }
        }

        let mut values: Vec<f64> = ids.iter().map(|&id| self.leaf(id).phi()[axis]).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let median = values[values.len() / 2];

        let mut left_ids: Vec<usize> = Vec::new();
        let mut right_ids: Vec<usize> = Vec::new();
        for &id in &ids {
            if self.leaf(id).phi()[axis] <= median {
                left_ids.push(id);
            } else {
                right_ids.push(id);
            }
        }

        self.detach_structure();
        if left_ids.is_empty() || right_ids.is_empty() {
            // degenerate median split: plain shuffled reinsertion
            let mut all = ids;
            all.shuffle(rng);
            let mut sub_root = Child::Leaf(all[0]);
            for &id in &all[1..] {
                self.reattach(&mut sub_root, id, weights);
            }
            self.root = Some(sub_root);
        } else {
            left_ids.shuffle(rng);
            right_ids.shuffle(rng);
            let mut left = Child::Leaf(left_ids[0]);
            for &id in &left_ids[1..] {
                self.reattach(&mut left, id, weights);
            }
            let mut right = Child::Leaf(right_ids[0]);
            for &id in &right_ids[1..] {
                self.reattach(&mut right, id, weights);
            }

            let w = weights[axis] * weights[axis];
            let mut v = DVector::zeros(dim);
            v[axis] = w;
            let rid = self.alloc_node(Node {
                v,
                a: w * median,
                left,
                right,
                parent: None,
            });
            self.set_parent(left, Some(rid));
            self.set_parent(right, Some(rid));
            self.root = Some(Child::Node(rid));
        }
        self.assign_depths();
    }
}
