//! Dominator tree and dominance frontiers
//!
//! Lengauer-Tarjan in its simple form: semi-dominators over a DFS spanning
//! tree, bucketed back-linking, and an `eval` that walks ancestor chains
//! without path compression. Method bodies are small enough that the simple
//! variant's extra traversal cost never shows up in profiles.
//!
//! Frontiers come from the idom tree afterwards: for every join block, each
//! predecessor walks up its idom chain and collects the join until the walk
//! reaches the join's own idom.

use crate::cfg::Cfg;
use tracing::trace;

const UNDEFINED: usize = usize::MAX;

/// Dominance information for one control-flow graph
#[derive(Debug, Clone)]
pub struct DomTree {
    /// Immediate dominator of each block (`idom[0]` is 0 itself)
    pub idom: Vec<usize>,
    /// Children of each block in the dominator tree
    pub children: Vec<Vec<usize>>,
    /// Dominance frontier of each block
    pub frontier: Vec<Vec<usize>>,
}

impl DomTree {
    /// Compute dominators and frontiers for `cfg` (entry is block 0)
    pub fn build(cfg: &Cfg) -> Self {
        let n = cfg.len();
        let mut state = Semi::new(n);
        state.dfs(cfg, 0);

        // Process vertices in reverse DFS order, skipping the root.
        for i in (1..state.order.len()).rev() {
            let w = state.order[i];

            // Semi-dominator: minimum over predecessors of sdom(eval(pred)).
            for &v in &cfg.blocks[w].preds {
                if state.dfnum[v] == UNDEFINED {
                    continue;
                }
                let u = state.eval(v);
                if state.dfnum[state.sdom[u]] < state.dfnum[state.sdom[w]] {
                    state.sdom[w] = state.sdom[u];
                }
            }
            state.bucket[state.sdom[w]].push(w);
            state.ancestor[w] = state.parent[w];

            // Implicitly link w, then empty the parent's bucket.
            let parent = state.parent[w];
            for v in std::mem::take(&mut state.bucket[parent]) {
                let u = state.eval(v);
                state.idom[v] = if state.dfnum[state.sdom[u]] < state.dfnum[state.sdom[v]] {
                    u
                } else {
                    parent
                };
            }
        }

        // Deferred idoms become final in DFS order.
        for i in 1..state.order.len() {
            let w = state.order[i];
            if state.idom[w] != state.sdom[w] {
                state.idom[w] = state.idom[state.idom[w]];
            }
        }
        state.idom[0] = 0;

        let idom = state.idom;
        let mut children = vec![Vec::new(); n];
        for (block, &dominator) in idom.iter().enumerate().skip(1) {
            if dominator != UNDEFINED {
                children[dominator].push(block);
            }
        }

        let frontier = frontiers(cfg, &idom);
        trace!(blocks = n, "dominator tree built");
        DomTree {
            idom,
            children,
            frontier,
        }
    }

    /// Blocks in dominator-tree preorder starting at the entry
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.idom.len());
        let mut stack = vec![0usize];
        while let Some(block) = stack.pop() {
            order.push(block);
            for &child in self.children[block].iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// True if `a` dominates `b` (reflexive)
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            if cur == 0 {
                return a == 0;
            }
            cur = self.idom[cur];
        }
    }
}

/// Working state of the semi-dominator computation
struct Semi {
    /// DFS number of each block
    dfnum: Vec<usize>,
    /// Blocks in DFS order
    order: Vec<usize>,
    /// DFS spanning-tree parent
    parent: Vec<usize>,
    /// Semi-dominator candidate
    sdom: Vec<usize>,
    /// Forest link for `eval`
    ancestor: Vec<usize>,
    /// Deferred vertices keyed by semi-dominator
    bucket: Vec<Vec<usize>>,
    idom: Vec<usize>,
}

impl Semi {
    fn new(n: usize) -> Self {
        Semi {
            dfnum: vec![UNDEFINED; n],
            order: Vec::with_capacity(n),
            parent: vec![UNDEFINED; n],
            sdom: (0..n).collect(),
            ancestor: vec![UNDEFINED; n],
            bucket: vec![Vec::new(); n],
            idom: vec![UNDEFINED; n],
        }
    }

    fn dfs(&mut self, cfg: &Cfg, root: usize) {
        let mut stack = vec![(root, UNDEFINED)];
        while let Some((block, parent)) = stack.pop() {
            if self.dfnum[block] != UNDEFINED {
                continue;
            }
            self.parent[block] = parent;
            self.dfnum[block] = self.order.len();
            self.order.push(block);
            for &succ in cfg.blocks[block].succs.iter().rev() {
                if self.dfnum[succ] == UNDEFINED {
                    stack.push((succ, block));
                }
            }
        }
    }

    /// The ancestor of `v` with the minimum-numbered semi-dominator, by
    /// walking the ancestor chain (no path compression)
    fn eval(&self, v: usize) -> usize {
        let mut best = v;
        let mut cur = v;
        while self.ancestor[cur] != UNDEFINED {
            cur = self.ancestor[cur];
            if self.dfnum[self.sdom[cur]] < self.dfnum[self.sdom[best]] {
                best = cur;
            }
        }
        best
    }
}

/// Join-walk dominance frontiers over the finished idom tree
fn frontiers(cfg: &Cfg, idom: &[usize]) -> Vec<Vec<usize>> {
    let mut frontier = vec![Vec::new(); cfg.len()];
    for (join, block) in cfg.blocks.iter().enumerate() {
        if block.preds.len() < 2 {
            continue;
        }
        for &pred in &block.preds {
            let mut runner = pred;
            while runner != idom[join] {
                if !frontier[runner].contains(&join) {
                    frontier[runner].push(join);
                }
                if runner == idom[runner] {
                    break;
                }
                runner = idom[runner];
            }
        }
    }
    frontier
}
