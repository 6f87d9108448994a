// src/models/tree.rs
//
// Histogram-based regression tree on gradient/hessian statistics. The forest fits
// it on (-y, 1) pairs so leaves hold weighted default rates; boosting fits it on
// logloss gradients so leaves hold Newton steps.
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_BINS: usize = 64;

/// Quantile-binned copy of a feature matrix. Bin `b` of feature `j` holds values
/// `v` with `cuts[j][b-1] < v <= cuts[j][b]`.
#[derive(Debug, Clone)]
pub struct BinnedMatrix {
    n_cols: usize,
    bins: Vec<u8>,
    cuts: Vec<Vec<f64>>,
}

impl BinnedMatrix {
    /// Cut points come from `rows`; every row of `x` gets binned.
    pub fn build(x: &Array2<f64>, rows: &[usize], max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, 255);
        let n_cols = x.ncols();
        let mut cuts = Vec::with_capacity(n_cols);
        for j in 0..n_cols {
            let mut values: Vec<f64> = rows.iter().map(|&i| x[[i, j]]).collect();
            values.sort_by(|a, b| a.total_cmp(b));
            let mut uniques = values.clone();
            uniques.dedup();
            let column_cuts: Vec<f64> = if uniques.len() <= max_bins {
                uniques.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
            } else {
                let mut qs: Vec<f64> = (1..max_bins)
                    .map(|b| values[b * values.len() / max_bins])
                    .collect();
                qs.dedup();
                if let Some(max) = uniques.last() {
                    qs.retain(|c| c < max);
                }
                qs
            };
            cuts.push(column_cuts);
        }

        let mut bins = vec![0u8; x.nrows() * n_cols];
        for i in 0..x.nrows() {
            for j in 0..n_cols {
                bins[i * n_cols + j] = cuts[j].partition_point(|&c| c < x[[i, j]]) as u8;
            }
        }
        Self { n_cols, bins, cuts }
    }

    #[inline]
    pub fn bin(&self, row: usize, col: usize) -> usize {
        self.bins[row * self.n_cols + col] as usize
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    fn n_bins(&self, col: usize) -> usize {
        self.cuts[col].len() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: f64,
        cover: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        cover: f64,
    },
}

impl Node {
    pub fn cover(&self) -> f64 {
        match self {
            Node::Leaf { cover, .. } | Node::Split { cover, .. } => *cover,
        }
    }
}

/// A binary tree stored as a node arena; the root is node 0.
/// `cover` is the sum of training sample weights that reached a node, and a split's
/// cover is always the exact sum of its children's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.predict_with(|j| x[j])
    }

    pub(crate) fn predict_with<F: Fn(usize) -> f64>(&self, value_of: F) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value, .. } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if value_of(*feature) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Cover-weighted mean leaf value: the tree's output averaged over its training rows.
    pub fn expected_value(&self) -> f64 {
        let root_cover = self.nodes.first().map(Node::cover).unwrap_or(0.0);
        if root_cover <= 0.0 {
            return 0.0;
        }
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Leaf { value, cover } => Some(value * cover),
                Node::Split { .. } => None,
            })
            .sum::<f64>()
            / root_cover
    }

    pub fn scale_leaves(&mut self, factor: f64) {
        for node in self.nodes.iter_mut() {
            if let Node::Leaf { value, .. } = node {
                *value *= factor;
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Minimum hessian sum per child.
    pub min_child_weight: f64,
    /// L2 penalty on leaf values.
    pub lambda: f64,
    pub min_gain: f64,
    /// Features examined per split; `None` examines all of them.
    pub max_features: Option<usize>,
}

/// Per-row statistics the builder splits on. Indexed by row id.
pub struct GradientStats<'a> {
    pub grad: &'a [f64],
    pub hess: &'a [f64],
    pub cover: &'a [f64],
}

struct Candidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

pub struct TreeBuilder<'a> {
    binned: &'a BinnedMatrix,
    stats: GradientStats<'a>,
    params: &'a TreeParams,
    rng: &'a mut StdRng,
    nodes: Vec<Node>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        binned: &'a BinnedMatrix,
        stats: GradientStats<'a>,
        params: &'a TreeParams,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            binned,
            stats,
            params,
            rng,
            nodes: Vec::new(),
        }
    }

    /// Grows a tree over `rows`; a row may appear several times (bootstrap draws).
    pub fn grow(mut self, rows: Vec<usize>) -> Tree {
        if rows.is_empty() {
            return Tree {
                nodes: vec![Node::Leaf {
                    value: 0.0,
                    cover: 0.0,
                }],
            };
        }
        self.build(rows, 0);
        Tree { nodes: self.nodes }
    }

    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let (g, h, c) = rows.iter().fold((0.0, 0.0, 0.0), |acc, &i| {
            (
                acc.0 + self.stats.grad[i],
                acc.1 + self.stats.hess[i],
                acc.2 + self.stats.cover[i],
            )
        });
        let leaf_value = -g / (h + self.params.lambda).max(1e-12);
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: leaf_value,
            cover: c,
        });

        if depth >= self.params.max_depth || rows.len() < 2 * self.params.min_samples_leaf.max(1) {
            return idx;
        }
        let Some(best) = self.best_split(&rows, g, h) else {
            return idx;
        };

        let threshold = self.binned.cuts[best.feature][best.bin];
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&i| self.binned.bin(i, best.feature) <= best.bin);
        let left = self.build(left_rows, depth + 1);
        let right = self.build(right_rows, depth + 1);
        let cover = self.nodes[left].cover() + self.nodes[right].cover();
        self.nodes[idx] = Node::Split {
            feature: best.feature,
            threshold,
            left,
            right,
            cover,
        };
        idx
    }

    fn best_split(&mut self, rows: &[usize], g: f64, h: f64) -> Option<Candidate> {
        let n_cols = self.binned.n_cols();
        let features: Vec<usize> = match self.params.max_features {
            Some(k) if k < n_cols => {
                let mut picked = sample(self.rng, n_cols, k.max(1)).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..n_cols).collect(),
        };

        let lambda = self.params.lambda;
        let parent_score = g * g / (h + lambda).max(1e-12);
        let min_leaf = self.params.min_samples_leaf.max(1);
        let mut best: Option<Candidate> = None;

        for feature in features {
            let n_bins = self.binned.n_bins(feature);
            if n_bins < 2 {
                continue;
            }
            let mut hist_g = vec![0.0; n_bins];
            let mut hist_h = vec![0.0; n_bins];
            let mut hist_c = vec![0.0; n_bins];
            let mut hist_n = vec![0usize; n_bins];
            for &i in rows {
                let b = self.binned.bin(i, feature);
                hist_g[b] += self.stats.grad[i];
                hist_h[b] += self.stats.hess[i];
                hist_c[b] += self.stats.cover[i];
                hist_n[b] += 1;
            }

            let (mut gl, mut hl, mut cl, mut nl) = (0.0, 0.0, 0.0, 0usize);
            let total_c: f64 = hist_c.iter().sum();
            for b in 0..n_bins - 1 {
                gl += hist_g[b];
                hl += hist_h[b];
                cl += hist_c[b];
                nl += hist_n[b];
                let (gr, hr, cr, nr) = (g - gl, h - hl, total_c - cl, rows.len() - nl);
                if nl < min_leaf || nr < min_leaf {
                    continue;
                }
                if hl < self.params.min_child_weight || hr < self.params.min_child_weight {
                    continue;
                }
                if cl <= 0.0 || cr <= 0.0 {
                    continue;
                }
                let gain = gl * gl / (hl + lambda).max(1e-12) + gr * gr / (hr + lambda).max(1e-12)
                    - parent_score;
                if gain > self.params.min_gain && best.as_ref().map_or(true, |c| gain > c.gain) {
                    best = Some(Candidate { feature, bin: b, gain });
                }
            }
        }
        best
    }
}
