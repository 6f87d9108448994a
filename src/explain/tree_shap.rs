// src/explain/tree_shap.rs
//
// Exact path-dependent TreeSHAP. Runs in O(leaves * depth^2) per tree and uses the
// training cover of each node to weight the branch an absent feature would take.
use crate::models::tree::{Node, Tree};

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    pweight: f64,
}

/// Adds `scale * φ(x)` for one tree into `phi`. The values satisfy
/// `Σ φ = tree(x) - tree.expected_value()`.
pub fn tree_shap(tree: &Tree, x: &[f64], phi: &mut [f64], scale: f64) {
    if tree.nodes.is_empty() {
        return;
    }
    recurse(tree, x, phi, scale, 0, Vec::with_capacity(tree.depth() + 2), 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    tree: &Tree,
    x: &[f64],
    phi: &mut [f64],
    scale: f64,
    node: usize,
    mut path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    extend(&mut path, zero_fraction, one_fraction, feature);

    match &tree.nodes[node] {
        Node::Leaf { value, .. } => {
            for i in 1..path.len() {
                let weight = unwound_sum(&path, i);
                let element = path[i];
                if let Some(f) = element.feature {
                    phi[f] += weight * (element.one_fraction - element.zero_fraction) * value * scale;
                }
            }
        }
        Node::Split {
            feature: split_feature,
            threshold,
            left,
            right,
            cover,
        } => {
            let (hot, cold) = if x[*split_feature] <= *threshold {
                (*left, *right)
            } else {
                (*right, *left)
            };
            let fraction = |child: usize| {
                if *cover > 0.0 {
                    tree.nodes[child].cover() / cover
                } else {
                    0.0
                }
            };
            let (hot_zero, cold_zero) = (fraction(hot), fraction(cold));

            // A feature already on the path is undone so it appears once.
            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            if let Some(k) = (1..path.len()).find(|&k| path[k].feature == Some(*split_feature)) {
                incoming_zero = path[k].zero_fraction;
                incoming_one = path[k].one_fraction;
                unwind(&mut path, k);
            }

            recurse(
                tree,
                x,
                phi,
                scale,
                hot,
                path.clone(),
                hot_zero * incoming_zero,
                incoming_one,
                Some(*split_feature),
            );
            recurse(
                tree,
                x,
                phi,
                scale,
                cold,
                path,
                cold_zero * incoming_zero,
                0.0,
                Some(*split_feature),
            );
        }
    }
}

fn extend(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        pweight: if depth == 0 { 1.0 } else { 0.0 },
    });
    for i in (0..depth).rev() {
        path[i + 1].pweight += one_fraction * path[i].pweight * (i + 1) as f64 / (depth + 1) as f64;
        path[i].pweight = zero_fraction * path[i].pweight * (depth - i) as f64 / (depth + 1) as f64;
    }
}

fn unwind(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let mut next_one_portion = path[depth].pweight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].pweight;
            path[i].pweight = next_one_portion * (depth + 1) as f64 / ((i + 1) as f64 * one_fraction);
            next_one_portion = tmp - path[i].pweight * zero_fraction * (depth - i) as f64 / (depth + 1) as f64;
        } else {
            path[i].pweight = path[i].pweight * (depth + 1) as f64 / (zero_fraction * (depth - i) as f64);
        }
    }
    for i in index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

fn unwound_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let mut next_one_portion = path[depth].pweight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = next_one_portion * (depth + 1) as f64 / ((i + 1) as f64 * one_fraction);
            total += tmp;
            next_one_portion = path[i].pweight - tmp * zero_fraction * (depth - i) as f64 / (depth + 1) as f64;
        } else if zero_fraction != 0.0 {
            total += path[i].pweight / zero_fraction / ((depth - i) as f64 / (depth + 1) as f64);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(value: f64, cover: f64) -> Node {
        Node::Leaf { value, cover }
    }

    fn split(feature: usize, threshold: f64, left: usize, right: usize, cover: f64) -> Node {
        Node::Split {
            feature,
            threshold,
            left,
            right,
            cover,
        }
    }

    /// Expected tree output when only the features in `known` are observed.
    fn conditional_value(tree: &Tree, x: &[f64], known: &[bool], node: usize) -> f64 {
        match &tree.nodes[node] {
            Node::Leaf { value, .. } => *value,
            Node::Split {
                feature,
                threshold,
                left,
                right,
                cover,
            } => {
                if known[*feature] {
                    let next = if x[*feature] <= *threshold { *left } else { *right };
                    conditional_value(tree, x, known, next)
                } else {
                    let l = tree.nodes[*left].cover() / cover;
                    let r = tree.nodes[*right].cover() / cover;
                    l * conditional_value(tree, x, known, *left) + r * conditional_value(tree, x, known, *right)
                }
            }
        }
    }

    fn factorial(n: usize) -> f64 {
        (1..=n).map(|k| k as f64).product()
    }

    fn brute_force(tree: &Tree, x: &[f64]) -> Vec<f64> {
        let m = x.len();
        let mut phi = vec![0.0; m];
        for i in 0..m {
            for mask in 0..(1usize << m) {
                if mask & (1 << i) != 0 {
                    continue;
                }
                let mut known: Vec<bool> = (0..m).map(|j| mask & (1 << j) != 0).collect();
                let size = known.iter().filter(|k| **k).count();
                let weight = factorial(size) * factorial(m - size - 1) / factorial(m);
                let without = conditional_value(tree, x, &known, 0);
                known[i] = true;
                let with = conditional_value(tree, x, &known, 0);
                phi[i] += weight * (with - without);
            }
        }
        phi
    }

    fn sample_tree() -> Tree {
        // Depth 3, feature 0 repeated on one path.
        Tree {
            nodes: vec![
                split(0, 0.5, 1, 2, 10.0),
                split(1, 1.5, 3, 4, 6.0),
                split(2, 0.0, 5, 6, 4.0),
                leaf(0.1, 2.0),
                split(0, 0.2, 7, 8, 4.0),
                leaf(0.7, 1.0),
                leaf(0.9, 3.0),
                leaf(-0.3, 1.5),
                leaf(0.4, 2.5),
            ],
        }
    }

    #[test]
    fn test_matches_brute_force_shapley_values() {
        let tree = sample_tree();
        let inputs = [
            [0.1, 2.0, -1.0, 5.0],
            [0.3, 2.0, 1.0, 0.0],
            [0.9, 0.0, -1.0, 1.0],
            [0.9, 3.0, 1.0, -2.0],
        ];
        for x in inputs {
            let mut phi = vec![0.0; 4];
            tree_shap(&tree, &x, &mut phi, 1.0);
            let expected = brute_force(&tree, &x);
            for (a, b) in phi.iter().zip(&expected) {
                assert!((a - b).abs() < 1e-9, "{:?} vs {:?} for {:?}", phi, expected, x);
            }
            // Unused feature gets nothing.
            assert!(phi[3].abs() < 1e-12);
        }
    }

    #[test]
    fn test_efficiency_and_scale() {
        let tree = sample_tree();
        let x = [0.3, 2.0, 1.0, 0.0];
        let mut phi = vec![0.0; 4];
        tree_shap(&tree, &x, &mut phi, 2.0);
        let total: f64 = phi.iter().sum();
        assert!((total - 2.0 * (tree.predict(&x) - tree.expected_value())).abs() < 1e-9);
    }

    #[test]
    fn test_single_leaf_contributes_nothing() {
        let tree = Tree {
            nodes: vec![leaf(0.42, 5.0)],
        };
        let mut phi = vec![0.0; 2];
        tree_shap(&tree, &[1.0, 2.0], &mut phi, 1.0);
        assert_eq!(phi, vec![0.0, 0.0]);
    }
}
