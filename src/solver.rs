//! Partitioning solvers.
//!
//! The pipeline only depends on [`GraphPartitioner`]; any k-way partitioner
//! (an external library binding, a closure in a test) can be plugged in.
//! [`SequentialPartitioner`] is the built-in default.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    error::{Error, Result},
    partition::{PartitionRequest, Partitioning},
};

/// A blocking k-way graph partitioner.
pub trait GraphPartitioner {
    /// Assigns every node of `request` to a part. `parts[i]` is the part of
    /// node `i`; fewer parts than requested may be returned.
    fn part_graph(&self, request: &PartitionRequest) -> Result<Partitioning>;
}

impl<F> GraphPartitioner for F
where
    F: Fn(&PartitionRequest) -> Result<Partitioning>,
{
    fn part_graph(&self, request: &PartitionRequest) -> Result<Partitioning> {
        self(request)
    }
}

/// Cuts the node sequence into consecutive runs of similar weight.
///
/// Node indices follow trace order, which is a topological order, so a
/// neighbour with a lower index is a predecessor. Every assignment made here
/// keeps `part(u) <= part(v)` for predecessor `u` of `v`, which makes the
/// induced partition graph acyclic.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialPartitioner;

impl GraphPartitioner for SequentialPartitioner {
    fn part_graph(&self, request: &PartitionRequest) -> Result<Partitioning> {
        let n = request.len();
        if request.adjacency.len() != n {
            return Err(Error::partitioning(format!(
                "adjacency has {} rows for {} weights",
                request.adjacency.len(),
                n
            )));
        }
        if let Some(bad) = request.adjacency.iter().flatten().find(|&&u| u >= n) {
            return Err(Error::partitioning(format!("neighbour {} out of range", bad)));
        }
        if n == 0 {
            return Ok(Partitioning {
                n_parts: 0,
                parts: Vec::new(),
            });
        }
        if request.n_parts == 0 {
            return Err(Error::partitioning("zero parts requested"));
        }

        // Nothing measured: balance node counts instead.
        let weights = if request.weights.iter().all(|&w| w == 0) {
            vec![1; n]
        } else {
            request.weights.clone()
        };
        let mut parts = balanced_runs(&weights, request.n_parts);
        if request.contiguous {
            connect_runs(&request.adjacency, &weights, &mut parts);
        }
        Ok(compact(parts))
    }
}

/// Part of each node when cutting the prefix sums into `k` equal slices,
/// judged at each node's weight midpoint.
fn balanced_runs(weights: &[u64], k: usize) -> Vec<usize> {
    let total: u128 = weights.iter().map(|&w| w as u128).sum();
    let k = k as u128;
    let mut prefix = 0u128;
    weights
        .iter()
        .map(|&w| {
            let doubled_mid = 2 * prefix + w as u128;
            prefix += w as u128;
            ((doubled_mid * k) / (2 * total)).min(k - 1) as usize
        })
        .collect()
}

/// Connected components of the nodes currently in `part`, in order of
/// their first member.
fn components(adjacency: &[Vec<usize>], parts: &[usize], part: usize) -> Vec<Vec<usize>> {
    let mut seen = vec![false; parts.len()];
    let mut out = Vec::new();
    for start in 0..parts.len() {
        if parts[start] != part || seen[start] {
            continue;
        }
        seen[start] = true;
        let mut component = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            component.push(v);
            for &u in &adjacency[v] {
                if parts[u] == part && !seen[u] {
                    seen[u] = true;
                    queue.push_back(u);
                }
            }
        }
        component.sort_unstable();
        out.push(component);
    }
    out
}

/// Keeps the heaviest component of each part in place and moves every other
/// component next to a neighbouring part: after its latest predecessor, or
/// when it has none, into its earliest successor. Components with no
/// outside neighbours at all stay where they are.
fn connect_runs(adjacency: &[Vec<usize>], weights: &[u64], parts: &mut [usize]) {
    let k = parts.iter().copied().max().map_or(0, |m| m + 1);
    for part in 0..k {
        let comps = components(adjacency, parts, part);
        if comps.len() <= 1 {
            continue;
        }
        let weight_of = |c: &[usize]| c.iter().map(|&v| weights[v] as u128).sum::<u128>();
        let anchor = comps
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| weight_of(a).cmp(&weight_of(b)).then(ib.cmp(ia)))
            .map(|(i, _)| i)
            .unwrap_or(0);
        for (i, comp) in comps.iter().enumerate() {
            if i == anchor {
                continue;
            }
            let view: &[usize] = parts;
            let latest_pred = comp
                .iter()
                .flat_map(|&v| outside_neighbours(adjacency, view, part, v).filter(move |&u| u < v))
                .map(|u| view[u])
                .max();
            let earliest_succ = comp
                .iter()
                .flat_map(|&v| outside_neighbours(adjacency, view, part, v).filter(move |&u| u > v))
                .map(|u| view[u])
                .min();
            let Some(target) = latest_pred.or(earliest_succ) else {
                continue;
            };
            for &v in comp {
                parts[v] = target;
            }
        }
    }
}

fn outside_neighbours<'a>(
    adjacency: &'a [Vec<usize>],
    parts: &'a [usize],
    part: usize,
    v: usize,
) -> impl Iterator<Item = usize> + 'a {
    adjacency[v].iter().copied().filter(move |&u| parts[u] != part)
}

/// Renames the used part ids to `0..m`, keeping their order.
fn compact(parts: Vec<usize>) -> Partitioning {
    let mut rename = BTreeMap::new();
    for &p in &parts {
        rename.entry(p).or_insert(0);
    }
    for (slot, id) in rename.values_mut().zip(0..) {
        *slot = id;
    }
    let parts = parts.into_iter().map(|p| rename[&p]).collect();
    Partitioning {
        n_parts: rename.len(),
        parts,
    }
}
