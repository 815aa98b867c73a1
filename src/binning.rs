//! Resistance tolerance bins.
//!
//! Edges sit at `target * (1 + i * step)` for `i` in `-k..=k`. They are
//! labelled 'A', 'B', ... from the centre outwards and a value takes the label
//! of its nearest edge. This is nearest-edge classification, not interval
//! membership: anything beyond the outermost edges still gets the outermost
//! letter.

use crate::constants::{BIN_RANGE, BIN_STEP, TARGET_RESISTANCE};
use crate::error::{Result, SweepError};

const LABELS: &[u8; 26] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinEdge {
    /// Signed step index, 0 at the target
    pub index: i32,
    pub resistance: f64,
    pub label: char,
}

/// Precomputed bin edges, built once and handed to whoever classifies
#[derive(Debug, Clone, PartialEq)]
pub struct BinTable {
    target: f64,
    edges: Vec<BinEdge>,
}

impl Default for BinTable {
    fn default() -> Self {
        // The constants always describe 11 edges, well under the label limit.
        Self::build(TARGET_RESISTANCE, BIN_STEP, 5)
    }
}

impl BinTable {
    /// Build the table for `target` ohms with edges every `step` (fraction of
    /// target) out to `range` on either side.
    pub fn new(target: f64, step: f64, range: f64) -> Result<Self> {
        if !(target.is_finite() && target > 0.0) {
            return Err(SweepError::Config(format!("bin target must be positive, got {}", target)));
        }
        if !(step.is_finite() && step > 0.0) || !(range.is_finite() && range >= 0.0) {
            return Err(SweepError::Config(format!(
                "invalid bin step {} / range {}",
                step, range
            )));
        }

        // Absorb representation error so 0.01 / 0.002 counts as 5 steps.
        let k = (range / step + 1e-9).floor() as usize;
        if 2 * k + 1 > LABELS.len() {
            return Err(SweepError::Config(format!(
                "{} bins exceed the {} available labels",
                2 * k + 1,
                LABELS.len()
            )));
        }
        Ok(Self::build(target, step, k as i32))
    }

    fn build(target: f64, step: f64, k: i32) -> Self {
        let mut indices: Vec<i32> = (-k..=k).collect();
        // Equal distances resolve lower edge first.
        indices.sort_by_key(|&i| (i.abs(), i));

        let edges = indices
            .into_iter()
            .enumerate()
            .map(|(rank, index)| BinEdge {
                index,
                resistance: target * (1.0 + index as f64 * step),
                label: LABELS[rank] as char,
            })
            .collect();

        BinTable { target, edges }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Edges in label order
    pub fn edges(&self) -> &[BinEdge] {
        &self.edges
    }

    pub fn labels(&self) -> Vec<char> {
        self.edges.iter().map(|e| e.label).collect()
    }

    /// Label of the edge nearest to `resistance`.
    ///
    /// Infinite values take the outermost edge on their side; NaN is treated
    /// as far above the target.
    pub fn bin(&self, resistance: f64) -> char {
        if resistance.is_nan() || resistance.is_infinite() {
            let outermost = if resistance == f64::NEG_INFINITY {
                self.edges.iter().min_by_key(|e| e.index)
            } else {
                self.edges.iter().max_by_key(|e| e.index)
            };
            return outermost.map_or('A', |e| e.label);
        }

        let mut best = &self.edges[0];
        let mut best_distance = (resistance - best.resistance).abs();
        for edge in &self.edges[1..] {
            let distance = (resistance - edge.resistance).abs();
            if distance < best_distance {
                best = edge;
                best_distance = distance;
            }
        }
        best.label
    }
}
