//! Particle graph connectivity.
//!
//! Edges are directed `sender → receiver` pairs supplied with every example.
//! Messages flow along the edge direction and are summed at the receiver.

use candle_core::{DType, Device, Tensor};

use crate::error::GnsError;
use crate::GnsResult;

/// Directed edge list with device-side index tensors
#[derive(Debug, Clone)]
pub struct EdgeIndex {
    senders: Vec<u32>,
    receivers: Vec<u32>,
    senders_t: Tensor,
    receivers_t: Tensor,
}

impl EdgeIndex {
    pub fn new(senders: Vec<u32>, receivers: Vec<u32>, device: &Device) -> GnsResult<Self> {
        if senders.len() != receivers.len() {
            return Err(GnsError::InvalidGraph(format!(
                "{} senders but {} receivers",
                senders.len(),
                receivers.len()
            )));
        }
        let senders_t = Tensor::from_vec(senders.clone(), senders.len(), device)?;
        let receivers_t = Tensor::from_vec(receivers.clone(), receivers.len(), device)?;
        Ok(Self {
            senders,
            receivers,
            senders_t,
            receivers_t,
        })
    }

    /// From `(sender, receiver)` pairs
    pub fn from_pairs(pairs: &[(usize, usize)], device: &Device) -> GnsResult<Self> {
        let mut senders = Vec::with_capacity(pairs.len());
        let mut receivers = Vec::with_capacity(pairs.len());
        for &(s, r) in pairs {
            senders.push(index_to_u32(s)?);
            receivers.push(index_to_u32(r)?);
        }
        Self::new(senders, receivers, device)
    }

    /// From a `[2, E]` integer tensor: row 0 senders, row 1 receivers
    pub fn from_tensor(edge_index: &Tensor, device: &Device) -> GnsResult<Self> {
        let (rows, _) = edge_index.dims2()?;
        if rows != 2 {
            return Err(GnsError::InvalidGraph(format!(
                "edge index must have 2 rows, got {}",
                rows
            )));
        }
        let rows: Vec<Vec<i64>> = edge_index.to_dtype(DType::I64)?.to_vec2()?;
        let convert = |row: &[i64]| -> GnsResult<Vec<u32>> {
            row.iter()
                .map(|&i| {
                    u32::try_from(i)
                        .map_err(|_| GnsError::InvalidGraph(format!("negative or huge node index {}", i)))
                })
                .collect()
        };
        Self::new(convert(&rows[0])?, convert(&rows[1])?, device)
    }

    /// Graph without edges
    pub fn empty(device: &Device) -> GnsResult<Self> {
        Self::new(Vec::new(), Vec::new(), device)
    }

    pub fn num_edges(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn senders(&self) -> &[u32] {
        &self.senders
    }

    pub fn receivers(&self) -> &[u32] {
        &self.receivers
    }

    pub fn senders_tensor(&self) -> &Tensor {
        &self.senders_t
    }

    pub fn receivers_tensor(&self) -> &Tensor {
        &self.receivers_t
    }

    /// Fail if any endpoint is not a valid node index
    pub fn validate(&self, num_nodes: usize) -> GnsResult<()> {
        let out_of_range = self
            .senders
            .iter()
            .chain(self.receivers.iter())
            .find(|&&i| i as usize >= num_nodes);
        match out_of_range {
            Some(i) => Err(GnsError::InvalidGraph(format!(
                "edge endpoint {} out of range for {} nodes",
                i, num_nodes
            ))),
            None => Ok(()),
        }
    }

    /// Shift every index by `offset` (used when collating examples)
    pub fn offset(&self, offset: usize, device: &Device) -> GnsResult<Self> {
        let offset = index_to_u32(offset)?;
        let shift = |v: &[u32]| v.iter().map(|i| i + offset).collect::<Vec<u32>>();
        Self::new(shift(&self.senders), shift(&self.receivers), device)
    }

    /// Concatenate edge lists whose indices already refer to one node set
    pub fn concat(parts: &[EdgeIndex], device: &Device) -> GnsResult<Self> {
        let senders = parts.iter().flat_map(|p| p.senders.iter().copied()).collect();
        let receivers = parts.iter().flat_map(|p| p.receivers.iter().copied()).collect();
        Self::new(senders, receivers, device)
    }

    pub fn to_device(&self, device: &Device) -> GnsResult<Self> {
        Ok(Self {
            senders: self.senders.clone(),
            receivers: self.receivers.clone(),
            senders_t: self.senders_t.to_device(device)?,
            receivers_t: self.receivers_t.to_device(device)?,
        })
    }

    /// `[2, E]` tensor of dtype I64
    pub fn to_tensor(&self, device: &Device) -> GnsResult<Tensor> {
        let mut flat: Vec<i64> = self.senders.iter().map(|&i| i as i64).collect();
        flat.extend(self.receivers.iter().map(|&i| i as i64));
        Ok(Tensor::from_vec(flat, (2, self.num_edges()), device)?)
    }
}

fn index_to_u32(i: usize) -> GnsResult<u32> {
    u32::try_from(i).map_err(|_| GnsError::InvalidGraph(format!("node index {} too large", i)))
}

/// Sum the rows of `messages` `[E, F]` into their receiver node, giving
/// `[num_nodes, F]`. Nodes without incoming edges get zeros.
pub fn aggregate_incoming(
    messages: &Tensor,
    edges: &EdgeIndex,
    num_nodes: usize,
) -> GnsResult<Tensor> {
    let (num_messages, features) = messages.dims2()?;
    if num_messages != edges.num_edges() {
        return Err(GnsError::DimensionMismatch {
            expected: edges.num_edges(),
            got: num_messages,
        });
    }
    let zeros = Tensor::zeros((num_nodes, features), messages.dtype(), messages.device())?;
    if edges.is_empty() {
        return Ok(zeros);
    }
    Ok(zeros.index_add(edges.receivers_tensor(), messages, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_sums_at_receivers() {
        let device = Device::Cpu;
        // 0 -> 1, 2 -> 1, 1 -> 0; node 2 has no incoming edges
        let edges = EdgeIndex::from_pairs(&[(0, 1), (2, 1), (1, 0)], &device).unwrap();
        let messages = Tensor::new(&[[1.0f32, 2.0], [10.0, 20.0], [5.0, 5.0]], &device).unwrap();

        let agg: Vec<Vec<f32>> = aggregate_incoming(&messages, &edges, 3)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(agg[0], vec![5.0, 5.0]);
        assert_eq!(agg[1], vec![11.0, 22.0]);
        assert_eq!(agg[2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_isolated_node_aggregates_to_zero() {
        let device = Device::Cpu;
        let edges = EdgeIndex::empty(&device).unwrap();
        let messages = Tensor::zeros((0, 4), DType::F32, &device).unwrap();
        let agg: Vec<Vec<f32>> = aggregate_incoming(&messages, &edges, 1)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(agg, vec![vec![0.0; 4]]);
    }

    #[test]
    fn test_from_tensor_and_validate() {
        let device = Device::Cpu;
        let t = Tensor::new(&[[0i64, 1, 2], [1, 2, 0]], &device).unwrap();
        let edges = EdgeIndex::from_tensor(&t, &device).unwrap();
        assert_eq!(edges.senders(), &[0, 1, 2]);
        assert_eq!(edges.receivers(), &[1, 2, 0]);
        assert!(edges.validate(3).is_ok());
        assert!(matches!(edges.validate(2), Err(GnsError::InvalidGraph(_))));

        let negative = Tensor::new(&[[0i64], [-1]], &device).unwrap();
        assert!(EdgeIndex::from_tensor(&negative, &device).is_err());
    }

    #[test]
    fn test_offset_and_concat() {
        let device = Device::Cpu;
        let a = EdgeIndex::from_pairs(&[(0, 1)], &device).unwrap();
        let b = EdgeIndex::from_pairs(&[(1, 0)], &device).unwrap().offset(2, &device).unwrap();
        let joined = EdgeIndex::concat(&[a, b], &device).unwrap();
        assert_eq!(joined.senders(), &[0, 3]);
        assert_eq!(joined.receivers(), &[1, 2]);

        let round: Vec<Vec<i64>> = joined.to_tensor(&device).unwrap().to_vec2().unwrap();
        assert_eq!(round, vec![vec![0, 3], vec![1, 2]]);
    }
}
