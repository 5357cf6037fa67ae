//! # Collective communication
//!
//! Data-parallel training runs one trainer per rank. Ranks share nothing but
//! the operations of [`Collective`]: barriers, sums and broadcasts of flat
//! `f32` buffers. Every rank must issue the same sequence of collective
//! calls; a rank that skips one leaves the others waiting.
//!
//! ```text
//! rank 0 ──┐                     ┌──► Σ grads / W
//! rank 1 ──┼──► all_reduce_sum ──┼──► Σ grads / W
//! rank 2 ──┘                     └──► Σ grads / W
//! ```
//!
//! [`SingleProcess`] is the trivial group of one. [`ThreadGroup`] connects
//! ranks running as threads of one process.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use crate::error::GnsError;
use crate::GnsResult;

pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn barrier(&self) -> GnsResult<()>;

    /// Element-wise sum over all ranks, written back into `values`
    fn all_reduce_sum(&self, values: &mut [f32]) -> GnsResult<()>;

    /// Copy `root`'s `values` to every rank
    fn broadcast(&self, values: &mut [f32], root: usize) -> GnsResult<()>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> GnsResult<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, _values: &mut [f32]) -> GnsResult<()> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f32], root: usize) -> GnsResult<()> {
        if root != 0 {
            return Err(GnsError::Collective(format!("broadcast root {} out of range", root)));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

/// Ranks of one process, one [`ThreadCollective`] handle per thread
#[derive(Debug)]
pub struct ThreadGroup;

impl ThreadGroup {
    /// One handle per rank, in rank order
    pub fn new(world_size: usize) -> GnsResult<Vec<ThreadCollective>> {
        if world_size == 0 {
            return Err(GnsError::InvalidConfig("world size must be positive".to_string()));
        }
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        Ok((0..world_size)
            .map(|rank| ThreadCollective {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ThreadCollective {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl ThreadCollective {
    fn slots(&self) -> GnsResult<std::sync::MutexGuard<'_, Vec<Vec<f32>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| GnsError::Collective(format!("rank {}: slot lock poisoned", self.rank)))
    }
}

impl Collective for ThreadCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> GnsResult<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_reduce_sum(&self, values: &mut [f32]) -> GnsResult<()> {
        self.slots()?[self.rank] = values.to_vec();
        self.barrier()?;
        {
            let slots = self.slots()?;
            for (rank, slot) in slots.iter().enumerate() {
                if slot.len() != values.len() {
                    return Err(GnsError::Collective(format!(
                        "rank {} contributed {} values, rank {} expected {}",
                        rank,
                        slot.len(),
                        self.rank,
                        values.len()
                    )));
                }
            }
            values.iter_mut().for_each(|v| *v = 0.0);
            for slot in slots.iter() {
                for (v, s) in values.iter_mut().zip(slot.iter()) {
                    *v += s;
                }
            }
        }
        // slots stay untouched until every rank has read them
        self.barrier()
    }

    fn broadcast(&self, values: &mut [f32], root: usize) -> GnsResult<()> {
        if root >= self.world_size {
            return Err(GnsError::Collective(format!("broadcast root {} out of range", root)));
        }
        if self.rank == root {
            self.slots()?[root] = values.to_vec();
        }
        self.barrier()?;
        if self.rank != root {
            let slots = self.slots()?;
            if slots[root].len() != values.len() {
                return Err(GnsError::Collective(format!(
                    "broadcast of {} values into buffer of {}",
                    slots[root].len(),
                    values.len()
                )));
            }
            values.copy_from_slice(&slots[root]);
        }
        self.barrier()
    }
}

/// Average a scalar over all ranks
pub fn mean_over_ranks(collective: &dyn Collective, value: f64) -> GnsResult<f64> {
    let mut buffer = [value as f32];
    collective.all_reduce_sum(&mut buffer)?;
    Ok(buffer[0] as f64 / collective.world_size() as f64)
}

/// True on every rank when any rank raised `flag`
pub fn any_rank(collective: &dyn Collective, flag: bool) -> GnsResult<bool> {
    let mut buffer = [if flag { 1.0f32 } else { 0.0 }];
    collective.all_reduce_sum(&mut buffer)?;
    Ok(buffer[0] > 0.0)
}

/// Replace every gradient with its mean over ranks.
///
/// `vars` must be in the same order on every rank; a parameter without a
/// gradient contributes zeros.
pub fn sync_gradients(
    collective: &dyn Collective,
    vars: &[(String, Var)],
    grads: &mut GradStore,
) -> GnsResult<()> {
    let world_size = collective.world_size();
    if world_size == 1 {
        return Ok(());
    }

    let mut flat = Vec::new();
    for (_, var) in vars {
        match grads.get(var.as_tensor()) {
            Some(grad) => flat.extend(grad.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?),
            None => flat.extend(std::iter::repeat(0.0f32).take(var.elem_count())),
        }
    }
    collective.all_reduce_sum(&mut flat)?;

    let scale = 1.0 / world_size as f32;
    let mut offset = 0;
    for (_, var) in vars {
        let count = var.elem_count();
        let mean: Vec<f32> = flat[offset..offset + count].iter().map(|v| v * scale).collect();
        offset += count;
        let grad = Tensor::from_vec(mean, var.dims(), var.device())?.to_dtype(var.dtype())?;
        grads.insert(var.as_tensor(), grad);
    }
    Ok(())
}

/// Overwrite every rank's parameters with those of rank 0
pub fn broadcast_parameters(collective: &dyn Collective, vars: &[(String, Var)]) -> GnsResult<()> {
    if collective.world_size() == 1 {
        return Ok(());
    }
    let mut flat = Vec::new();
    for (_, var) in vars {
        flat.extend(var.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?);
    }
    collective.broadcast(&mut flat, 0)?;

    let mut offset = 0;
    for (_, var) in vars {
        let count = var.elem_count();
        let values = flat[offset..offset + count].to_vec();
        offset += count;
        var.set(&Tensor::from_vec(values, var.dims(), var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Cooperative stop request shared between the signal handler and trainers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use std::thread;

    #[test]
    fn test_thread_group_all_reduce() {
        let handles = ThreadGroup::new(3).unwrap();
        let results: Vec<Vec<f32>> = thread::scope(|s| {
            let workers: Vec<_> = handles
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut values = vec![c.rank() as f32, 1.0];
                        c.all_reduce_sum(&mut values).unwrap();
                        // a second round reuses the slots
                        let mut again = vec![2.0f32];
                        c.all_reduce_sum(&mut again).unwrap();
                        values.push(again[0]);
                        values
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec![3.0, 3.0, 6.0]);
        }
    }

    #[test]
    fn test_thread_group_broadcast_and_flags() {
        let handles = ThreadGroup::new(2).unwrap();
        let results: Vec<(Vec<f32>, bool, f64)> = thread::scope(|s| {
            let workers: Vec<_> = handles
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut values = if c.is_root() { vec![7.0, 8.0] } else { vec![0.0, 0.0] };
                        c.broadcast(&mut values, 0).unwrap();
                        let stop = any_rank(c, c.rank() == 1).unwrap();
                        let mean = mean_over_ranks(c, c.rank() as f64 * 2.0).unwrap();
                        (values, stop, mean)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        for (values, stop, mean) in results {
            assert_eq!(values, vec![7.0, 8.0]);
            assert!(stop);
            assert!((mean - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_sync_gradients_averages() {
        let handles = ThreadGroup::new(2).unwrap();
        let grads: Vec<Vec<f32>> = thread::scope(|s| {
            let workers: Vec<_> = handles
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let varmap = VarMap::new();
                        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
                        let w = vb.get(2, "w").unwrap();
                        let vars: Vec<(String, Var)> = varmap
                            .data()
                            .lock()
                            .unwrap()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        let scale = (c.rank() + 1) as f64;
                        let mut store = (w.sum_all().unwrap() * scale).unwrap().backward().unwrap();
                        sync_gradients(c, &vars, &mut store).unwrap();
                        store.get(&w).unwrap().to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        for g in grads {
            assert_eq!(g, vec![1.5, 1.5]);
        }
    }

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
