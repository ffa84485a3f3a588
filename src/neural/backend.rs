//! Channel-based batching backend for the evaluator.
//!
//! Several search instances can share one evaluator by routing their
//! batched computations through a background worker thread that coalesces
//! concurrent requests into larger evaluator calls.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::neural::network::{EncodedPosition, EvalError, NetworkComputation};

/// Raw per-position evaluator outputs: value heads plus the full policy
/// vector indexed by policy index.
#[derive(Debug, Clone)]
pub struct RawEval {
    pub q: f32,
    pub d: f32,
    pub m: f32,
    pub e: f32,
    pub policy: Vec<f32>,
}

struct EvalRequest {
    inputs: Vec<EncodedPosition>,
    reply: Sender<Result<Vec<RawEval>, EvalError>>,
}

/// Shared batching evaluator. Owns a worker thread that collects requests,
/// evaluates them in one call and dispatches the slices back.
#[derive(Debug, Clone)]
pub struct BatchingBackend {
    sender: Sender<EvalRequest>,
}

impl BatchingBackend {
    /// Starts the background worker. `eval_fn` receives the concatenated
    /// inputs of every coalesced request.
    pub fn new<F>(eval_fn: F, max_batch: usize) -> Self
    where
        F: Fn(&[EncodedPosition]) -> Result<Vec<RawEval>, EvalError> + Send + 'static,
    {
        let (sender, receiver): (Sender<EvalRequest>, Receiver<EvalRequest>) = unbounded();

        thread::spawn(move || {
            let mut requests: Vec<EvalRequest> = Vec::new();
            loop {
                // Wait for the first request, then collect more without
                // blocking until the batch is full or the window closes.
                match receiver.recv() {
                    Ok(request) => requests.push(request),
                    Err(_) => break,
                }
                let window = Instant::now();
                let mut total: usize = requests.iter().map(|r| r.inputs.len()).sum();
                while total < max_batch && window.elapsed() < Duration::from_micros(500) {
                    match receiver.try_recv() {
                        Ok(request) => {
                            total += request.inputs.len();
                            requests.push(request);
                        }
                        Err(_) => thread::yield_now(),
                    }
                }

                let inputs: Vec<EncodedPosition> = requests
                    .iter()
                    .flat_map(|r| r.inputs.iter().cloned())
                    .collect();
                let outcome = eval_fn(&inputs);

                let mut offset = 0;
                for request in requests.drain(..) {
                    let len = request.inputs.len();
                    let slice = match &outcome {
                        Ok(all) => Ok(all[offset..offset + len].to_vec()),
                        Err(e) => Err(EvalError::Backend(e.to_string())),
                    };
                    offset += len;
                    let _ = request.reply.send(slice);
                }
            }
            log::debug!("evaluator backend worker shutting down");
        });

        BatchingBackend { sender }
    }

    /// A fresh computation routed through this backend.
    pub fn new_computation(&self) -> BackendComputation {
        BackendComputation {
            sender: self.sender.clone(),
            inputs: Vec::new(),
            results: Vec::new(),
        }
    }
}

/// One batched computation against a [`BatchingBackend`].
pub struct BackendComputation {
    sender: Sender<EvalRequest>,
    inputs: Vec<EncodedPosition>,
    results: Vec<RawEval>,
}

impl NetworkComputation for BackendComputation {
    fn add_input(&mut self, input: EncodedPosition) {
        self.inputs.push(input);
    }

    fn batch_size(&self) -> usize {
        self.inputs.len()
    }

    fn compute_blocking(&mut self) -> Result<(), EvalError> {
        if self.inputs.is_empty() {
            return Ok(());
        }
        let (reply, response) = bounded(1);
        self.sender
            .send(EvalRequest {
                inputs: std::mem::take(&mut self.inputs),
                reply,
            })
            .map_err(|_| EvalError::Disconnected)?;
        self.results = response.recv().map_err(|_| EvalError::Disconnected)??;
        Ok(())
    }

    fn get_q(&self, idx: usize) -> f32 {
        self.results[idx].q
    }

    fn get_d(&self, idx: usize) -> f32 {
        self.results[idx].d
    }

    fn get_m(&self, idx: usize) -> f32 {
        self.results[idx].m
    }

    fn get_e(&self, idx: usize) -> f32 {
        self.results[idx].e
    }

    fn get_p(&self, idx: usize, policy_index: usize) -> f32 {
        self.results[idx].policy[policy_index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted(q: f32) -> BatchingBackend {
        BatchingBackend::new(
            move |inputs| {
                Ok(inputs
                    .iter()
                    .map(|_| RawEval {
                        q,
                        d: 0.0,
                        m: 1.0,
                        e: 0.0,
                        policy: vec![0.0; 8],
                    })
                    .collect())
            },
            16,
        )
    }

    #[test]
    fn computation_roundtrips_through_worker() {
        let backend = scripted(0.5);
        let mut comp = backend.new_computation();
        comp.add_input(EncodedPosition { planes: vec![1.0] });
        comp.add_input(EncodedPosition { planes: vec![2.0] });
        assert_eq!(comp.batch_size(), 2);
        comp.compute_blocking().unwrap();
        assert_eq!(comp.get_q(0), 0.5);
        assert_eq!(comp.get_q(1), 0.5);
        assert_eq!(comp.get_m(1), 1.0);
    }

    #[test]
    fn empty_computation_is_a_no_op() {
        let backend = scripted(0.0);
        let mut comp = backend.new_computation();
        comp.compute_blocking().unwrap();
        assert_eq!(comp.batch_size(), 0);
    }
}
