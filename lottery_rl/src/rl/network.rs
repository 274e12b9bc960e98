// src/rl/network.rs
//
// Parametric value/policy network for the function-approximation agent.
//
//   x (B, 10)
//   -> dense(10, H) -> row-normalize -> relu
//   -> dense(H, H)  -> relu
//   -> value head   dense(H, A)   Q(s, slot)
//   -> field1 head  dense(H, n1)  logits over field1 numbers
//   -> field2 head  dense(H, n2)  logits over field2 numbers
//
// Row normalization is computed per sample, so a batch of one behaves exactly
// like any row of a larger batch. Parameters are explicit `Var`s initialized
// from the caller's RNG; the target network is a plain tensor copy that never
// shares storage with the online weights. Adam moments live here so they can
// be persisted with the weights.

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::Linear;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

const NORM_EPS: f64 = 1e-5;
const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Parameter names in canonical order.
const PARAM_NAMES: [&str; 10] = [
    "fc1.weight",
    "fc1.bias",
    "fc2.weight",
    "fc2.bias",
    "value.weight",
    "value.bias",
    "field1.weight",
    "field1.bias",
    "field2.weight",
    "field2.bias",
];

/// Layer sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDims {
    pub input: usize,
    pub hidden: usize,
    pub action_slots: usize,
    pub field1: usize,
    pub field2: usize,
}

impl NetworkDims {
    fn shapes(&self) -> [Vec<usize>; 10] {
        let NetworkDims {
            input,
            hidden,
            action_slots,
            field1,
            field2,
        } = *self;
        // Weights are (out, in), the layout `candle_nn::Linear` expects.
        [
            vec![hidden, input],
            vec![hidden],
            vec![hidden, hidden],
            vec![hidden],
            vec![action_slots, hidden],
            vec![action_slots],
            vec![field1, hidden],
            vec![field1],
            vec![field2, hidden],
            vec![field2],
        ]
    }
}

/// Network outputs for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkOutput {
    pub q: Vec<f32>,
    pub field1_probs: Vec<f32>,
    pub field2_probs: Vec<f32>,
}

/// One learning batch, already flattened.
#[derive(Debug, Clone, Default)]
pub struct TrainBatch {
    /// (B * input) features.
    pub states: Vec<f32>,
    /// Action slot per row.
    pub slots: Vec<usize>,
    /// Bellman target per row.
    pub targets: Vec<f32>,
    /// (B * field1) multi-hot of the chosen numbers.
    pub field1_chosen: Vec<f32>,
    /// (B * field2) multi-hot of the chosen numbers.
    pub field2_chosen: Vec<f32>,
    /// Per-row advantage for the field-head likelihood term.
    pub advantages: Vec<f32>,
}

impl TrainBatch {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Serialized tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorBlob {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Weights, target weights and optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub dims: NetworkDims,
    pub online: Vec<TensorBlob>,
    pub target: Vec<TensorBlob>,
    pub adam_m: Vec<TensorBlob>,
    pub adam_v: Vec<TensorBlob>,
    pub adam_step: u64,
}

struct Outputs {
    q: Tensor,
    field1_logits: Tensor,
    field2_logits: Tensor,
}

pub struct QNetwork {
    dims: NetworkDims,
    device: Device,
    online: Vec<Var>,
    target: Vec<Tensor>,
    adam_m: Vec<Tensor>,
    adam_v: Vec<Tensor>,
    adam_step: u64,
}

impl QNetwork {
    /// Xavier-uniform weights, zero biases; target starts as a copy.
    pub fn new<R: Rng + ?Sized>(dims: NetworkDims, rng: &mut R) -> EngineResult<Self> {
        let device = Device::Cpu;
        let mut online = Vec::with_capacity(PARAM_NAMES.len());
        for shape in dims.shapes() {
            let numel: usize = shape.iter().product();
            let data: Vec<f32> = if shape.len() == 2 {
                let limit = (6.0 / (shape[0] + shape[1]) as f64).sqrt() as f32;
                (0..numel).map(|_| rng.gen_range(-limit..=limit)).collect()
            } else {
                vec![0.0; numel]
            };
            online.push(Var::from_vec(data, shape, &device)?);
        }
        let mut net = Self {
            dims,
            device,
            online,
            target: Vec::new(),
            adam_m: Vec::new(),
            adam_v: Vec::new(),
            adam_step: 0,
        };
        net.sync_target()?;
        net.reset_optimizer()?;
        Ok(net)
    }

    pub fn dims(&self) -> NetworkDims {
        self.dims
    }

    /// Number of optimizer updates applied so far.
    pub fn optimizer_steps(&self) -> u64 {
        self.adam_step
    }

    /// Hard-copy online weights into the target network.
    pub fn sync_target(&mut self) -> EngineResult<()> {
        self.target = self
            .online
            .iter()
            .map(|v| detached_copy(v.as_tensor(), &self.device))
            .collect::<EngineResult<_>>()?;
        Ok(())
    }

    fn reset_optimizer(&mut self) -> EngineResult<()> {
        self.adam_m = self
            .online
            .iter()
            .map(|v| Tensor::zeros(v.shape(), DType::F32, &self.device))
            .collect::<candle_core::Result<_>>()?;
        self.adam_v = self.adam_m.clone();
        self.adam_step = 0;
        Ok(())
    }

    /// Online network outputs for a single state.
    pub fn predict(&self, features: &[f32]) -> EngineResult<NetworkOutput> {
        let mut rows = self.predict_batch(&[features.to_vec()])?;
        rows.pop()
            .ok_or_else(|| EngineError::computation("empty network output"))
    }

    /// Online network outputs, one entry per input row.
    pub fn predict_batch(&self, rows: &[Vec<f32>]) -> EngineResult<Vec<NetworkOutput>> {
        let xs = self.input_tensor(rows)?;
        let params = self.online_params();
        let out = forward(&params, &xs)?;
        let q = out.q.to_vec2::<f32>()?;
        let p1 = candle_nn::ops::softmax(&out.field1_logits, D::Minus1)?.to_vec2::<f32>()?;
        let p2 = candle_nn::ops::softmax(&out.field2_logits, D::Minus1)?.to_vec2::<f32>()?;
        let outputs: Vec<NetworkOutput> = q
            .into_iter()
            .zip(p1)
            .zip(p2)
            .map(|((q, field1_probs), field2_probs)| NetworkOutput {
                q,
                field1_probs,
                field2_probs,
            })
            .collect();
        if outputs.iter().any(|o| o.q.iter().any(|v| !v.is_finite())) {
            return Err(EngineError::computation("non-finite network output"));
        }
        Ok(outputs)
    }

    /// max_a Q_target(s, a) per row.
    pub fn target_max_q(&self, rows: &[Vec<f32>]) -> EngineResult<Vec<f32>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let xs = self.input_tensor(rows)?;
        let out = forward(&self.target, &xs)?;
        Ok(out.q.max(D::Minus1)?.to_vec1::<f32>()?)
    }

    /// One optimizer step on `batch`; returns the loss before the update.
    ///
    /// A non-finite loss leaves the weights and optimizer state untouched.
    pub fn train_step(
        &mut self,
        batch: &TrainBatch,
        learning_rate: f64,
        max_grad_norm: f64,
        policy_weight: f64,
    ) -> EngineResult<f32> {
        let b = batch.len();
        if b == 0 {
            return Err(EngineError::computation("empty training batch"));
        }
        let dims = self.dims;
        let xs = Tensor::from_vec(batch.states.clone(), (b, dims.input), &self.device)?;
        let mut slot_mask = vec![0f32; b * dims.action_slots];
        for (row, &slot) in batch.slots.iter().enumerate() {
            slot_mask[row * dims.action_slots + slot.min(dims.action_slots - 1)] = 1.0;
        }
        let slot_mask = Tensor::from_vec(slot_mask, (b, dims.action_slots), &self.device)?;
        let targets = Tensor::from_vec(batch.targets.clone(), (b, 1), &self.device)?;

        let params = self.online_params();
        let out = forward(&params, &xs)?;
        let q_sa = out.q.mul(&slot_mask)?.sum_keepdim(1)?;
        let mut loss = candle_nn::loss::mse(&q_sa, &targets)?;

        if policy_weight > 0.0 {
            let mask1 = Tensor::from_vec(batch.field1_chosen.clone(), (b, dims.field1), &self.device)?;
            let mask2 = Tensor::from_vec(batch.field2_chosen.clone(), (b, dims.field2), &self.device)?;
            let adv = Tensor::from_vec(batch.advantages.clone(), (b, 1), &self.device)?;
            let lp1 = candle_nn::ops::log_softmax(&out.field1_logits, D::Minus1)?
                .mul(&mask1)?
                .sum_keepdim(1)?;
            let lp2 = candle_nn::ops::log_softmax(&out.field2_logits, D::Minus1)?
                .mul(&mask2)?
                .sum_keepdim(1)?;
            let likelihood = lp1.add(&lp2)?.mul(&adv)?.mean_all()?;
            loss = loss.add(&likelihood.affine(-policy_weight, 0.0)?)?;
        }

        let loss_value = loss.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            return Err(EngineError::computation(format!(
                "non-finite loss {}",
                loss_value
            )));
        }

        let grads = loss.backward()?;
        let mut collected: Vec<Option<Tensor>> = Vec::with_capacity(self.online.len());
        let mut sq_norm = 0f64;
        for var in &self.online {
            let g = grads.get(var.as_tensor()).cloned();
            if let Some(g) = &g {
                sq_norm += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
            collected.push(g);
        }
        let norm = sq_norm.sqrt();
        if !norm.is_finite() {
            return Err(EngineError::computation("non-finite gradient norm"));
        }
        let clip = if norm > max_grad_norm && max_grad_norm > 0.0 {
            max_grad_norm / (norm + 1e-6)
        } else {
            1.0
        };

        self.adam_step += 1;
        let t = self.adam_step as i32;
        let bias1 = 1.0 - ADAM_BETA1.powi(t);
        let bias2 = 1.0 - ADAM_BETA2.powi(t);
        for (i, g) in collected.into_iter().enumerate() {
            let Some(g) = g else { continue };
            let g = g.affine(clip, 0.0)?;
            let m = self.adam_m[i]
                .affine(ADAM_BETA1, 0.0)?
                .add(&g.affine(1.0 - ADAM_BETA1, 0.0)?)?;
            let v = self.adam_v[i]
                .affine(ADAM_BETA2, 0.0)?
                .add(&g.sqr()?.affine(1.0 - ADAM_BETA2, 0.0)?)?;
            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let v_hat = v.affine(1.0 / bias2, 0.0)?;
            let update = m_hat
                .div(&v_hat.sqrt()?.affine(1.0, ADAM_EPS)?)?
                .affine(learning_rate, 0.0)?;
            let current = detached_copy(self.online[i].as_tensor(), &self.device)?;
            self.online[i].set(&current.sub(&update)?)?;
            self.adam_m[i] = m;
            self.adam_v[i] = v;
        }
        Ok(loss_value)
    }

    pub fn snapshot(&self) -> EngineResult<NetworkSnapshot> {
        let online: Vec<Tensor> = self.online.iter().map(|v| v.as_tensor().clone()).collect();
        Ok(NetworkSnapshot {
            dims: self.dims,
            online: to_blobs(&online)?,
            target: to_blobs(&self.target)?,
            adam_m: to_blobs(&self.adam_m)?,
            adam_v: to_blobs(&self.adam_v)?,
            adam_step: self.adam_step,
        })
    }

    /// Rebuild a network; every blob must match the expected names and shapes.
    pub fn from_snapshot(snap: &NetworkSnapshot) -> EngineResult<Self> {
        let device = Device::Cpu;
        let shapes = snap.dims.shapes();
        let online = from_blobs(&snap.online, &shapes, &device)?
            .iter()
            .map(Var::from_tensor)
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            dims: snap.dims,
            online,
            target: from_blobs(&snap.target, &shapes, &device)?,
            adam_m: from_blobs(&snap.adam_m, &shapes, &device)?,
            adam_v: from_blobs(&snap.adam_v, &shapes, &device)?,
            adam_step: snap.adam_step,
            device,
        })
    }

    fn online_params(&self) -> Vec<Tensor> {
        self.online.iter().map(|v| v.as_tensor().clone()).collect()
    }

    fn input_tensor(&self, rows: &[Vec<f32>]) -> EngineResult<Tensor> {
        let input = self.dims.input;
        if rows.iter().any(|r| r.len() != input) {
            return Err(EngineError::computation(format!(
                "feature vector length differs from {}",
                input
            )));
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (rows.len(), input), &self.device)?)
    }
}

fn forward(p: &[Tensor], xs: &Tensor) -> candle_core::Result<Outputs> {
    let h = dense(xs, &p[0], &p[1])?;
    let h = row_normalize(&h)?.relu()?;
    let h = dense(&h, &p[2], &p[3])?.relu()?;
    Ok(Outputs {
        q: dense(&h, &p[4], &p[5])?,
        field1_logits: dense(&h, &p[6], &p[7])?,
        field2_logits: dense(&h, &p[8], &p[9])?,
    })
}

fn dense(xs: &Tensor, w: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    Linear::new(w.clone(), Some(b.clone())).forward(xs)
}

/// Parameter-free layer norm. Spelled out in tensor ops because the fused
/// `candle_nn::ops::layer_norm` kernel has no backward pass.
fn row_normalize(h: &Tensor) -> candle_core::Result<Tensor> {
    let mean = h.mean_keepdim(D::Minus1)?;
    let centered = h.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&var.affine(1.0, NORM_EPS)?.sqrt()?)
}

/// Copy into fresh storage with no autograd history.
fn detached_copy(t: &Tensor, device: &Device) -> EngineResult<Tensor> {
    let data = t.flatten_all()?.to_vec1::<f32>()?;
    Ok(Tensor::from_vec(data, t.dims().to_vec(), device)?)
}

fn to_blobs(tensors: &[Tensor]) -> EngineResult<Vec<TensorBlob>> {
    tensors
        .iter()
        .zip(PARAM_NAMES)
        .map(|(t, name)| {
            Ok(TensorBlob {
                name: name.to_string(),
                shape: t.dims().to_vec(),
                data: t.flatten_all()?.to_vec1::<f32>()?,
            })
        })
        .collect()
}

fn from_blobs(
    blobs: &[TensorBlob],
    shapes: &[Vec<usize>; 10],
    device: &Device,
) -> EngineResult<Vec<Tensor>> {
    if blobs.len() != PARAM_NAMES.len() {
        return Err(EngineError::computation(format!(
            "expected {} tensors, found {}",
            PARAM_NAMES.len(),
            blobs.len()
        )));
    }
    blobs
        .iter()
        .zip(PARAM_NAMES)
        .zip(shapes.iter())
        .map(|((blob, name), shape)| {
            let numel: usize = shape.iter().product();
            if blob.name != name || &blob.shape != shape || blob.data.len() != numel {
                return Err(EngineError::computation(format!(
                    "tensor {} does not match {} {:?}",
                    blob.name, name, shape
                )));
            }
            if blob.data.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::computation(format!(
                    "tensor {} holds non-finite values",
                    name
                )));
            }
            Ok(Tensor::from_vec(blob.data.clone(), shape.clone(), device)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn dims() -> NetworkDims {
        NetworkDims {
            input: 10,
            hidden: 8,
            action_slots: 16,
            field1: 20,
            field2: 12,
        }
    }

    fn features(seed: u64) -> Vec<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..10).map(|_| rng.gen_range(0.0..1.0)).collect()
    }

    #[test]
    fn outputs_have_expected_shapes_and_distributions() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net = QNetwork::new(dims(), &mut rng).unwrap();
        let out = net.predict(&features(2)).unwrap();
        assert_eq!(out.q.len(), 16);
        assert_eq!(out.field1_probs.len(), 20);
        assert_eq!(out.field2_probs.len(), 12);
        let s1: f32 = out.field1_probs.iter().sum();
        assert!((s1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn single_row_matches_batched_inference() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net = QNetwork::new(dims(), &mut rng).unwrap();
        let rows = vec![features(3), features(4), features(5)];
        let batched = net.predict_batch(&rows).unwrap();
        for (row, expected) in rows.iter().zip(&batched) {
            let single = net.predict(row).unwrap();
            for (a, b) in single.q.iter().zip(&expected.q) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn target_is_independent_until_synced() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut net = QNetwork::new(dims(), &mut rng).unwrap();
        let rows = vec![features(6)];
        let before = net.target_max_q(&rows).unwrap();

        let batch = TrainBatch {
            states: features(6),
            slots: vec![3],
            targets: vec![5.0],
            field1_chosen: vec![0.0; 20],
            field2_chosen: vec![0.0; 12],
            advantages: vec![0.0],
        };
        for _ in 0..5 {
            net.train_step(&batch, 1e-2, 1.0, 0.0).unwrap();
        }
        assert_eq!(net.target_max_q(&rows).unwrap(), before);
        net.sync_target().unwrap();
        assert_ne!(net.target_max_q(&rows).unwrap(), before);
    }

    #[test]
    fn training_moves_q_toward_target() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut net = QNetwork::new(dims(), &mut rng).unwrap();
        let x = features(8);
        let batch = TrainBatch {
            states: [x.clone(), x.clone()].concat(),
            slots: vec![2, 2],
            targets: vec![3.0, 3.0],
            field1_chosen: vec![0.0; 40],
            field2_chosen: vec![0.0; 24],
            advantages: vec![0.0, 0.0],
        };
        let first = net.train_step(&batch, 1e-2, 10.0, 0.0).unwrap();
        let mut last = first;
        for _ in 0..100 {
            last = net.train_step(&batch, 1e-2, 10.0, 0.0).unwrap();
        }
        assert!(last < first, "loss {} -> {}", first, last);
        assert_eq!(net.optimizer_steps(), 101);
    }

    #[test]
    fn snapshot_restores_identical_outputs() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net = QNetwork::new(dims(), &mut rng).unwrap();
        let snap = net.snapshot().unwrap();
        let restored = QNetwork::from_snapshot(&snap).unwrap();
        let x = features(9);
        assert_eq!(net.predict(&x).unwrap(), restored.predict(&x).unwrap());

        let mut broken = snap.clone();
        broken.online[0].data.pop();
        assert!(QNetwork::from_snapshot(&broken).is_err());
    }
}
