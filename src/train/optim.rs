//! Parameter groups, gradient clipping and the per-epoch cosine schedule.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::AdamConfig;

/// Vars sharing one base learning rate.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: &'static str,
    pub vars: Vec<Var>,
    pub lr: f64,
}

impl ParamGroup {
    pub fn new(name: &'static str, vars: Vec<Var>, lr: f64) -> Self {
        Self { name, vars, lr }
    }

    pub fn num_elements(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }
}

/// Cosine annealing from each group's base rate down to `floor` over
/// `epochs` epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineAnnealing {
    pub epochs: usize,
    pub floor: f64,
}

impl CosineAnnealing {
    pub fn new(epochs: usize, floor: f64) -> Self {
        Self { epochs, floor }
    }

    pub fn lr_at(&self, base: f64, epoch: usize) -> f64 {
        let progress = epoch.min(self.epochs) as f64 / self.epochs.max(1) as f64;
        self.floor + (base - self.floor) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
    }
}

struct Group {
    name: &'static str,
    base_lr: f64,
    vars: Vec<Var>,
    optimizer: AdamW,
}

/// One AdamW state per parameter group, stepped together.
pub struct GroupedOptimizer {
    groups: Vec<Group>,
    schedule: CosineAnnealing,
    epoch: usize,
}

impl GroupedOptimizer {
    pub fn new(groups: Vec<ParamGroup>, adam: AdamConfig, schedule: CosineAnnealing) -> Result<Self> {
        let mut built = Vec::with_capacity(groups.len());
        for group in groups {
            if group.vars.is_empty() {
                tracing::warn!("parameter group {} is empty, skipping", group.name);
                continue;
            }
            tracing::debug!(
                "parameter group {}: {} tensors, {} elements, lr {}",
                group.name,
                group.vars.len(),
                group.num_elements(),
                group.lr
            );
            let optimizer = AdamW::new(
                group.vars.clone(),
                ParamsAdamW {
                    lr: group.lr,
                    beta1: adam.beta1,
                    beta2: adam.beta2,
                    eps: adam.eps,
                    weight_decay: adam.weight_decay,
                },
            )?;
            built.push(Group {
                name: group.name,
                base_lr: group.lr,
                vars: group.vars,
                optimizer,
            });
        }
        if built.is_empty() {
            candle_core::bail!("no trainable parameters");
        }
        Ok(Self {
            groups: built,
            schedule,
            epoch: 0,
        })
    }

    /// Every optimized var, across groups.
    pub fn vars(&self) -> Vec<Var> {
        self.groups.iter().flat_map(|g| g.vars.iter().cloned()).collect()
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for group in &mut self.groups {
            group.optimizer.step(grads)?;
        }
        Ok(())
    }

    /// Advance the schedule by one completed epoch.
    pub fn schedule_step(&mut self) {
        self.epoch += 1;
        for group in &mut self.groups {
            let lr = self.schedule.lr_at(group.base_lr, self.epoch);
            group.optimizer.set_learning_rate(lr);
        }
    }

    /// Current rate of each group.
    pub fn learning_rates(&self) -> Vec<(&'static str, f64)> {
        self.groups
            .iter()
            .map(|g| (g.name, g.optimizer.learning_rate()))
            .collect()
    }
}

/// Scale the gradients of `vars` so their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += f64::from(grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
    }
    let norm = total.sqrt();
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let scaled = (grad * coef)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn cosine_endpoints() {
        let schedule = CosineAnnealing::new(10, 1e-7);
        assert!((schedule.lr_at(1e-3, 0) - 1e-3).abs() < 1e-15);
        assert!((schedule.lr_at(1e-3, 10) - 1e-7).abs() < 1e-15);
        let mid = schedule.lr_at(1e-3, 5);
        assert!((mid - (1e-7 + (1e-3 - 1e-7) / 2.0)).abs() < 1e-12);
        let lrs: Vec<f64> = (0..=10).map(|e| schedule.lr_at(1e-3, e)).collect();
        assert!(lrs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn clipping_bounds_norm() {
        let device = Device::Cpu;
        let a = Var::new(&[1f32, 2.0], &device).unwrap();
        let b = Var::new(&[3f32], &device).unwrap();
        // d/dx of 10·Σx = 10 per element → norm 10·√3.
        let loss = ((a.sum_all().unwrap() + b.sum_all().unwrap()).unwrap() * 10.0).unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];

        let before = clip_grad_norm(&vars, &mut grads, 1.0).unwrap();
        assert!((before - 10.0 * 3f64.sqrt()).abs() < 1e-4);

        let mut after = 0f32;
        for v in &vars {
            let g = grads.get(v.as_tensor()).unwrap();
            after += g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        }
        assert!(after.sqrt() <= 1.0 + 1e-5);
    }

    #[test]
    fn small_gradients_pass_through() {
        let device = Device::Cpu;
        let a = Var::new(&[1f32, 2.0], &device).unwrap();
        let loss = (a.sum_all().unwrap() * 0.1).unwrap();
        let mut grads = loss.backward().unwrap();
        clip_grad_norm(&[a.clone()], &mut grads, 1.0).unwrap();
        let g: Vec<f32> = grads.get(a.as_tensor()).unwrap().to_vec1().unwrap();
        assert!(g.iter().all(|&x| (x - 0.1).abs() < 1e-6));
    }

    #[test]
    fn groups_keep_their_rates() {
        let device = Device::Cpu;
        let gpt = Var::new(&[1f32, 1.0], &device).unwrap();
        let spk = Var::new(&[1f32], &device).unwrap();
        let mut opt = GroupedOptimizer::new(
            vec![
                ParamGroup::new("gpt", vec![gpt.clone()], 1e-3),
                ParamGroup::new("speaker", vec![spk.clone()], 1e-1),
                ParamGroup::new("empty", vec![], 1.0),
            ],
            AdamConfig::sequence(),
            CosineAnnealing::new(2, 1e-7),
        )
        .unwrap();
        assert_eq!(opt.learning_rates(), vec![("gpt", 1e-3), ("speaker", 1e-1)]);
        assert_eq!(opt.vars().len(), 2);

        let loss = (gpt.sum_all().unwrap() + spk.sum_all().unwrap()).unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();
        // Adam's first step moves each weight by about its learning rate.
        let g: Vec<f32> = gpt.as_tensor().to_vec1().unwrap();
        let s: Vec<f32> = spk.as_tensor().to_vec1().unwrap();
        assert!((g[0] - (1.0 - 1e-3)).abs() < 1e-4);
        assert!((s[0] - (1.0 - 1e-1)).abs() < 1e-3);

        opt.schedule_step();
        opt.schedule_step();
        for (_, lr) in opt.learning_rates() {
            assert!((lr - 1e-7).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_optimizer_is_an_error() {
        let schedule = CosineAnnealing::new(1, 0.0);
        assert!(GroupedOptimizer::new(vec![], AdamConfig::sequence(), schedule).is_err());
    }
}
