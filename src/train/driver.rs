//! Epoch loop shared by both training stages.
//!
//! ```text
//! per epoch:  reset meters
//!             for batch: to device → forward → backward → clip → step → meters
//!             schedule step
//! ```
//!
//! A fresh [`GradStore`](candle_core::backprop::GradStore) is produced by
//! every backward pass, so there is nothing to zero between steps. Only vars
//! handed to the optimizer change; everything else reachable from the loss
//! keeps its values.

use candle_core::{Device, Tensor};

use super::metrics::MetricLogger;
use super::optim::{CosineAnnealing, GroupedOptimizer, ParamGroup, clip_grad_norm};
use crate::Result;
use crate::config::{AdamConfig, TrainingConfig};
use crate::data::{Batch, Loader};

/// Loss of one step and the values to log for it.
pub struct StepOutput {
    pub loss: Tensor,
    pub meters: Vec<(&'static str, f64)>,
}

/// What a stage trains and how it scores a batch.
pub trait Objective {
    /// Trainable vars and their base learning rates.
    fn param_groups(&self) -> Result<Vec<ParamGroup>>;

    fn adam(&self) -> AdamConfig;

    fn forward(&self, batch: &Batch) -> Result<StepOutput>;
}

pub struct Trainer<'a, O: Objective> {
    objective: &'a O,
    optimizer: GroupedOptimizer,
    vars: Vec<candle_core::Var>,
    metrics: MetricLogger,
    device: Device,
    epochs: usize,
    max_grad_norm: f64,
}

impl<'a, O: Objective> Trainer<'a, O> {
    pub fn new(objective: &'a O, config: &TrainingConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let optimizer = GroupedOptimizer::new(
            objective.param_groups()?,
            objective.adam(),
            CosineAnnealing::new(config.epochs, config.min_lr),
        )?;
        let vars = optimizer.vars();
        Ok(Self {
            objective,
            optimizer,
            vars,
            metrics: MetricLogger::new(config.color),
            device: device.clone(),
            epochs: config.epochs,
            max_grad_norm: config.max_grad_norm,
        })
    }

    pub fn metrics(&self) -> &MetricLogger {
        &self.metrics
    }

    pub fn learning_rates(&self) -> Vec<(&'static str, f64)> {
        self.optimizer.learning_rates()
    }

    /// One optimizer step on `batch`. Returns the global gradient norm
    /// before clipping.
    pub fn step(&mut self, batch: &Batch) -> Result<f64> {
        let out = self.objective.forward(batch)?;
        let mut grads = out.loss.backward()?;
        let norm = clip_grad_norm(&self.vars, &mut grads, self.max_grad_norm)?;
        self.optimizer.step(&grads)?;

        let n = batch.batch_size();
        for (name, value) in out.meters {
            self.metrics.update(name, value, n);
        }
        Ok(norm)
    }

    /// Run every configured epoch over `loader`.
    pub fn fit(&mut self, loader: &mut Loader) -> Result<()> {
        for epoch in 0..self.epochs {
            self.metrics.reset();
            tracing::info!("{}", self.metrics.header(epoch, self.epochs));

            let batches = loader.epoch()?;
            let pb = self.metrics.progress_bar(batches.len())?;
            for host in batches {
                let batch = host?.to_device(&self.device)?;
                let norm = self.step(&batch)?;
                tracing::debug!("grad norm {norm:.4}");
                pb.set_message(self.metrics.status());
                pb.inc(1);
            }
            pb.finish_and_clear();

            self.optimizer.schedule_step();
            let lrs = self
                .learning_rates()
                .iter()
                .map(|(name, lr)| format!("{name} {lr:.3e}"))
                .collect::<Vec<_>>()
                .join(", ");
            tracing::info!(
                "epoch {}/{} done: {} | lr {}",
                epoch + 1,
                self.epochs,
                self.metrics.summary(),
                lrs
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::AudioDataset;
    use crate::data::dataset::DatasetOptions;
    use crate::data::dataset::tests::write_dummy_dataset;
    use crate::model::tokenizer::tests::toy_tokenizer;
    use candle_core::{DType, Var};
    use std::sync::Arc;

    /// Fits `scale · mean(mel)` to 1 while `frozen` only shifts the loss.
    struct ScaleFit {
        scale: Var,
        frozen: Var,
    }

    impl ScaleFit {
        fn new() -> Self {
            Self {
                scale: Var::new(&[0.5f32], &Device::Cpu).unwrap(),
                frozen: Var::new(&[2f32], &Device::Cpu).unwrap(),
            }
        }
    }

    impl Objective for ScaleFit {
        fn param_groups(&self) -> Result<Vec<ParamGroup>> {
            Ok(vec![ParamGroup::new("scale", vec![self.scale.clone()], 1e-2)])
        }

        fn adam(&self) -> AdamConfig {
            AdamConfig::sequence()
        }

        fn forward(&self, batch: &Batch) -> Result<StepOutput> {
            let mean = batch.audio_mel_specs.mean_all()?.reshape(1)?;
            let pred = self.scale.as_tensor().mul(&mean)?.add(self.frozen.as_tensor())?;
            let loss = (pred - 1.0)?.sqr()?.sum_all()?;
            let value = f64::from(loss.to_scalar::<f32>()?);
            Ok(StepOutput {
                loss,
                meters: vec![("loss", value)],
            })
        }
    }

    #[test]
    fn fit_runs_every_epoch_and_anneals() {
        let dir = tempfile::tempdir().unwrap();
        let list = write_dummy_dataset(dir.path());
        let dataset = AudioDataset::open(&list, toy_tokenizer(), &DatasetOptions::default()).unwrap();
        let mut loader = Loader::new(Arc::new(dataset), 2, 1, Some(0));

        let objective = ScaleFit::new();
        let config = TrainingConfig::default().with_epochs(2).with_batch_size(2);
        let mut trainer = Trainer::new(&objective, &config, &Device::Cpu).unwrap();
        let start: Vec<f32> = objective.scale.as_tensor().to_vec1().unwrap();
        trainer.fit(&mut loader).unwrap();

        let end: Vec<f32> = objective.scale.as_tensor().to_vec1().unwrap();
        assert_ne!(start, end);
        let frozen: Vec<f32> = objective.frozen.as_tensor().to_vec1().unwrap();
        assert_eq!(frozen, vec![2.0]);

        assert_eq!(trainer.metrics().names(), vec!["loss"]);
        let lrs = trainer.learning_rates();
        assert!((lrs[0].1 - config.min_lr).abs() < 1e-12);
    }

    #[test]
    fn step_clips_large_gradients() {
        let objective = ScaleFit::new();
        let config = TrainingConfig::default().with_epochs(1);
        let mut trainer = Trainer::new(&objective, &config, &Device::Cpu).unwrap();
        let batch = Batch {
            speakers: vec!["a".into()],
            text_input_ids: Tensor::zeros((1, 1), DType::U32, &Device::Cpu).unwrap(),
            text_attention_mask: Tensor::ones((1, 1), DType::U8, &Device::Cpu).unwrap(),
            audio_mel_specs: Tensor::full(100f32, (1, 2, 3), &Device::Cpu).unwrap(),
            audio_attention_mask: Tensor::ones((1, 1), DType::U8, &Device::Cpu).unwrap(),
        };
        let norm = trainer.step(&batch).unwrap();
        // d/dscale of (100·scale + 2 - 1)² at scale 0.5 = 2·51·100.
        assert!((norm - 10_200.0).abs() < 1e-1);
        assert!((trainer.metrics().meter("loss").unwrap().last() - 2601.0).abs() < 1e-2);
    }
}
